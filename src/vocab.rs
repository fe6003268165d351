//! Display vocabulary for the coded fields of the realtime position feed.
//!
//! Lookups never fail: a code outside a table is handed back as-is and the
//! caller decides whether that is worth reporting.

/// `updnLine` codes.
///
/// | Code | Label       |
/// |------|-------------|
/// | 0    | 상행/내선   |
/// | 1    | 하행/외선   |
static DIRECTIONS: &[(&str, &str)] = &[("0", "상행/내선"), ("1", "하행/외선")];

/// `trainSttus` codes.
///
/// | Code | Label     |
/// |------|-----------|
/// | 0    | 진입      |
/// | 1    | 도착      |
/// | 2    | 출발      |
/// | 3    | 전역출발  |
static TRAIN_STATUSES: &[(&str, &str)] = &[
    ("0", "진입"),
    ("1", "도착"),
    ("2", "출발"),
    ("3", "전역출발"),
];

static LINES: &[(&str, &str)] = &[
    ("1001", "1호선"),
    ("1002", "2호선"),
    ("1003", "3호선"),
    ("1004", "4호선"),
    ("1005", "5호선"),
    ("1006", "6호선"),
    ("1007", "7호선"),
    ("1008", "8호선"),
];

fn lookup(table: &'static [(&'static str, &'static str)], code: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, label)| *label)
}

/// Label for a direction code, or `None` when the code is not in the table.
pub fn direction_label(code: &str) -> Option<&'static str> {
    lookup(DIRECTIONS, code)
}

/// Label for a train status code, or `None` when the code is not in the table.
pub fn train_status_label(code: &str) -> Option<&'static str> {
    lookup(TRAIN_STATUSES, code)
}

/// Resolves a subway id such as `1003` to the line name the feed filters on.
/// Anything else is assumed to already be a line name.
pub fn resolve_line(line: &str) -> &str {
    lookup(LINES, line).unwrap_or(line)
}
