//! JSON parser for the realtime position feed.

use serde_json::Value;

use crate::error::{PipelineError, Result};

const RECORD_LIST_KEY: &str = "realtimePositionList";
const ENVELOPE_KEY: &str = "errorMessage";

/// One train position as served by the feed, codes still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPositionRecord {
    pub subway_name: String,
    pub train_no: String,
    pub station_name: String,
    pub terminal_station_name: String,
    pub status_code: String,
    pub direction_code: String,
}

/// The status envelope that accompanies every feed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatus {
    pub status: String,
    pub code: String,
    pub message: String,
}

/// Everything one fetch yields: the ordered positions and their shared envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub status: FeedStatus,
    pub positions: Vec<RawPositionRecord>,
}

/// Decodes a feed response body into a [`FeedSnapshot`].
///
/// # Errors
///
/// Returns [`PipelineError::UpstreamMalformed`] if the body is not JSON, or
/// if the record list, the status envelope, or any of their fields is absent.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedSnapshot> {
    let json: Value = serde_json::from_slice(bytes)
        .map_err(|e| PipelineError::UpstreamMalformed(format!("body is not JSON: {e}")))?;

    let Some(envelope) = json.get(ENVELOPE_KEY) else {
        return Err(missing_key(&json, ENVELOPE_KEY));
    };
    let status = FeedStatus {
        status: field(envelope, ENVELOPE_KEY, "status")?,
        code: field(envelope, ENVELOPE_KEY, "code")?,
        message: field(envelope, ENVELOPE_KEY, "message")?,
    };

    let Some(items) = json.get(RECORD_LIST_KEY).and_then(Value::as_array) else {
        return Err(missing_key(&json, RECORD_LIST_KEY));
    };

    let positions = items
        .iter()
        .map(|item| {
            Ok(RawPositionRecord {
                subway_name: field(item, RECORD_LIST_KEY, "subwayNm")?,
                train_no: field(item, RECORD_LIST_KEY, "trainNo")?,
                station_name: field(item, RECORD_LIST_KEY, "statnNm")?,
                terminal_station_name: field(item, RECORD_LIST_KEY, "statnTnm")?,
                status_code: field(item, RECORD_LIST_KEY, "trainSttus")?,
                direction_code: field(item, RECORD_LIST_KEY, "updnLine")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FeedSnapshot { status, positions })
}

/// Reads `key` from `obj` as text. The feed mostly serves strings, but some
/// deployments send the envelope status and the codes as bare numbers.
fn field(obj: &Value, parent: &str, key: &str) -> Result<String> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(PipelineError::UpstreamMalformed(format!(
            "`{parent}` entry has a non-text `{key}`: {other}"
        ))),
        None => Err(PipelineError::UpstreamMalformed(format!(
            "`{parent}` entry has no `{key}`"
        ))),
    }
}

/// When the feed has no data it answers with a bare top-level status triple
/// instead of the envelope; surface its code and message if present.
fn missing_key(json: &Value, key: &str) -> PipelineError {
    let code = json.get("code").and_then(Value::as_str);
    let message = json.get("message").and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => PipelineError::UpstreamMalformed(format!(
            "response has no `{key}` (upstream said {code}: {message})"
        )),
        _ => PipelineError::UpstreamMalformed(format!("response has no `{key}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(positions: &str) -> String {
        format!(
            r#"{{
                "errorMessage": {{"status": 200, "code": "INFO-000", "message": "정상 처리되었습니다.", "total": 2}},
                "realtimePositionList": {positions}
            }}"#
        )
    }

    #[test]
    fn test_parse_valid_feed() {
        let json = body(
            r#"[
                {"subwayId": "1003", "subwayNm": "3호선", "trainNo": "3101", "statnNm": "교대", "statnTnm": "오금", "trainSttus": "1", "updnLine": "0"},
                {"subwayId": "1003", "subwayNm": "3호선", "trainNo": "3102", "statnNm": "옥수", "statnTnm": "대화", "trainSttus": "2", "updnLine": "1"}
            ]"#,
        );
        let snapshot = parse_feed(json.as_bytes()).unwrap();

        assert_eq!(snapshot.status.status, "200");
        assert_eq!(snapshot.status.code, "INFO-000");
        assert_eq!(snapshot.status.message, "정상 처리되었습니다.");
        assert_eq!(snapshot.positions.len(), 2);
        assert_eq!(snapshot.positions[0].train_no, "3101");
        assert_eq!(snapshot.positions[0].station_name, "교대");
        assert_eq!(snapshot.positions[1].terminal_station_name, "대화");
        assert_eq!(snapshot.positions[1].direction_code, "1");
    }

    #[test]
    fn test_numeric_codes_become_text() {
        let json = body(
            r#"[{"subwayNm": "3호선", "trainNo": 3101, "statnNm": "교대", "statnTnm": "오금", "trainSttus": 5, "updnLine": 9}]"#,
        );
        let snapshot = parse_feed(json.as_bytes()).unwrap();

        assert_eq!(snapshot.positions[0].train_no, "3101");
        assert_eq!(snapshot.positions[0].status_code, "5");
        assert_eq!(snapshot.positions[0].direction_code, "9");
    }

    #[test]
    fn test_empty_list_is_valid() {
        let snapshot = parse_feed(body("[]").as_bytes()).unwrap();
        assert!(snapshot.positions.is_empty());
    }

    #[test]
    fn test_missing_record_list() {
        let json = r#"{"errorMessage": {"status": 200, "code": "INFO-000", "message": "ok"}}"#;
        let err = parse_feed(json.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamMalformed(_)));
        assert!(err.to_string().contains("realtimePositionList"));
    }

    #[test]
    fn test_missing_envelope_reports_upstream_code() {
        let json = r#"{"status": 500, "code": "INFO-200", "message": "해당하는 데이터가 없습니다."}"#;
        let err = parse_feed(json.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamMalformed(_)));
        assert!(err.to_string().contains("INFO-200"));
    }

    #[test]
    fn test_missing_record_field() {
        let json = body(r#"[{"subwayNm": "3호선", "trainNo": "3101", "statnNm": "교대", "statnTnm": "오금", "trainSttus": "1"}]"#);
        let err = parse_feed(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("updnLine"));
    }

    #[test]
    fn test_boolean_code_is_rejected() {
        let json = body(
            r#"[{"subwayNm": "3호선", "trainNo": "3101", "statnNm": "교대", "statnTnm": "오금", "trainSttus": true, "updnLine": "0"}]"#,
        );
        let err = parse_feed(json.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamMalformed(_)));
        assert!(err.to_string().contains("trainSttus"));
    }

    #[test]
    fn test_not_json() {
        let err = parse_feed(b"<html>502 Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamMalformed(_)));
    }
}
