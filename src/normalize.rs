//! Normalizer: raw feed positions to the record shape both sinks consume.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::parser::{FeedSnapshot, FeedStatus, RawPositionRecord};
use crate::vocab::{direction_label, train_status_label};

/// A position with its codes translated and the feed envelope flattened in.
///
/// Serialized field names are the hand-off artifact's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    #[serde(rename = "subwayNm")]
    pub subway_name: String,
    #[serde(rename = "trainNo")]
    pub train_no: String,
    #[serde(rename = "statnNm")]
    pub station_name: String,
    #[serde(rename = "statnTnm")]
    pub terminal_station_name: String,
    #[serde(rename = "trainSttus")]
    pub train_status: String,
    #[serde(rename = "updnLine")]
    pub direction: String,
    pub status: String,
    pub code: String,
    pub message: String,
}

/// The ordered records of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateBatch {
    run_id: Uuid,
    records: Vec<NormalizedRecord>,
}

impl IntermediateBatch {
    pub fn new(run_id: Uuid, records: Vec<NormalizedRecord>) -> Self {
        Self { run_id, records }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes the records as a JSON array of flat objects. Non-ASCII text
    /// is written as UTF-8, never `\u` escaped.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.records)
            .map_err(|e| PipelineError::Serialization(format!("encoding batch: {e}")))
    }

    pub fn from_json_bytes(run_id: Uuid, bytes: &[u8]) -> Result<Self> {
        let records = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::Serialization(format!("decoding batch: {e}")))?;
        Ok(Self { run_id, records })
    }
}

/// Codes that fell outside the vocabulary and were passed through as-is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeReport {
    pub records: usize,
    pub unmapped_status: usize,
    pub unmapped_direction: usize,
}

/// Translates one position, attaching the batch-wide feed status.
///
/// Returns the record and whether (status, direction) were found in the vocabulary.
pub fn normalize_record(
    raw: RawPositionRecord,
    feed: &FeedStatus,
) -> (NormalizedRecord, bool, bool) {
    let status_label = train_status_label(&raw.status_code);
    let direction = direction_label(&raw.direction_code);

    let record = NormalizedRecord {
        subway_name: raw.subway_name,
        train_no: raw.train_no,
        station_name: raw.station_name,
        terminal_station_name: raw.terminal_station_name,
        train_status: status_label.map_or(raw.status_code, str::to_string),
        direction: direction.map_or(raw.direction_code, str::to_string),
        status: feed.status.clone(),
        code: feed.code.clone(),
        message: feed.message.clone(),
    };

    (record, status_label.is_some(), direction.is_some())
}

/// Turns a fetched snapshot into the run's batch, preserving feed order.
///
/// Unknown codes never fail the batch; they are counted in the report.
#[tracing::instrument(skip_all, fields(run_id = %run_id, positions = snapshot.positions.len()))]
pub fn normalize(snapshot: FeedSnapshot, run_id: Uuid) -> (IntermediateBatch, NormalizeReport) {
    let FeedSnapshot { status, positions } = snapshot;
    let mut report = NormalizeReport {
        records: positions.len(),
        ..Default::default()
    };

    let records = positions
        .into_iter()
        .map(|raw| {
            let (record, status_known, direction_known) = normalize_record(raw, &status);
            if !status_known {
                report.unmapped_status += 1;
            }
            if !direction_known {
                report.unmapped_direction += 1;
            }
            record
        })
        .collect();

    if report.unmapped_status > 0 || report.unmapped_direction > 0 {
        warn!(
            unmapped_status = report.unmapped_status,
            unmapped_direction = report.unmapped_direction,
            "Codes outside the display vocabulary passed through"
        );
    }
    info!(records = report.records, "Batch normalized");

    (IntermediateBatch::new(run_id, records), report)
}
