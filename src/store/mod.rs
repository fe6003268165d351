//! Persister: one stored row per normalized record.
//!
//! The sink is append-only. Nothing in the nine fields identifies a
//! position uniquely, so re-running against the same feed snapshot stores
//! the same rows again.

pub mod sqlite;

pub use sqlite::SqliteTrainStore;

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::normalize::{IntermediateBatch, NormalizedRecord};

/// Row form of a [`NormalizedRecord`], field for field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTrainRow {
    pub subway_name: String,
    pub train_no: String,
    pub station_name: String,
    pub terminal_station_name: String,
    pub train_status: String,
    pub direction: String,
    pub status: String,
    pub code: String,
    pub message: String,
}

impl From<&NormalizedRecord> for StoredTrainRow {
    fn from(record: &NormalizedRecord) -> Self {
        Self {
            subway_name: record.subway_name.clone(),
            train_no: record.train_no.clone(),
            station_name: record.station_name.clone(),
            terminal_station_name: record.terminal_station_name.clone(),
            train_status: record.train_status.clone(),
            direction: record.direction.clone(),
            status: record.status.clone(),
            code: record.code.clone(),
            message: record.message.clone(),
        }
    }
}

/// An open connection to wherever rows go. The caller owns its lifecycle
/// and hands it to [`persist`] for each run.
pub trait TrainRowStore: Send {
    fn insert(&mut self, row: &StoredTrainRow) -> Result<()>;
}

/// Inserts every record of the batch in batch order.
///
/// The first failed insert aborts the batch. Rows inserted before it stay.
///
/// # Errors
///
/// Returns [`PipelineError::Persistence`] naming the failing record.
#[tracing::instrument(skip_all, fields(run_id = %batch.run_id(), records = batch.len()))]
pub fn persist(batch: &IntermediateBatch, store: &mut dyn TrainRowStore) -> Result<usize> {
    for (index, record) in batch.records().iter().enumerate() {
        store.insert(&StoredTrainRow::from(record)).map_err(|e| {
            let cause = match e {
                PipelineError::Persistence(msg) => msg,
                other => other.to_string(),
            };
            PipelineError::Persistence(format!(
                "record {index} (train {}) of {}: {cause}",
                record.train_no,
                batch.len()
            ))
        })?;
        debug!(index, train_no = %record.train_no, "Row inserted");
    }

    info!(rows = batch.len(), "Batch persisted");
    Ok(batch.len())
}
