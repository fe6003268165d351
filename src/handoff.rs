//! Hand-off artifact between the Normalizer and the two sinks.
//!
//! Every run writes its own file, named after the run id, so a slow reader
//! never sees the next run's batch. Older artifacts are pruned down to the
//! configured retention once the new one is in place.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::normalize::IntermediateBatch;

const PREFIX: &str = "realtime_position-";
const EXTENSION: &str = "json";

pub struct HandoffStore {
    dir: PathBuf,
    retain: usize,
}

impl HandoffStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{PREFIX}{run_id}.{EXTENSION}"))
    }

    /// Writes the batch atomically (temp file, then rename) and prunes
    /// superseded artifacts. Returns the artifact path.
    #[tracing::instrument(skip_all, fields(run_id = %batch.run_id(), records = batch.len()))]
    pub fn write(&self, batch: &IntermediateBatch) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            PipelineError::Serialization(format!("creating {}: {e}", self.dir.display()))
        })?;

        let path = self.artifact_path(batch.run_id());
        let tmp_path = self.dir.join(format!(".{PREFIX}{}.{EXTENSION}.tmp", batch.run_id()));
        let bytes = batch.to_json_bytes()?;

        fs::write(&tmp_path, &bytes).map_err(|e| {
            PipelineError::Serialization(format!("writing {}: {e}", tmp_path.display()))
        })?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(PipelineError::Serialization(format!(
                "moving artifact into {}: {e}",
                path.display()
            )));
        }

        info!(path = %path.display(), bytes = bytes.len(), "Hand-off artifact written");

        if let Err(e) = self.prune() {
            warn!(error = %e, "Failed to prune superseded artifacts");
        }
        Ok(path)
    }

    /// Reads a batch back. The run id comes from the file name when it
    /// follows the artifact pattern; foreign files get a fresh id.
    pub fn read(path: &Path) -> Result<IntermediateBatch> {
        let bytes = fs::read(path).map_err(|e| {
            PipelineError::Serialization(format!("reading {}: {e}", path.display()))
        })?;

        let run_id = run_id_of(path).unwrap_or_else(|| {
            let run_id = Uuid::now_v7();
            debug!(path = %path.display(), %run_id, "Artifact name carries no run id");
            run_id
        });

        IntermediateBatch::from_json_bytes(run_id, &bytes)
    }

    /// The newest artifact in the directory, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.artifacts()?.pop())
    }

    /// Artifacts oldest first. Run ids are time-ordered, so name order is
    /// creation order.
    fn artifacts(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PipelineError::Serialization(format!(
                    "listing {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && run_id_of(path).is_some())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn prune(&self) -> Result<()> {
        let artifacts = self.artifacts()?;
        let excess = artifacts.len().saturating_sub(self.retain);

        for path in &artifacts[..excess] {
            fs::remove_file(path).map_err(|e| {
                PipelineError::Serialization(format!("removing {}: {e}", path.display()))
            })?;
            debug!(path = %path.display(), "Superseded artifact removed");
        }
        Ok(())
    }
}

fn run_id_of(path: &Path) -> Option<Uuid> {
    if path.extension()?.to_str()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem.strip_prefix(PREFIX)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizedRecord;
    use tempfile::tempdir;

    fn record(train_no: &str) -> NormalizedRecord {
        NormalizedRecord {
            subway_name: "3호선".to_string(),
            train_no: train_no.to_string(),
            station_name: "경복궁".to_string(),
            terminal_station_name: "대화".to_string(),
            train_status: "도착".to_string(),
            direction: "하행/외선".to_string(),
            status: "200".to_string(),
            code: "INFO-000".to_string(),
            message: "정상 처리되었습니다.".to_string(),
        }
    }

    fn batch(train_nos: &[&str]) -> IntermediateBatch {
        IntermediateBatch::new(Uuid::now_v7(), train_nos.iter().map(|n| record(n)).collect())
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = HandoffStore::new(dir.path(), 1);
        let batch = batch(&["3101", "3102"]);

        let path = store.write(&batch).unwrap();
        assert_eq!(path, store.artifact_path(batch.run_id()));
        assert_eq!(path.parent(), Some(store.dir()));

        let read = HandoffStore::read(&path).unwrap();
        assert_eq!(read, batch);
    }

    #[test]
    fn test_artifact_is_plain_utf8_array() {
        let dir = tempdir().unwrap();
        let store = HandoffStore::new(dir.path(), 1);
        let path = store.write(&batch(&["3101"])).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains("\"statnNm\":\"경복궁\""));
    }

    #[test]
    fn test_prunes_to_retention() {
        let dir = tempdir().unwrap();
        let store = HandoffStore::new(dir.path(), 2);

        let first = store.write(&batch(&["1"])).unwrap();
        let second = store.write(&batch(&["2"])).unwrap();
        let third = store.write(&batch(&["3"])).unwrap();

        assert!(!first.exists());
        assert!(second.exists());
        assert!(third.exists());
        assert_eq!(store.latest().unwrap(), Some(third));
    }

    #[test]
    fn test_prune_leaves_foreign_files() {
        let dir = tempdir().unwrap();
        let foreign = dir.path().join("notes.json");
        fs::write(&foreign, "[]").unwrap();

        let store = HandoffStore::new(dir.path(), 1);
        store.write(&batch(&["1"])).unwrap();
        store.write(&batch(&["2"])).unwrap();

        assert!(foreign.exists());
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_latest_on_missing_dir() {
        let dir = tempdir().unwrap();
        let store = HandoffStore::new(dir.path().join("absent"), 1);
        assert_eq!(store.latest().unwrap(), None);
    }

    #[test]
    fn test_read_foreign_file_gets_fresh_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("realtime_position.json");
        let bytes = batch(&["3101"]).to_json_bytes().unwrap();
        fs::write(&path, bytes).unwrap();

        let read = HandoffStore::read(&path).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read.records()[0].train_no, "3101");
    }

    #[test]
    fn test_read_garbage_is_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();

        let err = HandoffStore::read(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }

    #[test]
    fn test_write_into_unwritable_location_fails() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let store = HandoffStore::new(blocker.join("sub"), 1);
        let err = store.write(&batch(&["1"])).unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }
}
