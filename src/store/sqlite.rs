use std::path::Path;

use rusqlite::{Connection, params};
use tracing::info;

use super::{StoredTrainRow, TrainRowStore};
use crate::error::{PipelineError, Result};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS train_data (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    subwayNm   TEXT NOT NULL,
    trainNo    TEXT NOT NULL,
    statnNm    TEXT NOT NULL,
    statnTnm   TEXT NOT NULL,
    trainSttus TEXT NOT NULL,
    updnLine   TEXT NOT NULL,
    status     TEXT NOT NULL,
    code       TEXT NOT NULL,
    message    TEXT NOT NULL
)";

const INSERT_ROW: &str = "INSERT INTO train_data
    (subwayNm, trainNo, statnNm, statnTnm, trainSttus, updnLine, status, code, message)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// [`TrainRowStore`] over a SQLite database holding the `train_data` table.
///
/// Opening creates the table when it is missing; the store never alters an
/// existing schema.
pub struct SqliteTrainStore {
    conn: Connection,
}

impl SqliteTrainStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| PipelineError::Persistence(format!("opening {}: {e}", path.display())))?;
        info!(path = %path.display(), "SQLite store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::Persistence(format!("opening in-memory store: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(CREATE_TABLE, [])
            .map_err(|e| PipelineError::Persistence(format!("creating train_data: {e}")))?;
        Ok(Self { conn })
    }

    /// All rows in insertion order.
    pub fn rows(&self) -> Result<Vec<StoredTrainRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT subwayNm, trainNo, statnNm, statnTnm, trainSttus, updnLine, status, code, message
                 FROM train_data ORDER BY id",
            )
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StoredTrainRow {
                    subway_name: row.get(0)?,
                    train_no: row.get(1)?,
                    station_name: row.get(2)?,
                    terminal_station_name: row.get(3)?,
                    train_status: row.get(4)?,
                    direction: row.get(5)?,
                    status: row.get(6)?,
                    code: row.get(7)?,
                    message: row.get(8)?,
                })
            })
            .map_err(|e| PipelineError::Persistence(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;

        Ok(rows)
    }
}

impl TrainRowStore for SqliteTrainStore {
    fn insert(&mut self, row: &StoredTrainRow) -> Result<()> {
        self.conn
            .execute(
                INSERT_ROW,
                params![
                    row.subway_name,
                    row.train_no,
                    row.station_name,
                    row.terminal_station_name,
                    row.train_status,
                    row.direction,
                    row.status,
                    row.code,
                    row.message,
                ],
            )
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(train_no: &str) -> StoredTrainRow {
        StoredTrainRow {
            subway_name: "3호선".to_string(),
            train_no: train_no.to_string(),
            station_name: "불광".to_string(),
            terminal_station_name: "수서".to_string(),
            train_status: "진입".to_string(),
            direction: "상행/내선".to_string(),
            status: "200".to_string(),
            code: "INFO-000".to_string(),
            message: "정상 처리되었습니다.".to_string(),
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut store = SqliteTrainStore::open_in_memory().unwrap();
        store.insert(&row("3101")).unwrap();
        store.insert(&row("3102")).unwrap();

        let rows = store.rows().unwrap();
        assert_eq!(rows, vec![row("3101"), row("3102")]);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut store = SqliteTrainStore::open_in_memory().unwrap();
        store.insert(&row("3101")).unwrap();
        store.insert(&row("3101")).unwrap();
        assert_eq!(store.rows().unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subway.db");

        {
            let mut store = SqliteTrainStore::open(&path).unwrap();
            store.insert(&row("3101")).unwrap();
        }

        let store = SqliteTrainStore::open(&path).unwrap();
        assert_eq!(store.rows().unwrap(), vec![row("3101")]);
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let result = SqliteTrainStore::open(dir.path().join("absent").join("subway.db"));
        assert!(matches!(result, Err(PipelineError::Persistence(_))));
    }
}
