//! SQLite-backed metadata store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::store::{ImageRecord, MetadataError, MetadataStore};

const SELECT_COLUMNS: &str = "SELECT batch_id, name, original_path, converted_path, format, size_bytes, checksum, converted_at FROM images";

/// SQLite-backed metadata store.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path`.
    pub fn new(path: &Path) -> Result<Self, MetadataError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, MetadataError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), MetadataError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                converted_path TEXT PRIMARY KEY,
                batch_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                original_path TEXT NOT NULL,
                format TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                converted_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_images_original_path ON images(original_path);
            CREATE INDEX IF NOT EXISTS idx_images_converted_at ON images(converted_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, MetadataError> {
        self.conn
            .lock()
            .map_err(|_| MetadataError::Database("connection lock poisoned".to_string()))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ImageRecord> {
        let batch_id: i64 = row.get(0)?;
        let size_bytes: i64 = row.get(5)?;
        let converted_at_str: String = row.get(7)?;

        let converted_at = DateTime::parse_from_rfc3339(&converted_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(ImageRecord {
            batch_id: batch_id as u64,
            name: row.get(1)?,
            original_path: row.get(2)?,
            converted_path: row.get(3)?,
            format: row.get(4)?,
            size_bytes: size_bytes as u64,
            checksum: row.get(6)?,
            converted_at,
        })
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn save_batch(&self, records: &[ImageRecord]) -> Result<usize, MetadataError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO images (converted_path, batch_id, name, original_path, format, size_bytes, checksum, converted_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.converted_path,
                    record.batch_id as i64,
                    record.name,
                    record.original_path,
                    record.format,
                    record.size_bytes as i64,
                    record.checksum,
                    record.converted_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;

        Ok(records.len())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<ImageRecord>, MetadataError> {
        let conn = self.conn()?;
        let sql = format!("{SELECT_COLUMNS} ORDER BY converted_at DESC, converted_path ASC LIMIT ?");
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![limit as i64], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn find_by_original(&self, original_path: &str) -> Result<Option<ImageRecord>, MetadataError> {
        let conn = self.conn()?;
        let sql = format!("{SELECT_COLUMNS} WHERE original_path = ? ORDER BY converted_at DESC LIMIT 1");
        let record = conn
            .query_row(&sql, params![original_path], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    fn count(&self) -> Result<u64, MetadataError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::in_memory().unwrap()
    }

    fn record(name: &str, minute: u32) -> ImageRecord {
        ImageRecord {
            batch_id: 1,
            name: format!("{name}.jpg"),
            original_path: format!("posts/{name}.jpg"),
            converted_path: format!("posts/{name}.webp"),
            format: "jpg".to_string(),
            size_bytes: 1024,
            checksum: "ab".repeat(32),
            converted_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_save_and_count() {
        let store = create_test_store();
        let saved = store.save_batch(&[record("a", 0), record("b", 1)]).unwrap();

        assert_eq!(saved, 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_save_empty_batch() {
        let store = create_test_store();
        assert_eq!(store.save_batch(&[]).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_resave_replaces_record() {
        let store = create_test_store();
        store.save_batch(&[record("a", 0)]).unwrap();

        let mut updated = record("a", 5);
        updated.batch_id = 2;
        updated.size_bytes = 512;
        store.save_batch(&[updated.clone()]).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.find_by_original("posts/a.jpg").unwrap(), Some(updated));
    }

    #[test]
    fn test_list_recent_orders_newest_first() {
        let store = create_test_store();
        store
            .save_batch(&[record("old", 0), record("new", 30), record("mid", 15)])
            .unwrap();

        let names: Vec<String> = store
            .list_recent(2)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["new.jpg", "mid.jpg"]);
    }

    #[test]
    fn test_find_unknown_original() {
        let store = create_test_store();
        assert!(store.find_by_original("posts/none.jpg").unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imgpress.db");

        {
            let store = SqliteMetadataStore::new(&path).unwrap();
            store.save_batch(&[record("a", 0)]).unwrap();
        }

        let reopened = SqliteMetadataStore::new(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
