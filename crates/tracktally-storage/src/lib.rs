use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracktally_core::{CountEntry, JobContext};

pub const COUNT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Provenance of a namespace's primary table: digest of the raw report
/// text it was parsed from, and when the fetch happened. A digest change
/// on a later fetch invalidates the namespace's advisory tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub digest: String,
    pub fetched_at: DateTime<Utc>,
}

/// Persistent key/value store for count tables and visited-frame sets.
///
/// Keys follow the original storage contract verbatim
/// (`{ns}_frameCounts`, `new_{ns}_frameCounts`, `{client}_{ns}_frames`);
/// values are JSON text. Reads of malformed JSON report the key as
/// absent rather than failing, so a corrupted entry degrades to
/// "counts unknown."
pub struct CountStore {
    conn: Connection,
}

impl CountStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > COUNT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: COUNT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_count_store.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value=excluded.value,
                updated_at=excluded.updated_at
            ",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
        Ok(changes > 0)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        // Corrupted persisted JSON degrades to an absent key.
        Ok(serde_json::from_str(&raw).ok())
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.put_raw(key, &raw)
    }

    pub fn primary_counts(
        &self,
        context: &JobContext,
    ) -> Result<Option<Vec<CountEntry>>, StorageError> {
        self.read_json(&context.primary_key())
    }

    pub fn set_primary_counts(
        &self,
        context: &JobContext,
        entries: &[CountEntry],
    ) -> Result<(), StorageError> {
        self.write_json(&context.primary_key(), &entries)
    }

    pub fn overflow_counts(
        &self,
        context: &JobContext,
    ) -> Result<Option<Vec<CountEntry>>, StorageError> {
        self.read_json(&context.overflow_key())
    }

    pub fn set_overflow_counts(
        &self,
        context: &JobContext,
        entries: &[CountEntry],
    ) -> Result<(), StorageError> {
        self.write_json(&context.overflow_key(), &entries)
    }

    pub fn visited_frames(
        &self,
        context: &JobContext,
        client_id: u64,
    ) -> Result<Option<Vec<u64>>, StorageError> {
        self.read_json(&context.frames_key(client_id))
    }

    pub fn set_visited_frames(
        &self,
        context: &JobContext,
        client_id: u64,
        frames: &[u64],
    ) -> Result<(), StorageError> {
        self.write_json(&context.frames_key(client_id), &frames)
    }

    pub fn report_meta(&self, context: &JobContext) -> Result<Option<ReportMeta>, StorageError> {
        self.read_json(&context.report_meta_key())
    }

    pub fn set_report_meta(
        &self,
        context: &JobContext,
        meta: &ReportMeta,
    ) -> Result<(), StorageError> {
        self.write_json(&context.report_meta_key(), meta)
    }

    /// All visited-frame sets recorded for a namespace, keyed by client
    /// id. Keys that fail to parse back into a client id are skipped.
    pub fn visited_sets(
        &self,
        context: &JobContext,
    ) -> Result<Vec<(u64, Vec<u64>)>, StorageError> {
        let pattern = format!("*_{}_frames", context.namespace());
        let mut statement = self
            .conn
            .prepare("SELECT key, value FROM kv_entries WHERE key GLOB ?1 ORDER BY key")?;
        let rows = statement.query_map([pattern], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let suffix = format!("_{}_frames", context.namespace());
        let mut sets = Vec::new();
        for row in rows {
            let (key, value) = row?;
            let Some(prefix) = key.strip_suffix(&suffix) else {
                continue;
            };
            let Ok(client_id) = prefix.parse::<u64>() else {
                continue;
            };
            let frames: Vec<u64> = serde_json::from_str(&value).unwrap_or_default();
            sets.push((client_id, frames));
        }
        sets.sort_by_key(|(client_id, _)| *client_id);
        Ok(sets)
    }

    /// Drop a namespace's advisory data: the overflow table and every
    /// visited-frame set. Primary and report metadata stay in place.
    pub fn clear_advisory(&self, context: &JobContext) -> Result<(), StorageError> {
        self.remove(&context.overflow_key())?;
        let pattern = format!("*_{}_frames", context.namespace());
        self.conn
            .execute("DELETE FROM kv_entries WHERE key GLOB ?1", [pattern])?;
        Ok(())
    }
}
