//! SQLite-backed persistent store for the bill dataset.
//!
//! One database file, three tables: the bill rows (JSON blobs plus a couple
//! of indexed columns), a singleton metadata row, and small persisted marks
//! used by the invalidation engine. Readers treat an absent or expired
//! metadata row as a cache miss, and metadata is stamped only after every row
//! batch has committed, so a crash mid-write reads as a miss rather than a
//! torn result.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::{stream, TryStreamExt};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::bill::types::{sort_bills, BillRecord, CacheMetadata};
use crate::config::Config;

/// Bumping this drops the existing store wholesale on next open; old stores
/// are never migrated field by field.
pub const BILLS_SCHEMA_VERSION: u32 = 1;

/// Schema for the bills store.
const BILLS_SCHEMA: &str = r#"
-- Bill replica (stores serialized JSON)
CREATE TABLE IF NOT EXISTS bills (
    bill_id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    propose_dt TEXT,
    updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_bills_propose_dt ON bills(propose_dt);

-- Singleton sync metadata
CREATE TABLE IF NOT EXISTS cache_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_updated TEXT NOT NULL,
    version INTEGER NOT NULL,
    total_count INTEGER NOT NULL
);

-- Invalidation bookkeeping (session exit, forced sync)
CREATE TABLE IF NOT EXISTS sync_marks (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Persistent local store holding the bill read replica.
pub struct BillStore {
  conn: Mutex<Connection>,
  expiry: chrono::Duration,
  write_batch_size: usize,
  write_fan_out: usize,
}

impl BillStore {
  /// Open or create the store at the configured location.
  pub fn open(config: &Config) -> Result<Self> {
    let path = config.bills_db_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    Self::open_at(&path, config)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path, config: &Config) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open bills store at {}: {}", path.display(), e))?;

    Self::from_connection(conn, config)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory(config: &Config) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory bills store: {}", e))?;

    Self::from_connection(conn, config)
  }

  fn from_connection(conn: Connection, config: &Config) -> Result<Self> {
    init_schema(&conn)?;

    Ok(Self {
      conn: Mutex::new(conn),
      expiry: config.bills_expiry(),
      write_batch_size: config.write_batch_size.max(1),
      write_fan_out: config.write_fan_out.max(1),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// All cached records in canonical order, or `None` when the cache cannot
  /// be trusted: no metadata, a stale schema version, an expired
  /// `last_updated`, or a row count that disagrees with `total_count`
  /// (partial load).
  pub fn get_all(&self) -> Result<Option<Vec<BillRecord>>> {
    let meta = match self.get_metadata()? {
      Some(meta) => meta,
      None => return Ok(None),
    };

    if meta.version != BILLS_SCHEMA_VERSION {
      return Ok(None);
    }
    if Utc::now() - meta.last_updated > self.expiry {
      return Ok(None);
    }

    let mut records = self.load_rows()?;
    if records.len() as u64 != meta.total_count {
      tracing::warn!(
        cached = records.len(),
        expected = meta.total_count,
        "bill cache row count mismatch, treating as miss"
      );
      return Ok(None);
    }

    sort_bills(&mut records);
    Ok(Some(records))
  }

  fn load_rows(&self) -> Result<Vec<BillRecord>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT data FROM bills")
      .map_err(|e| eyre!("Failed to prepare bill query: {}", e))?;

    let records: Vec<BillRecord> = stmt
      .query_map([], |row| {
        let data: Vec<u8> = row.get(0)?;
        Ok(data)
      })
      .map_err(|e| eyre!("Failed to query bills: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(records)
  }

  /// Atomically replace the cached dataset.
  ///
  /// Existing rows and metadata are cleared first, then the new set is
  /// bulk-inserted in chunked batches issued with bounded concurrency, and
  /// only once every batch has committed is fresh metadata stamped. A reader
  /// racing this sees either the old complete set or a miss, never a torn
  /// one.
  pub async fn replace_all(&self, records: &[BillRecord], total_count: u64) -> Result<()> {
    {
      let conn = self.lock()?;
      conn
        .execute_batch("BEGIN; DELETE FROM bills; DELETE FROM cache_meta; COMMIT;")
        .map_err(|e| eyre!("Failed to clear bills store: {}", e))?;
    }

    let chunks: Vec<Vec<BillRecord>> = records
      .chunks(self.write_batch_size)
      .map(|c| c.to_vec())
      .collect();

    stream::iter(chunks.into_iter().map(Ok::<_, color_eyre::eyre::Report>))
      .try_for_each_concurrent(self.write_fan_out, |chunk| async move {
        // Yield between batches so a large import interleaves with readers.
        tokio::task::yield_now().await;
        self.insert_batch(&chunk)
      })
      .await?;

    self.stamp_metadata(Utc::now(), total_count)
  }

  fn insert_batch(&self, records: &[BillRecord]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    {
      let mut stmt = conn
        .prepare(
          "INSERT OR REPLACE INTO bills (bill_id, data, propose_dt, updated_at)
           VALUES (?, ?, ?, ?)",
        )
        .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

      for record in records {
        let data = serde_json::to_vec(record)
          .map_err(|e| eyre!("Failed to serialize bill {}: {}", record.bill_id, e))?;

        stmt
          .execute(params![
            record.bill_id,
            data,
            record.propose_dt.map(|d| d.to_string()),
            record.updated_at.map(|t| t.to_rfc3339()),
          ])
          .map_err(|e| eyre!("Failed to store bill {}: {}", record.bill_id, e))?;
      }
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Overwrite the singleton metadata row.
  pub(crate) fn stamp_metadata(&self, last_updated: DateTime<Utc>, total_count: u64) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_meta (id, last_updated, version, total_count)
         VALUES (1, ?, ?, ?)",
        params![last_updated.to_rfc3339(), BILLS_SCHEMA_VERSION, total_count],
      )
      .map_err(|e| eyre!("Failed to stamp cache metadata: {}", e))?;

    Ok(())
  }

  pub fn get_metadata(&self) -> Result<Option<CacheMetadata>> {
    let conn = self.lock()?;

    let row: Option<(String, u32, u64)> = conn
      .query_row(
        "SELECT last_updated, version, total_count FROM cache_meta WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache metadata: {}", e))?;

    match row {
      Some((last_updated, version, total_count)) => Ok(Some(CacheMetadata {
        last_updated: parse_timestamp(&last_updated)?,
        version,
        total_count,
      })),
      None => Ok(None),
    }
  }

  /// Number of rows currently cached, independent of freshness.
  pub fn count(&self) -> Result<u64> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM bills", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count bills: {}", e))?;

    Ok(count as u64)
  }

  /// Single cached record by id, independent of freshness.
  pub fn get(&self, bill_id: &str) -> Result<Option<BillRecord>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM bills WHERE bill_id = ?",
        params![bill_id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read bill {}: {}", bill_id, e))?;

    match data {
      Some(data) => {
        let record = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize bill {}: {}", bill_id, e))?;
        Ok(Some(record))
      }
      None => Ok(None),
    }
  }

  /// Insert or replace a single record (realtime patch path).
  ///
  /// Returns `true` when a new row was created. `total_count` follows the row
  /// set so the count-convergence check stays valid under live patches.
  pub fn upsert(&self, record: &BillRecord) -> Result<bool> {
    let conn = self.lock()?;

    let existing: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM bills WHERE bill_id = ?",
        params![record.bill_id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to check bill {}: {}", record.bill_id, e))?;

    let data = serde_json::to_vec(record)
      .map_err(|e| eyre!("Failed to serialize bill {}: {}", record.bill_id, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO bills (bill_id, data, propose_dt, updated_at)
         VALUES (?, ?, ?, ?)",
        params![
          record.bill_id,
          data,
          record.propose_dt.map(|d| d.to_string()),
          record.updated_at.map(|t| t.to_rfc3339()),
        ],
      )
      .map_err(|e| eyre!("Failed to upsert bill {}: {}", record.bill_id, e))?;

    let inserted = existing == 0;
    if inserted {
      conn
        .execute(
          "UPDATE cache_meta SET total_count = total_count + 1 WHERE id = 1",
          [],
        )
        .map_err(|e| eyre!("Failed to adjust total count: {}", e))?;
    }

    Ok(inserted)
  }

  /// Remove a single record (realtime patch path). Removing an absent id is
  /// a no-op. Returns `true` when a row was actually deleted.
  pub fn remove(&self, bill_id: &str) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute("DELETE FROM bills WHERE bill_id = ?", params![bill_id])
      .map_err(|e| eyre!("Failed to delete bill {}: {}", bill_id, e))?;

    if deleted > 0 {
      conn
        .execute(
          "UPDATE cache_meta SET total_count = MAX(total_count - 1, 0) WHERE id = 1",
          [],
        )
        .map_err(|e| eyre!("Failed to adjust total count: {}", e))?;
    }

    Ok(deleted > 0)
  }

  /// Wipe rows and metadata. Sync marks survive a clear: they are
  /// invalidation bookkeeping, not cached data.
  pub fn clear(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch("BEGIN; DELETE FROM bills; DELETE FROM cache_meta; COMMIT;")
      .map_err(|e| eyre!("Failed to clear bills store: {}", e))?;

    Ok(())
  }

  /// Read a persisted mark (e.g. `last_exit`, `last_forced_sync`).
  pub fn get_mark(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;

    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM sync_marks WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mark {}: {}", key, e))?;

    Ok(value)
  }

  /// Write a persisted mark.
  pub fn set_mark(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO sync_marks (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write mark {}: {}", key, e))?;

    Ok(())
  }
}

/// Create tables, dropping the whole store first when the on-disk schema
/// version differs from [`BILLS_SCHEMA_VERSION`].
fn init_schema(conn: &Connection) -> Result<()> {
  let on_disk: i64 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if on_disk != 0 && on_disk != BILLS_SCHEMA_VERSION as i64 {
    tracing::info!(on_disk, current = BILLS_SCHEMA_VERSION, "dropping outdated bills store");
    conn
      .execute_batch(
        "DROP TABLE IF EXISTS bills;
         DROP TABLE IF EXISTS cache_meta;
         DROP TABLE IF EXISTS sync_marks;",
      )
      .map_err(|e| eyre!("Failed to drop outdated store: {}", e))?;
  }

  conn
    .execute_batch(BILLS_SCHEMA)
    .map_err(|e| eyre!("Failed to run bills store migrations: {}", e))?;

  conn
    .pragma_update(None, "user_version", BILLS_SCHEMA_VERSION)
    .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

  Ok(())
}

/// Parse an RFC 3339 timestamp written by this store.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}
