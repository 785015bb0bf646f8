//! Per-user favorites side-cache.
//!
//! Mirrors the bills store but is keyed by user rather than being a
//! singleton, with a much shorter expiry window, and supports incremental
//! single-item patches so the favorite-toggle UI gets immediate feedback
//! without a full reload.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::events::{CacheEvent, EventBus};
use super::store::parse_timestamp;
use crate::bill::types::{BillRecord, FavoriteAction, FavoriteEntry};
use crate::config::Config;

/// Independent of the bills store version; bumping drops this store only.
pub const FAVORITES_SCHEMA_VERSION: u32 = 1;

/// Schema for the favorites store.
const FAVORITES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS favorites (
    user_id TEXT NOT NULL,
    bill_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    data BLOB,
    PRIMARY KEY (user_id, bill_id)
);

-- One freshness row per user
CREATE TABLE IF NOT EXISTS favorites_meta (
    user_id TEXT PRIMARY KEY,
    cached_at TEXT NOT NULL
);
"#;

/// Secondary store holding favorite-bill ids and denormalized snapshots.
pub struct FavoritesCache {
  conn: Mutex<Connection>,
  expiry: chrono::Duration,
  bus: EventBus,
}

impl FavoritesCache {
  /// Open or create the store at the configured location.
  pub fn open(config: &Config, bus: EventBus) -> Result<Self> {
    let path = config.favorites_db_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    Self::open_at(&path, config, bus)
  }

  pub fn open_at(path: &Path, config: &Config, bus: EventBus) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open favorites store at {}: {}", path.display(), e))?;

    Self::from_connection(conn, config, bus)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory(config: &Config, bus: EventBus) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory favorites store: {}", e))?;

    Self::from_connection(conn, config, bus)
  }

  fn from_connection(conn: Connection, config: &Config, bus: EventBus) -> Result<Self> {
    init_schema(&conn)?;

    Ok(Self {
      conn: Mutex::new(conn),
      expiry: config.favorites_expiry(),
      bus,
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Cached favorites for one user, newest first, or `None` when nothing is
  /// cached for the user or the cached set has expired.
  pub fn get(&self, user_id: &str) -> Result<Option<Vec<FavoriteEntry>>> {
    let cached_at = match self.cached_at(user_id)? {
      Some(ts) => ts,
      None => return Ok(None),
    };

    if Utc::now() - cached_at > self.expiry {
      return Ok(None);
    }

    Ok(Some(self.load_entries(user_id)?))
  }

  fn cached_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;

    let row: Option<String> = conn
      .query_row(
        "SELECT cached_at FROM favorites_meta WHERE user_id = ?",
        params![user_id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read favorites metadata: {}", e))?;

    row.map(|s| parse_timestamp(&s)).transpose()
  }

  fn load_entries(&self, user_id: &str) -> Result<Vec<FavoriteEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT bill_id, created_at, data FROM favorites
         WHERE user_id = ?
         ORDER BY created_at DESC, bill_id",
      )
      .map_err(|e| eyre!("Failed to prepare favorites query: {}", e))?;

    let rows: Vec<(String, String, Option<Vec<u8>>)> = stmt
      .query_map(params![user_id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to query favorites: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut entries = Vec::with_capacity(rows.len());
    for (bill_id, created_at, data) in rows {
      entries.push(FavoriteEntry {
        user_id: user_id.to_string(),
        bill_id,
        created_at: parse_timestamp(&created_at)?,
        bill: data.and_then(|d| serde_json::from_slice(&d).ok()),
      });
    }

    Ok(entries)
  }

  /// Replace one user's cached favorites and stamp them fresh.
  pub fn set(&self, user_id: &str, entries: &[FavoriteEntry]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    conn
      .execute("DELETE FROM favorites WHERE user_id = ?", params![user_id])
      .map_err(|e| eyre!("Failed to clear favorites: {}", e))?;

    {
      let mut stmt = conn
        .prepare(
          "INSERT OR REPLACE INTO favorites (user_id, bill_id, created_at, data)
           VALUES (?, ?, ?, ?)",
        )
        .map_err(|e| eyre!("Failed to prepare insert: {}", e))?;

      for entry in entries {
        let data = entry
          .bill
          .as_ref()
          .map(serde_json::to_vec)
          .transpose()
          .map_err(|e| eyre!("Failed to serialize favorite {}: {}", entry.bill_id, e))?;

        stmt
          .execute(params![
            user_id,
            entry.bill_id,
            entry.created_at.to_rfc3339(),
            data,
          ])
          .map_err(|e| eyre!("Failed to store favorite {}: {}", entry.bill_id, e))?;
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO favorites_meta (user_id, cached_at) VALUES (?, ?)",
        params![user_id, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to stamp favorites metadata: {}", e))?;

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Drop one user's rows and metadata. The next read misses and refetches.
  pub fn invalidate(&self, user_id: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM favorites WHERE user_id = ?", params![user_id])
      .map_err(|e| eyre!("Failed to clear favorites: {}", e))?;
    conn
      .execute(
        "DELETE FROM favorites_meta WHERE user_id = ?",
        params![user_id],
      )
      .map_err(|e| eyre!("Failed to clear favorites metadata: {}", e))?;

    Ok(())
  }

  /// Drop every user except the one that just authenticated.
  pub fn retain_only(&self, user_id: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM favorites WHERE user_id != ?", params![user_id])
      .map_err(|e| eyre!("Failed to clear other users' favorites: {}", e))?;
    conn
      .execute(
        "DELETE FROM favorites_meta WHERE user_id != ?",
        params![user_id],
      )
      .map_err(|e| eyre!("Failed to clear other users' metadata: {}", e))?;

    Ok(())
  }

  /// Wipe the whole store (invalidation engine, administrative clear).
  pub fn clear(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch("BEGIN; DELETE FROM favorites; DELETE FROM favorites_meta; COMMIT;")
      .map_err(|e| eyre!("Failed to clear favorites store: {}", e))?;

    Ok(())
  }

  /// Current favorite ids for one user, regardless of freshness.
  pub fn ids(&self, user_id: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT bill_id FROM favorites WHERE user_id = ?
         ORDER BY created_at DESC, bill_id",
      )
      .map_err(|e| eyre!("Failed to prepare favorites query: {}", e))?;

    let ids: Vec<String> = stmt
      .query_map(params![user_id], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query favorite ids: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(ids)
  }

  /// Incremental single-item patch from the favorite-toggle UI.
  ///
  /// Idempotent: adding a present id and removing an absent id are no-ops.
  /// Always emits [`CacheEvent::FavoritesUpdated`] with the user's current
  /// favorite list so other open views reconcile.
  pub fn patch_one(
    &self,
    user_id: &str,
    bill_id: &str,
    action: FavoriteAction,
    bill: Option<&BillRecord>,
  ) -> Result<()> {
    {
      let conn = self.lock()?;

      match action {
        FavoriteAction::Add => {
          let data = bill
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| eyre!("Failed to serialize favorite {}: {}", bill_id, e))?;

          conn
            .execute(
              "INSERT OR IGNORE INTO favorites (user_id, bill_id, created_at, data)
               VALUES (?, ?, ?, ?)",
              params![user_id, bill_id, Utc::now().to_rfc3339(), data],
            )
            .map_err(|e| eyre!("Failed to add favorite {}: {}", bill_id, e))?;
        }
        FavoriteAction::Remove => {
          conn
            .execute(
              "DELETE FROM favorites WHERE user_id = ? AND bill_id = ?",
              params![user_id, bill_id],
            )
            .map_err(|e| eyre!("Failed to remove favorite {}: {}", bill_id, e))?;
        }
      }
    }

    self.bus.emit(CacheEvent::FavoritesUpdated {
      user_id: user_id.to_string(),
      bill_id: bill_id.to_string(),
      action,
      favorites: self.ids(user_id)?,
    });

    Ok(())
  }

  /// Overwrite one user's freshness stamp.
  pub(crate) fn stamp_user(&self, user_id: &str, cached_at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO favorites_meta (user_id, cached_at) VALUES (?, ?)",
        params![user_id, cached_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to stamp favorites metadata: {}", e))?;

    Ok(())
  }
}

fn init_schema(conn: &Connection) -> Result<()> {
  let on_disk: i64 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if on_disk != 0 && on_disk != FAVORITES_SCHEMA_VERSION as i64 {
    tracing::info!(
      on_disk,
      current = FAVORITES_SCHEMA_VERSION,
      "dropping outdated favorites store"
    );
    conn
      .execute_batch(
        "DROP TABLE IF EXISTS favorites;
         DROP TABLE IF EXISTS favorites_meta;",
      )
      .map_err(|e| eyre!("Failed to drop outdated store: {}", e))?;
  }

  conn
    .execute_batch(FAVORITES_SCHEMA)
    .map_err(|e| eyre!("Failed to run favorites store migrations: {}", e))?;

  conn
    .pragma_update(None, "user_version", FAVORITES_SCHEMA_VERSION)
    .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

  Ok(())
}
