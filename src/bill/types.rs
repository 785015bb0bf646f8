//! Domain types for bill records, favorites and change events.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one legislative bill.
///
/// Owned by the remote store; the local cache holds a read replica keyed by
/// `bill_id`. Every merge path upserts by that key, so the cache never holds
/// two rows for the same bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillRecord {
  pub bill_id: String,
  pub bill_no: Option<String>,
  pub bill_name: String,
  pub proposer_kind: Option<String>,
  pub propose_dt: Option<NaiveDate>,
  pub proc_dt: Option<NaiveDate>,
  pub general_result: Option<String>,
  pub proc_stage_cd: Option<String>,
  pub pass_gubn: Option<String>,
  pub summary: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

/// Singleton metadata row for the bills store.
///
/// `total_count` is the authoritative row count reported by the remote source
/// at the time of the last sync; a local row count that disagrees marks the
/// cache as a partial load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetadata {
  pub last_updated: DateTime<Utc>,
  pub version: u32,
  pub total_count: u64,
}

/// A favorited bill for one user, with an optional denormalized snapshot so
/// favorite lists render without re-fetching bill bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteEntry {
  pub user_id: String,
  pub bill_id: String,
  pub created_at: DateTime<Utc>,
  pub bill: Option<BillRecord>,
}

/// Add or remove, for favorite mutations and patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoriteAction {
  Add,
  Remove,
}

/// Row-level change kind from the remote change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// A transient change notification from the remote source.
///
/// Consumed once by the realtime sync manager, folded into the local stores,
/// then discarded.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
  Bill {
    kind: ChangeKind,
    old: Option<BillRecord>,
    new: Option<BillRecord>,
  },
  Favorite {
    kind: ChangeKind,
    user_id: String,
    bill_id: String,
  },
}

/// Extract the numeric portion of a bill number for sorting.
///
/// Non-digit characters are stripped; absent or unparseable numbers sort as 0.
pub fn bill_no_numeric(bill_no: Option<&str>) -> u64 {
  bill_no
    .map(|no| no.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
    .and_then(|digits| digits.parse().ok())
    .unwrap_or(0)
}

/// Canonical ordering for bill lists: `propose_dt` descending with missing
/// dates last, then numeric `bill_no` descending, then `bill_id` so that
/// pagination is deterministic.
pub fn compare_by_proposed(a: &BillRecord, b: &BillRecord) -> Ordering {
  compare_dated(a.propose_dt, b.propose_dt, a, b)
}

/// Ordering for processed/passed/rejected groupings: same rules, but keyed on
/// `proc_dt`. The two date fields are never mixed within one comparison.
pub fn compare_by_processed(a: &BillRecord, b: &BillRecord) -> Ordering {
  compare_dated(a.proc_dt, b.proc_dt, a, b)
}

fn compare_dated(
  da: Option<NaiveDate>,
  db: Option<NaiveDate>,
  a: &BillRecord,
  b: &BillRecord,
) -> Ordering {
  let by_date = match (da, db) {
    (Some(x), Some(y)) => y.cmp(&x),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  };

  by_date
    .then_with(|| {
      bill_no_numeric(b.bill_no.as_deref()).cmp(&bill_no_numeric(a.bill_no.as_deref()))
    })
    .then_with(|| a.bill_id.cmp(&b.bill_id))
}

/// Sort bills in the canonical proposal-date order.
pub fn sort_bills(bills: &mut [BillRecord]) {
  bills.sort_by(compare_by_proposed);
}

/// Sort bills by processing date, for category views.
pub fn sort_bills_by_processed(bills: &mut [BillRecord]) {
  bills.sort_by(compare_by_processed);
}
