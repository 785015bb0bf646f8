//! Contract to the remote data collaborator.
//!
//! The relational backend (its query surface, auth, notification delivery) is
//! out of scope for this crate; everything it provides is consumed through
//! this narrow trait. Production implementations live in the host
//! application, tests inject fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use tokio::sync::broadcast;

use super::types::{BillRecord, ChangeEvent, FavoriteAction, FavoriteEntry};

/// Which date field orders a remote fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillOrder {
  /// `propose_dt` descending, nulls last — the default list order.
  Proposed,
  /// `proc_dt` descending, nulls last — processed/passed/rejected views.
  Processed,
}

/// The remote bill dataset and favorites table.
///
/// Fetches must be stable under the given order (same sort tie-break as
/// [`super::types::compare_by_proposed`]) so that paginated reads do not skip
/// or duplicate rows between pages.
#[async_trait]
pub trait BillSource: Send + Sync {
  /// Authoritative row count, used to size progressive loads and to detect
  /// partial caches.
  async fn count_bills(&self) -> Result<u64>;

  /// One page of bills in the given stable order.
  async fn fetch_bills(&self, order: BillOrder, offset: u64, limit: u64)
    -> Result<Vec<BillRecord>>;

  /// Timestamp of the most recently updated remote record, used as the drift
  /// probe. `None` when the dataset is empty.
  async fn latest_update(&self) -> Result<Option<DateTime<Utc>>>;

  /// Full favorite entries (with bill bodies) for one user.
  async fn fetch_favorites(&self, user_id: &str) -> Result<Vec<FavoriteEntry>>;

  /// Lightweight favorite references for one user: `(bill_id, created_at)`.
  /// Used by the hybrid load path, which joins against already-cached bills.
  async fn fetch_favorite_ids(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>>;

  /// Add or remove a favorite in the remote store.
  async fn mutate_favorite(
    &self,
    user_id: &str,
    bill_id: &str,
    action: FavoriteAction,
  ) -> Result<()>;

  /// Subscribe to the push-based change stream for the bills and favorites
  /// tables. Transport-level reconnection is the implementation's concern;
  /// subscribing is idempotent.
  fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent>;
}
