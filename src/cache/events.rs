//! Typed publish/subscribe channel for cross-component reconciliation.
//!
//! Mounted views subscribe explicitly instead of listening for ad-hoc global
//! events; senders never block and a lagged receiver simply misses events.

use tokio::sync::broadcast;
use tracing::trace;

use crate::bill::types::{BillRecord, ChangeKind, FavoriteAction};

/// Why the caches were invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
  /// Cached metadata older than the expiry window.
  Expired,
  /// Remote mutation timestamp drifted past the local sync timestamp.
  RemoteDrift,
  /// New session detected (long gap since last exit, or a hard reload).
  SessionBoundary,
  /// Rolling forced sync, bounding staleness from missed realtime events.
  PeriodicSync,
  /// Explicit administrative clear.
  Manual,
}

/// Events emitted by the cache layer.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// Both stores were cleared; mounted views should re-trigger their load.
  Invalidated {
    reason: InvalidationReason,
    /// Remote/local gap that triggered a drift invalidation.
    drift: Option<chrono::Duration>,
  },
  /// A single favorite changed; carries the user's current favorite ids so
  /// open views reconcile their in-memory list without a reload.
  FavoritesUpdated {
    user_id: String,
    bill_id: String,
    action: FavoriteAction,
    favorites: Vec<String>,
  },
  /// A background fill completed and the store now holds the full dataset.
  BillsRefreshed { total: u64 },
  /// A realtime patch was folded into the bills store.
  BillPatched {
    kind: ChangeKind,
    bill_id: String,
    bill: Option<BillRecord>,
  },
}

/// Broadcast bus shared by every cache component.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(256);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.tx.subscribe()
  }

  /// Publish an event. Having no subscribers is not an error.
  pub fn emit(&self, event: CacheEvent) {
    if self.tx.send(event).is_err() {
      trace!("no subscribers for cache event");
    }
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}
