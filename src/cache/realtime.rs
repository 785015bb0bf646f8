//! Realtime change-event pump.
//!
//! Maintains one logical subscription to the remote change stream per
//! process, shared across consumers through a reference-counted guard: the
//! pump task starts on the first acquire and stops when the last guard
//! drops, never duplicated. Incoming bill events are folded into the store
//! as single-row patches; favorites events invalidate the side-cache instead
//! (lower volume, simpler correctness story).

use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::events::{CacheEvent, EventBus};
use super::favorites::FavoritesCache;
use super::store::BillStore;
use crate::bill::source::BillSource;
use crate::bill::types::{ChangeEvent, ChangeKind};

struct PumpState {
  subscribers: usize,
  pump: Option<JoinHandle<()>>,
}

/// Applies remote change events to the local stores for as long as at least
/// one consumer holds a [`RealtimeGuard`].
pub struct RealtimeSync {
  store: Arc<BillStore>,
  favorites: Arc<FavoritesCache>,
  source: Arc<dyn BillSource>,
  bus: EventBus,
  inner: Arc<Mutex<PumpState>>,
}

impl RealtimeSync {
  pub fn new(
    store: Arc<BillStore>,
    favorites: Arc<FavoritesCache>,
    source: Arc<dyn BillSource>,
    bus: EventBus,
  ) -> Self {
    Self {
      store,
      favorites,
      source,
      bus,
      inner: Arc::new(Mutex::new(PumpState {
        subscribers: 0,
        pump: None,
      })),
    }
  }

  /// Register interest in live patches. The underlying channel is created on
  /// the first acquire and torn down when the last guard drops.
  pub fn acquire(&self) -> Result<RealtimeGuard> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    inner.subscribers += 1;
    if inner.pump.is_none() {
      inner.pump = Some(self.spawn_pump());
      debug!("realtime pump started");
    }

    Ok(RealtimeGuard {
      inner: Arc::clone(&self.inner),
    })
  }

  /// Re-register interest after a transport reconnect.
  ///
  /// Idempotent: the old pump is replaced, never duplicated, and with no
  /// active subscribers this is a no-op.
  pub fn resubscribe(&self) -> Result<()> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if inner.subscribers == 0 {
      return Ok(());
    }

    if let Some(old) = inner.pump.take() {
      old.abort();
    }
    inner.pump = Some(self.spawn_pump());
    debug!("realtime pump re-registered");

    Ok(())
  }

  /// Whether the pump task is currently running.
  pub fn is_running(&self) -> bool {
    self
      .inner
      .lock()
      .map(|inner| inner.pump.is_some())
      .unwrap_or(false)
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .inner
      .lock()
      .map(|inner| inner.subscribers)
      .unwrap_or(0)
  }

  fn spawn_pump(&self) -> JoinHandle<()> {
    // Subscribe before spawning so no event between acquire and the task's
    // first poll is missed.
    let mut rx = self.source.subscribe_changes();
    let store = Arc::clone(&self.store);
    let favorites = Arc::clone(&self.favorites);
    let bus = self.bus.clone();

    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(event) => apply_change(&store, &favorites, &bus, event),
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            // Missed patches are healed by the periodic/drift checks.
            warn!(missed, "realtime stream lagged");
          }
          Err(broadcast::error::RecvError::Closed) => {
            debug!("realtime stream closed");
            break;
          }
        }
      }
    })
  }
}

fn apply_change(
  store: &BillStore,
  favorites: &FavoritesCache,
  bus: &EventBus,
  event: ChangeEvent,
) {
  match event {
    ChangeEvent::Bill { kind, old, new } => match kind {
      ChangeKind::Insert | ChangeKind::Update => {
        let Some(bill) = new else {
          debug!("bill change event without new record, skipping");
          return;
        };
        match store.upsert(&bill) {
          Ok(inserted) => {
            debug!(bill_id = %bill.bill_id, inserted, "bill patch applied");
            bus.emit(CacheEvent::BillPatched {
              kind,
              bill_id: bill.bill_id.clone(),
              bill: Some(bill),
            });
          }
          Err(e) => warn!("failed to apply bill patch: {e:#}"),
        }
      }
      ChangeKind::Delete => {
        let Some(bill_id) = old.map(|b| b.bill_id).or_else(|| new.map(|b| b.bill_id)) else {
          debug!("bill delete event without record, skipping");
          return;
        };
        match store.remove(&bill_id) {
          Ok(true) => {
            debug!(bill_id = %bill_id, "bill removed");
            bus.emit(CacheEvent::BillPatched {
              kind,
              bill_id,
              bill: None,
            });
          }
          Ok(false) => debug!(bill_id = %bill_id, "delete for uncached bill"),
          Err(e) => warn!("failed to apply bill delete: {e:#}"),
        }
      }
    },
    ChangeEvent::Favorite { user_id, kind, .. } => {
      debug!(%user_id, ?kind, "favorite change, invalidating side-cache");
      if let Err(e) = favorites.invalidate(&user_id) {
        warn!("failed to invalidate favorites: {e:#}");
      }
    }
  }
}

/// Reference-counted handle to the shared subscription.
pub struct RealtimeGuard {
  inner: Arc<Mutex<PumpState>>,
}

impl Drop for RealtimeGuard {
  fn drop(&mut self) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.subscribers = inner.subscribers.saturating_sub(1);
      if inner.subscribers == 0 {
        if let Some(pump) = inner.pump.take() {
          pump.abort();
          debug!("realtime pump stopped");
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bill::types::FavoriteEntry;
  use crate::config::Config;
  use crate::testutil::{make_bill, make_bills, FakeSource};
  use chrono::Utc;
  use std::time::Duration;

  struct Fixture {
    sync: RealtimeSync,
    store: Arc<BillStore>,
    favorites: Arc<FavoritesCache>,
    source: Arc<FakeSource>,
    bus: EventBus,
  }

  fn fixture() -> Fixture {
    let config = Config::default();
    let bus = EventBus::new();
    let store = Arc::new(BillStore::open_in_memory(&config).unwrap());
    let favorites = Arc::new(FavoritesCache::open_in_memory(&config, bus.clone()).unwrap());
    let source = Arc::new(FakeSource::new(Vec::new()));
    let sync = RealtimeSync::new(
      Arc::clone(&store),
      Arc::clone(&favorites),
      source.clone() as Arc<dyn BillSource>,
      bus.clone(),
    );
    Fixture {
      sync,
      store,
      favorites,
      source,
      bus,
    }
  }

  async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
      loop {
        if check() {
          return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("condition not reached in time");
  }

  #[tokio::test]
  async fn insert_events_are_merged_by_primary_key() {
    let f = fixture();
    f.store.replace_all(&make_bills(2), 2).await.unwrap();
    let _guard = f.sync.acquire().unwrap();

    let bill = make_bill("new", "99", Some("2024-05-01"));
    f.source.push_change(ChangeEvent::Bill {
      kind: ChangeKind::Insert,
      old: None,
      new: Some(bill.clone()),
    });
    // Same event twice: still exactly one row.
    f.source.push_change(ChangeEvent::Bill {
      kind: ChangeKind::Insert,
      old: None,
      new: Some(bill),
    });

    wait_until(|| f.store.get("new").unwrap().is_some()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cached = f.store.get_all().unwrap().unwrap();
    assert_eq!(cached.len(), 3);
    assert_eq!(cached.iter().filter(|b| b.bill_id == "new").count(), 1);
  }

  #[tokio::test]
  async fn update_events_replace_the_matching_row_only() {
    let f = fixture();
    f.store.replace_all(&make_bills(3), 3).await.unwrap();
    let _guard = f.sync.acquire().unwrap();

    let mut changed = f.store.get("b0000").unwrap().unwrap();
    changed.bill_name = "Amended".to_string();
    f.source.push_change(ChangeEvent::Bill {
      kind: ChangeKind::Update,
      old: None,
      new: Some(changed),
    });

    wait_until(|| {
      f.store.get("b0000").unwrap().map(|b| b.bill_name) == Some("Amended".to_string())
    })
    .await;

    assert_eq!(f.store.count().unwrap(), 3);
    assert_ne!(f.store.get("b0001").unwrap().unwrap().bill_name, "Amended");
  }

  #[tokio::test]
  async fn delete_events_remove_exactly_one_row() {
    let f = fixture();
    f.store.replace_all(&make_bills(3), 3).await.unwrap();
    let _guard = f.sync.acquire().unwrap();

    f.source.push_change(ChangeEvent::Bill {
      kind: ChangeKind::Delete,
      old: Some(make_bill("b0001", "1", None)),
      new: None,
    });

    wait_until(|| f.store.get("b0001").unwrap().is_none()).await;

    let cached = f.store.get_all().unwrap().unwrap();
    assert_eq!(cached.len(), 2);
    assert!(cached.iter().all(|b| b.bill_id != "b0001"));
  }

  #[tokio::test]
  async fn favorite_changes_invalidate_the_side_cache() {
    let f = fixture();
    f.favorites
      .set(
        "u1",
        &[FavoriteEntry {
          user_id: "u1".to_string(),
          bill_id: "a".to_string(),
          created_at: Utc::now(),
          bill: None,
        }],
      )
      .unwrap();
    let _guard = f.sync.acquire().unwrap();

    f.source.push_change(ChangeEvent::Favorite {
      kind: ChangeKind::Insert,
      user_id: "u1".to_string(),
      bill_id: "b".to_string(),
    });

    wait_until(|| f.favorites.get("u1").unwrap().is_none()).await;
  }

  #[tokio::test]
  async fn pump_is_shared_and_torn_down_with_the_last_guard() {
    let f = fixture();

    let first = f.sync.acquire().unwrap();
    let second = f.sync.acquire().unwrap();
    assert!(f.sync.is_running());
    assert_eq!(f.sync.subscriber_count(), 2);

    drop(first);
    assert!(f.sync.is_running());

    drop(second);
    assert!(!f.sync.is_running());
    assert_eq!(f.sync.subscriber_count(), 0);
  }

  #[tokio::test]
  async fn resubscribe_does_not_accumulate_handlers() {
    let f = fixture();
    f.store.replace_all(&make_bills(1), 1).await.unwrap();
    let _guard = f.sync.acquire().unwrap();

    f.sync.resubscribe().unwrap();
    assert!(f.sync.is_running());

    let mut rx = f.bus.subscribe();
    f.source.push_change(ChangeEvent::Bill {
      kind: ChangeKind::Insert,
      old: None,
      new: Some(make_bill("x", "7", None)),
    });

    wait_until(|| f.store.get("x").unwrap().is_some()).await;

    // Exactly one patch notification: a duplicated pump would emit two.
    let mut patched = 0;
    while let Ok(event) = rx.try_recv() {
      if matches!(event, CacheEvent::BillPatched { .. }) {
        patched += 1;
      }
    }
    assert_eq!(patched, 1);
  }

  #[tokio::test]
  async fn resubscribe_without_subscribers_is_a_noop() {
    let f = fixture();
    f.sync.resubscribe().unwrap();
    assert!(!f.sync.is_running());
  }
}
