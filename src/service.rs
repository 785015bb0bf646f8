//! View-facing façade over the cache and sync layer.
//!
//! `BillDataService` is constructed explicitly and injected into whatever
//! holds application state; there is no module-level singleton, so tests get
//! isolation from fresh instances. It owns the stores, the loader, the
//! invalidation engine and the realtime manager, and maintains the snapshot
//! views render from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use color_eyre::Result;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bill::source::BillSource;
use crate::bill::types::{sort_bills, BillRecord, ChangeKind, FavoriteAction, FavoriteEntry};
use crate::cache::events::{CacheEvent, EventBus, InvalidationReason};
use crate::cache::favorites::FavoritesCache;
use crate::cache::invalidation::InvalidationEngine;
use crate::cache::loader::{LoadProgress, ProgressiveLoader};
use crate::cache::realtime::{RealtimeGuard, RealtimeSync};
use crate::cache::store::BillStore;
use crate::config::Config;

/// Snapshot consumed by views.
#[derive(Debug, Clone, Default)]
pub struct BillData {
  pub bills: Vec<BillRecord>,
  pub loading: bool,
  pub error: Option<String>,
  pub total_count: u64,
}

/// Diagnostic counters for the administrative surface.
#[derive(Debug, Clone)]
pub struct CacheStats {
  /// Rows currently in the bills store.
  pub size: u64,
  pub last_updated: Option<DateTime<Utc>>,
  pub total_count: u64,
}

/// Which path a favorites load actually took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoritesOrigin {
  /// Served from the per-user side-cache.
  SideCache,
  /// Favorite ids joined against the warm bills cache.
  Hybrid,
  /// Full fetch from the remote source (bills cache was cold).
  Remote,
}

/// Façade wiring the cache components together for view consumption.
pub struct BillDataService {
  store: Arc<BillStore>,
  favorites: Arc<FavoritesCache>,
  source: Arc<dyn BillSource>,
  bus: EventBus,
  loader: ProgressiveLoader,
  invalidation: InvalidationEngine,
  realtime: RealtimeSync,
  state: Arc<Mutex<BillData>>,
  active_user: Mutex<Option<String>>,
}

impl BillDataService {
  /// Build a service over the on-disk stores.
  pub fn new(config: &Config, source: Arc<dyn BillSource>) -> Result<Self> {
    let bus = EventBus::new();
    let store = Arc::new(BillStore::open(config)?);
    let favorites = Arc::new(FavoritesCache::open(config, bus.clone())?);
    Ok(Self::from_parts(config, source, store, favorites, bus))
  }

  /// Build a service over explicitly injected stores (tests, embedders).
  pub fn from_parts(
    config: &Config,
    source: Arc<dyn BillSource>,
    store: Arc<BillStore>,
    favorites: Arc<FavoritesCache>,
    bus: EventBus,
  ) -> Self {
    let loader = ProgressiveLoader::new(
      Arc::clone(&store),
      Arc::clone(&source),
      bus.clone(),
      config,
    );
    let invalidation = InvalidationEngine::new(
      Arc::clone(&store),
      Arc::clone(&favorites),
      Arc::clone(&source),
      bus.clone(),
      config,
    );
    let realtime = RealtimeSync::new(
      Arc::clone(&store),
      Arc::clone(&favorites),
      Arc::clone(&source),
      bus.clone(),
    );

    let state = Arc::new(Mutex::new(BillData::default()));
    spawn_state_task(bus.subscribe(), Arc::clone(&state), Arc::clone(&store));

    Self {
      store,
      favorites,
      source,
      bus,
      loader,
      invalidation,
      realtime,
      state,
      active_user: Mutex::new(None),
    }
  }

  /// Current snapshot for rendering.
  pub fn bill_data(&self) -> BillData {
    self
      .state
      .lock()
      .map(|s| s.clone())
      .unwrap_or_default()
  }

  /// Run a load cycle and update the snapshot.
  ///
  /// Initial-fetch failures are surfaced (the UI shows them with a retry);
  /// the background fill keeps updating the snapshot after this returns.
  pub async fn load(&self) -> Result<BillData> {
    if let Ok(mut state) = self.state.lock() {
      state.loading = true;
      state.error = None;
    }

    match self.loader.load().await {
      Ok(outcome) => {
        let mut state = self
          .state
          .lock()
          .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))?;
        state.bills = outcome.bills;
        state.total_count = outcome.total_count;
        state.loading = false;
        Ok(state.clone())
      }
      Err(e) => {
        if let Ok(mut state) = self.state.lock() {
          state.loading = false;
          state.error = Some(format!("{e:#}"));
        }
        Err(e)
      }
    }
  }

  /// Ignore the cache and refetch from the remote source.
  pub async fn refresh(&self) -> Result<BillData> {
    if let Err(e) = self.store.clear() {
      warn!("failed to clear bills store before refresh: {e:#}");
    }
    self.load().await
  }

  /// Progress of the current load cycle, for "X of Y loaded" displays.
  pub fn progress(&self) -> LoadProgress {
    self.loader.progress()
  }

  /// Subscribe to cache events for cross-component reconciliation.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.bus.subscribe()
  }

  /// Favorites for one user, with the load path taken as part of the result:
  /// side-cache hit, hybrid join against the warm bills cache, or a full
  /// remote fetch.
  pub async fn favorites(
    &self,
    user_id: &str,
  ) -> Result<(Vec<FavoriteEntry>, FavoritesOrigin)> {
    self.note_active_user(user_id);

    match self.favorites.get(user_id) {
      Ok(Some(entries)) => return Ok((entries, FavoritesOrigin::SideCache)),
      Ok(None) => {}
      Err(e) => warn!("favorites cache unavailable: {e:#}"),
    }

    let cached_bills = match self.store.get_all() {
      Ok(bills) => bills,
      Err(e) => {
        warn!("bills cache unavailable for hybrid favorites: {e:#}");
        None
      }
    };

    if let Some(bills) = cached_bills {
      // Warm bills cache: only the id list crosses the network.
      let refs = self.source.fetch_favorite_ids(user_id).await?;
      let by_id: HashMap<&str, &BillRecord> =
        bills.iter().map(|b| (b.bill_id.as_str(), b)).collect();

      let mut entries: Vec<FavoriteEntry> = refs
        .into_iter()
        .map(|(bill_id, created_at)| {
          let bill = by_id.get(bill_id.as_str()).map(|b| (*b).clone());
          FavoriteEntry {
            user_id: user_id.to_string(),
            bill_id,
            created_at,
            bill,
          }
        })
        .collect();
      entries.sort_by(|a, b| {
        b.created_at
          .cmp(&a.created_at)
          .then_with(|| a.bill_id.cmp(&b.bill_id))
      });

      if let Err(e) = self.favorites.set(user_id, &entries) {
        warn!("failed to cache favorites: {e:#}");
      }
      debug!(user_id, count = entries.len(), "favorites loaded via hybrid join");
      return Ok((entries, FavoritesOrigin::Hybrid));
    }

    let entries = self.source.fetch_favorites(user_id).await?;
    if let Err(e) = self.favorites.set(user_id, &entries) {
      warn!("failed to cache favorites: {e:#}");
    }
    debug!(user_id, count = entries.len(), "favorites loaded from remote");
    Ok((entries, FavoritesOrigin::Remote))
  }

  fn note_active_user(&self, user_id: &str) {
    if let Ok(mut active) = self.active_user.lock() {
      let switched = active.as_deref().is_some_and(|prev| prev != user_id);
      if switched {
        if let Err(e) = self.favorites.retain_only(user_id) {
          warn!("failed to drop previous user's favorites: {e:#}");
        }
      }
      *active = Some(user_id.to_string());
    }
  }

  /// Toggle a favorite: the remote store mutates first, then the side-cache
  /// is patched opportunistically for immediate feedback.
  pub async fn toggle_favorite(&self, user_id: &str, bill_id: &str, add: bool) -> Result<()> {
    let action = if add {
      FavoriteAction::Add
    } else {
      FavoriteAction::Remove
    };

    self.source.mutate_favorite(user_id, bill_id, action).await?;

    let bill = if add {
      self.store.get(bill_id).unwrap_or_else(|e| {
        warn!("bill lookup for favorite snapshot failed: {e:#}");
        None
      })
    } else {
      None
    };

    if let Err(e) = self
      .favorites
      .patch_one(user_id, bill_id, action, bill.as_ref())
    {
      // The next favorites read misses and refetches; not the caller's
      // problem.
      warn!("favorite patch failed: {e:#}");
    }

    Ok(())
  }

  /// Diagnostic counters.
  pub fn cache_stats(&self) -> Result<CacheStats> {
    let meta = self.store.get_metadata()?;
    Ok(CacheStats {
      size: self.store.count()?,
      last_updated: meta.as_ref().map(|m| m.last_updated),
      total_count: meta.map(|m| m.total_count).unwrap_or(0),
    })
  }

  /// Administrative clear of both stores, broadcast to mounted views.
  pub fn clear_cache(&self) {
    self
      .invalidation
      .invalidate(InvalidationReason::Manual, None);
  }

  /// Session-boundary and forced-sync checks; call on startup.
  pub fn on_session_start(&self, hard_reload: bool) -> bool {
    self.invalidation.on_session_start(hard_reload)
  }

  /// Throttled drift check; call when the page regains focus.
  pub async fn on_focus_regained(&self) {
    self.invalidation.on_focus_regained().await
  }

  /// Persist the exit timestamp the session-boundary heuristic reads.
  pub fn record_exit(&self) -> Result<()> {
    self.invalidation.record_exit()
  }

  /// Hold live patching for as long as the guard lives.
  pub fn realtime(&self) -> Result<RealtimeGuard> {
    self.realtime.acquire()
  }

  /// Re-register realtime interest after a transport reconnect.
  pub fn resubscribe_realtime(&self) -> Result<()> {
    self.realtime.resubscribe()
  }
}

/// Keep the render snapshot in step with bus events: realtime patches merge
/// into the in-memory list, a completed fill swaps in the full dataset.
fn spawn_state_task(
  mut rx: broadcast::Receiver<CacheEvent>,
  state: Arc<Mutex<BillData>>,
  store: Arc<BillStore>,
) {
  tokio::spawn(async move {
    loop {
      match rx.recv().await {
        Ok(event) => apply_event(&state, &store, event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          warn!(missed, "state task lagged behind cache events");
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });
}

fn apply_event(state: &Mutex<BillData>, store: &BillStore, event: CacheEvent) {
  match event {
    CacheEvent::BillPatched {
      kind,
      bill_id,
      bill,
    } => {
      let Ok(mut state) = state.lock() else { return };
      match kind {
        ChangeKind::Insert | ChangeKind::Update => {
          let Some(bill) = bill else { return };
          if let Some(existing) = state.bills.iter_mut().find(|b| b.bill_id == bill.bill_id) {
            *existing = bill;
          } else {
            state.bills.push(bill);
            sort_bills(&mut state.bills);
            state.total_count += 1;
          }
        }
        ChangeKind::Delete => {
          let before = state.bills.len();
          state.bills.retain(|b| b.bill_id != bill_id);
          if state.bills.len() < before {
            state.total_count = state.total_count.saturating_sub(1);
          }
        }
      }
    }
    CacheEvent::BillsRefreshed { .. } => {
      // The fill just wrote the complete dataset; swap it in.
      match store.get_all() {
        Ok(Some(bills)) => {
          if let Ok(mut state) = state.lock() {
            state.total_count = bills.len() as u64;
            state.bills = bills;
            state.loading = false;
          }
        }
        Ok(None) => {}
        Err(e) => warn!("failed to reload snapshot after fill: {e:#}"),
      }
    }
    // Views re-trigger their own load on invalidation; favorites updates
    // only concern favorite views.
    CacheEvent::Invalidated { .. } | CacheEvent::FavoritesUpdated { .. } => {}
  }
}
