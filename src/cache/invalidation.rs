//! Staleness detection and cache invalidation.
//!
//! Decides, independent of any specific load, whether the local stores are
//! stale enough to discard. Four triggers, each sufficient on its own:
//! metadata expiry, remote drift (on focus regain, throttled), session
//! boundary (long gap since last exit or a hard reload), and a rolling
//! forced sync that bounds staleness from missed realtime events.
//!
//! Checks never run concurrently with themselves: an explicit two-state
//! machine rejects triggers that fire while a check is in flight. Rejected
//! triggers are dropped, not queued.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use color_eyre::Result;
use tracing::{debug, info, warn};

use super::events::{CacheEvent, EventBus, InvalidationReason};
use super::favorites::FavoritesCache;
use super::store::{parse_timestamp, BillStore};
use crate::bill::source::BillSource;
use crate::config::Config;

/// Persisted mark: when the page/process last exited cleanly.
pub const MARK_LAST_EXIT: &str = "last_exit";
/// Persisted mark: when the last forced sync ran.
pub const MARK_LAST_FORCED_SYNC: &str = "last_forced_sync";

/// Whether a staleness check is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckState {
  Idle = 0,
  Checking = 1,
}

impl From<u8> for CheckState {
  fn from(v: u8) -> Self {
    match v {
      1 => CheckState::Checking,
      _ => CheckState::Idle,
    }
  }
}

/// Decides when the cached dataset can no longer be trusted.
pub struct InvalidationEngine {
  store: Arc<BillStore>,
  favorites: Arc<FavoritesCache>,
  source: Arc<dyn BillSource>,
  bus: EventBus,
  state: AtomicU8,
  last_drift_check: Mutex<Option<Instant>>,
  bills_expiry: chrono::Duration,
  drift_threshold: chrono::Duration,
  drift_check_interval: Duration,
  session_gap: chrono::Duration,
  forced_sync_interval: chrono::Duration,
}

impl InvalidationEngine {
  pub fn new(
    store: Arc<BillStore>,
    favorites: Arc<FavoritesCache>,
    source: Arc<dyn BillSource>,
    bus: EventBus,
    config: &Config,
  ) -> Self {
    Self {
      store,
      favorites,
      source,
      bus,
      state: AtomicU8::new(CheckState::Idle as u8),
      last_drift_check: Mutex::new(None),
      bills_expiry: config.bills_expiry(),
      drift_threshold: config.drift_threshold(),
      drift_check_interval: config
        .drift_check_interval()
        .to_std()
        .unwrap_or(Duration::ZERO),
      session_gap: config.session_gap(),
      forced_sync_interval: config.forced_sync_interval(),
    }
  }

  /// Current state of the check machine.
  pub fn state(&self) -> CheckState {
    CheckState::from(self.state.load(Ordering::SeqCst))
  }

  /// Transition `Idle -> Checking`. A failed transition means a check is
  /// already in flight and this trigger firing is dropped.
  fn begin_check(&self) -> bool {
    self
      .state
      .compare_exchange(
        CheckState::Idle as u8,
        CheckState::Checking as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
      )
      .is_ok()
  }

  fn finish_check(&self) {
    self.state.store(CheckState::Idle as u8, Ordering::SeqCst);
  }

  /// Drift check, wired to focus/visibility regain.
  ///
  /// Throttled to at most one remote probe per configured interval; compares
  /// the most recent remote mutation timestamp against the cached
  /// `last_updated` and invalidates when the gap exceeds the threshold.
  pub async fn on_focus_regained(&self) {
    {
      let mut last = match self.last_drift_check.lock() {
        Ok(guard) => guard,
        Err(_) => return,
      };
      if let Some(at) = *last {
        if at.elapsed() < self.drift_check_interval {
          debug!("drift check throttled");
          return;
        }
      }
      *last = Some(Instant::now());
    }

    if !self.begin_check() {
      debug!("staleness check already in flight, dropping drift trigger");
      return;
    }

    self.run_drift_check().await;
    self.finish_check();
  }

  async fn run_drift_check(&self) {
    let meta = match self.store.get_metadata() {
      Ok(Some(meta)) => meta,
      // Nothing cached: nothing to invalidate.
      Ok(None) => return,
      Err(e) => {
        warn!("drift check skipped, cache unavailable: {e:#}");
        return;
      }
    };

    let latest = match self.source.latest_update().await {
      Ok(Some(ts)) => ts,
      Ok(None) => return,
      Err(e) => {
        // Best-effort background activity: log only.
        warn!("drift probe failed: {e:#}");
        return;
      }
    };

    let drift = latest - meta.last_updated;
    if drift > self.drift_threshold {
      info!(drift_minutes = drift.num_minutes(), "remote drift detected");
      self.invalidate(InvalidationReason::RemoteDrift, Some(drift));
    }
  }

  /// Startup checks, wired to page load / process start.
  ///
  /// Returns `true` when any trigger invalidated the caches.
  pub fn on_session_start(&self, hard_reload: bool) -> bool {
    if !self.begin_check() {
      debug!("staleness check already in flight, dropping session trigger");
      return false;
    }

    let invalidated = self.run_session_checks(hard_reload);
    self.finish_check();
    invalidated
  }

  fn run_session_checks(&self, hard_reload: bool) -> bool {
    let now = Utc::now();

    if hard_reload {
      self.invalidate(InvalidationReason::SessionBoundary, None);
      return true;
    }

    // Long gap since the last recorded exit starts a new session.
    match self.store.get_mark(MARK_LAST_EXIT) {
      Ok(Some(value)) => {
        if let Ok(last_exit) = parse_timestamp(&value) {
          if now - last_exit > self.session_gap {
            self.invalidate(InvalidationReason::SessionBoundary, None);
            return true;
          }
        }
      }
      Ok(None) => {}
      Err(e) => warn!("session mark unavailable: {e:#}"),
    }

    // Expired metadata is discarded eagerly so views get the broadcast.
    match self.store.get_metadata() {
      Ok(Some(meta)) if now - meta.last_updated > self.bills_expiry => {
        self.invalidate(InvalidationReason::Expired, None);
        return true;
      }
      Ok(_) => {}
      Err(e) => warn!("metadata unavailable: {e:#}"),
    }

    // Rolling forced sync, at most once per window.
    match self.store.get_mark(MARK_LAST_FORCED_SYNC) {
      Ok(Some(value)) => {
        if let Ok(last_sync) = parse_timestamp(&value) {
          if now - last_sync > self.forced_sync_interval {
            self.set_forced_sync_mark(now);
            self.invalidate(InvalidationReason::PeriodicSync, None);
            return true;
          }
        }
      }
      // First run: start the window without discarding anything.
      Ok(None) => self.set_forced_sync_mark(now),
      Err(e) => warn!("forced sync mark unavailable: {e:#}"),
    }

    false
  }

  fn set_forced_sync_mark(&self, now: chrono::DateTime<Utc>) {
    if let Err(e) = self.store.set_mark(MARK_LAST_FORCED_SYNC, &now.to_rfc3339()) {
      warn!("failed to persist forced sync mark: {e:#}");
    }
  }

  /// Record the page-exit timestamp used by the session-boundary heuristic.
  pub fn record_exit(&self) -> Result<()> {
    self.store.set_mark(MARK_LAST_EXIT, &Utc::now().to_rfc3339())
  }

  /// Clear both stores and broadcast the reason so mounted views re-trigger
  /// their own load.
  pub fn invalidate(&self, reason: InvalidationReason, drift: Option<chrono::Duration>) {
    info!(?reason, "invalidating cached stores");

    if let Err(e) = self.store.clear() {
      warn!("failed to clear bills store: {e:#}");
    }
    if let Err(e) = self.favorites.clear() {
      warn!("failed to clear favorites store: {e:#}");
    }

    self.bus.emit(CacheEvent::Invalidated { reason, drift });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::{make_bills, FakeSource};

  struct Fixture {
    engine: InvalidationEngine,
    store: Arc<BillStore>,
    source: Arc<FakeSource>,
    bus: EventBus,
  }

  fn fixture(config: &Config) -> Fixture {
    let bus = EventBus::new();
    let store = Arc::new(BillStore::open_in_memory(config).unwrap());
    let favorites =
      Arc::new(FavoritesCache::open_in_memory(config, bus.clone()).unwrap());
    let source = Arc::new(FakeSource::new(make_bills(5)));
    let engine = InvalidationEngine::new(
      Arc::clone(&store),
      favorites,
      source.clone() as Arc<dyn BillSource>,
      bus.clone(),
      config,
    );
    Fixture {
      engine,
      store,
      source,
      bus,
    }
  }

  fn mark(store: &BillStore, key: &str, ago: chrono::Duration) {
    store
      .set_mark(key, &(Utc::now() - ago).to_rfc3339())
      .unwrap();
  }

  #[tokio::test]
  async fn long_exit_gap_starts_a_new_session() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    mark(&f.store, MARK_LAST_EXIT, chrono::Duration::minutes(31));
    let mut rx = f.bus.subscribe();

    assert!(f.engine.on_session_start(false));
    assert!(f.store.get_all().unwrap().is_none());

    match rx.recv().await.unwrap() {
      CacheEvent::Invalidated { reason, .. } => {
        assert_eq!(reason, InvalidationReason::SessionBoundary)
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn recent_exit_keeps_the_cache() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    mark(&f.store, MARK_LAST_EXIT, chrono::Duration::minutes(1));

    assert!(!f.engine.on_session_start(false));
    assert!(f.store.get_all().unwrap().is_some());
  }

  #[tokio::test]
  async fn hard_reload_invalidates_unconditionally() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    mark(&f.store, MARK_LAST_EXIT, chrono::Duration::seconds(10));

    assert!(f.engine.on_session_start(true));
    assert!(f.store.get_all().unwrap().is_none());
  }

  #[tokio::test]
  async fn forced_sync_fires_once_per_window() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    mark(&f.store, MARK_LAST_EXIT, chrono::Duration::minutes(1));
    mark(&f.store, MARK_LAST_FORCED_SYNC, chrono::Duration::hours(25));

    assert!(f.engine.on_session_start(false));

    // The mark was advanced, so the next session start is quiet.
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    mark(&f.store, MARK_LAST_EXIT, chrono::Duration::minutes(1));
    assert!(!f.engine.on_session_start(false));
  }

  #[tokio::test]
  async fn first_run_starts_the_forced_sync_window_quietly() {
    let f = fixture(&Config::default());

    assert!(!f.engine.on_session_start(false));
    assert!(f
      .store
      .get_mark(MARK_LAST_FORCED_SYNC)
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn expired_metadata_is_discarded_at_session_start() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    f.store
      .stamp_metadata(Utc::now() - chrono::Duration::hours(25), 5)
      .unwrap();
    mark(&f.store, MARK_LAST_EXIT, chrono::Duration::minutes(1));
    mark(&f.store, MARK_LAST_FORCED_SYNC, chrono::Duration::hours(1));
    let mut rx = f.bus.subscribe();

    assert!(f.engine.on_session_start(false));

    match rx.recv().await.unwrap() {
      CacheEvent::Invalidated { reason, .. } => {
        assert_eq!(reason, InvalidationReason::Expired)
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn drift_beyond_threshold_invalidates() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    f.store
      .stamp_metadata(Utc::now() - chrono::Duration::hours(2), 5)
      .unwrap();
    f.source.set_latest(Some(Utc::now()));
    let mut rx = f.bus.subscribe();

    f.engine.on_focus_regained().await;

    assert!(f.store.get_all().unwrap().is_none());
    match rx.recv().await.unwrap() {
      CacheEvent::Invalidated { reason, drift } => {
        assert_eq!(reason, InvalidationReason::RemoteDrift);
        assert!(drift.unwrap() > chrono::Duration::hours(1));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn small_drift_is_tolerated() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    f.store
      .stamp_metadata(Utc::now() - chrono::Duration::minutes(10), 5)
      .unwrap();
    f.source.set_latest(Some(Utc::now()));

    f.engine.on_focus_regained().await;

    assert!(f.store.get_all().unwrap().is_some());
  }

  #[tokio::test]
  async fn drift_checks_are_throttled() {
    let f = fixture(&Config::default());
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    f.source.set_latest(Some(Utc::now()));

    f.engine.on_focus_regained().await;
    f.engine.on_focus_regained().await;

    assert_eq!(f.source.latest_calls(), 1);
  }

  #[tokio::test]
  async fn concurrent_triggers_are_dropped_not_queued() {
    let config = Config {
      drift_check_interval_minutes: 0,
      ..Config::default()
    };
    let f = fixture(&config);
    f.store.replace_all(&make_bills(5), 5).await.unwrap();
    f.source.set_latest(Some(Utc::now()));
    f.source.set_latency(Duration::from_millis(50));

    tokio::join!(f.engine.on_focus_regained(), f.engine.on_focus_regained());

    assert_eq!(f.source.latest_calls(), 1);
    assert_eq!(f.engine.state(), CheckState::Idle);
  }
}
