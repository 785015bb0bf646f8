//! Progressive population of the bills store.
//!
//! A load cycle runs `CacheCheck -> CacheHit | CacheMiss -> InitialFetch ->
//! DisplayReady -> BackgroundFill -> Done`. The cache check always completes
//! before any fetch is issued; the initial fetch bounds time-to-first-render
//! independent of dataset size and is returned to the caller before the
//! background fill starts; `replace_all` runs only once the full remaining
//! set has been assembled, so a previously-complete cache is never
//! overwritten with a partial one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::Result;
use futures::future::try_join_all;
use tracing::{debug, warn};

use super::events::{CacheEvent, EventBus};
use super::store::BillStore;
use crate::bill::source::{BillOrder, BillSource};
use crate::bill::types::{sort_bills, BillRecord};
use crate::config::Config;

/// Stage of the current load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
  #[default]
  Idle,
  CacheCheck,
  InitialFetch,
  /// Initial page fetched; the caller may render a partial set.
  DisplayReady,
  BackgroundFill,
  Done,
  /// Initial fetch failed; the cycle is over and the error was surfaced.
  Failed,
}

/// Poll-style progress snapshot for the current cycle.
#[derive(Debug, Clone, Default)]
pub struct LoadProgress {
  pub phase: LoadPhase,
  /// Rows available so far (cached, fetched or merged).
  pub loaded: u64,
  /// Authoritative total reported by the count query.
  pub total: u64,
  pub cache_hit: bool,
}

impl LoadProgress {
  /// Monotonic 0..=100 within a cycle.
  pub fn percent(&self) -> u8 {
    if self.total == 0 {
      return if self.phase == LoadPhase::Done { 100 } else { 0 };
    }
    (((self.loaded as f64 / self.total as f64) * 100.0) as u8).min(100)
  }
}

/// What a load cycle handed back for immediate display.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
  pub bills: Vec<BillRecord>,
  pub total_count: u64,
  pub cache_hit: bool,
}

/// Orchestrates cache-first population of the bills store.
pub struct ProgressiveLoader {
  store: Arc<BillStore>,
  source: Arc<dyn BillSource>,
  bus: EventBus,
  initial_page_size: u64,
  fill_page_size: u64,
  fill_fan_out: usize,
  fill_pause: Duration,
  progress: Arc<Mutex<LoadProgress>>,
  fill_running: Arc<AtomicBool>,
}

impl ProgressiveLoader {
  pub fn new(
    store: Arc<BillStore>,
    source: Arc<dyn BillSource>,
    bus: EventBus,
    config: &Config,
  ) -> Self {
    Self {
      store,
      source,
      bus,
      initial_page_size: config.initial_page_size.max(1),
      fill_page_size: config.fill_page_size.max(1),
      fill_fan_out: config.fill_fan_out.max(1),
      fill_pause: Duration::from_millis(config.fill_pause_ms),
      progress: Arc::new(Mutex::new(LoadProgress::default())),
      fill_running: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Snapshot of the current cycle's progress.
  pub fn progress(&self) -> LoadProgress {
    self
      .progress
      .lock()
      .map(|p| p.clone())
      .unwrap_or_default()
  }

  fn update_progress(&self, f: impl FnOnce(&mut LoadProgress)) {
    update_progress(&self.progress, f);
  }

  /// Run one load cycle.
  ///
  /// On a cache hit the full cached set is returned immediately. On a miss
  /// the initial page is fetched (failure here is fatal and surfaced to the
  /// caller), returned for display, and the remainder is filled in by a
  /// background task. A fill already in flight is never duplicated.
  pub async fn load(&self) -> Result<LoadOutcome> {
    self.update_progress(|p| {
      *p = LoadProgress {
        phase: LoadPhase::CacheCheck,
        ..LoadProgress::default()
      }
    });

    // Cache check completes before any fetch is issued. A broken store is
    // "cache unavailable", not an error: fall through to the remote path.
    match self.store.get_all() {
      Ok(Some(bills)) => {
        let total = bills.len() as u64;
        self.update_progress(|p| {
          p.phase = LoadPhase::Done;
          p.loaded = total;
          p.total = total;
          p.cache_hit = true;
        });
        debug!(rows = total, "bill cache hit");
        return Ok(LoadOutcome {
          bills,
          total_count: total,
          cache_hit: true,
        });
      }
      Ok(None) => debug!("bill cache miss"),
      Err(e) => warn!("bill cache unavailable, falling back to remote: {e:#}"),
    }

    self.update_progress(|p| p.phase = LoadPhase::InitialFetch);

    let total_count = match self.source.count_bills().await {
      Ok(count) => count,
      Err(e) => {
        self.update_progress(|p| p.phase = LoadPhase::Failed);
        return Err(e);
      }
    };

    let initial = match self
      .source
      .fetch_bills(BillOrder::Proposed, 0, self.initial_page_size)
      .await
    {
      Ok(bills) => bills,
      Err(e) => {
        self.update_progress(|p| p.phase = LoadPhase::Failed);
        return Err(e);
      }
    };

    let loaded = initial.len() as u64;
    self.update_progress(|p| {
      p.phase = LoadPhase::DisplayReady;
      p.loaded = loaded;
      p.total = total_count;
    });
    debug!(loaded, total_count, "initial page fetched");

    self.spawn_fill(initial.clone(), total_count);

    Ok(LoadOutcome {
      bills: initial,
      total_count,
      cache_hit: false,
    })
  }

  fn spawn_fill(&self, initial: Vec<BillRecord>, total_count: u64) {
    if self
      .fill_running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("background fill already in flight, not starting another");
      return;
    }

    self.update_progress(|p| p.phase = LoadPhase::BackgroundFill);

    let job = FillJob {
      store: Arc::clone(&self.store),
      source: Arc::clone(&self.source),
      bus: self.bus.clone(),
      fill_page_size: self.fill_page_size,
      fill_fan_out: self.fill_fan_out,
      fill_pause: self.fill_pause,
      progress: Arc::clone(&self.progress),
      fill_running: Arc::clone(&self.fill_running),
    };

    tokio::spawn(job.run(initial, total_count));
  }
}

/// Everything the background fill task owns.
struct FillJob {
  store: Arc<BillStore>,
  source: Arc<dyn BillSource>,
  bus: EventBus,
  fill_page_size: u64,
  fill_fan_out: usize,
  fill_pause: Duration,
  progress: Arc<Mutex<LoadProgress>>,
  fill_running: Arc<AtomicBool>,
}

impl FillJob {
  async fn run(self, initial: Vec<BillRecord>, total_count: u64) {
    let result = self.fill(initial, total_count).await;
    self.fill_running.store(false, Ordering::SeqCst);

    match result {
      Ok(total) => {
        update_progress(&self.progress, |p| {
          p.phase = LoadPhase::Done;
          p.loaded = p.total;
        });
        self.bus.emit(CacheEvent::BillsRefreshed { total });
      }
      // Non-fatal: the partial set already rendered stays valid, and the
      // unwritten metadata makes a future cycle retry the full load.
      Err(e) => warn!("background fill stopped: {e:#}"),
    }
  }

  async fn fill(&self, initial: Vec<BillRecord>, total_count: u64) -> Result<u64> {
    // First pause lets the caller render the initial page before fill I/O.
    tokio::time::sleep(self.fill_pause).await;

    let fetched = initial.len() as u64;
    let mut merged: HashMap<String, BillRecord> = initial
      .into_iter()
      .map(|b| (b.bill_id.clone(), b))
      .collect();

    let offsets: Vec<u64> = (fetched..total_count)
      .step_by(self.fill_page_size as usize)
      .collect();

    for group in offsets.chunks(self.fill_fan_out) {
      let pages = try_join_all(group.iter().map(|&offset| {
        self
          .source
          .fetch_bills(BillOrder::Proposed, offset, self.fill_page_size)
      }))
      .await?;

      for page in pages {
        for bill in page {
          merged.insert(bill.bill_id.clone(), bill);
        }
      }

      let loaded = (merged.len() as u64).min(total_count);
      update_progress(&self.progress, |p| {
        p.loaded = p.loaded.max(loaded);
      });

      // Micro-delay between page groups yields to the rest of the loop.
      tokio::time::sleep(self.fill_pause).await;
    }

    let mut full: Vec<BillRecord> = merged.into_values().collect();
    sort_bills(&mut full);

    self.store.replace_all(&full, total_count).await?;
    debug!(rows = full.len(), total_count, "background fill complete");

    Ok(total_count)
  }
}

fn update_progress(progress: &Mutex<LoadProgress>, f: impl FnOnce(&mut LoadProgress)) {
  if let Ok(mut progress) = progress.lock() {
    f(&mut progress);
  }
}
