//! Shared test doubles: record builders and a scripted remote source with
//! call counters, so cache-hit short-circuits can be asserted directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use tokio::sync::broadcast;

use crate::bill::source::{BillOrder, BillSource};
use crate::bill::types::{
  sort_bills, sort_bills_by_processed, BillRecord, ChangeEvent, FavoriteAction, FavoriteEntry,
};

pub(crate) fn make_bill(id: &str, no: &str, propose_dt: Option<&str>) -> BillRecord {
  BillRecord {
    bill_id: id.to_string(),
    bill_no: Some(no.to_string()),
    bill_name: format!("Bill {}", id),
    proposer_kind: Some("member".to_string()),
    propose_dt: propose_dt.map(|d| d.parse().unwrap()),
    proc_dt: None,
    general_result: None,
    proc_stage_cd: None,
    pass_gubn: None,
    summary: None,
    created_at: None,
    updated_at: Some(Utc::now()),
  }
}

/// `count` bills with distinct ids, bill numbers and proposal dates.
pub(crate) fn make_bills(count: usize) -> Vec<BillRecord> {
  let base = NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
  (0..count)
    .map(|i| {
      let date = base.checked_add_days(Days::new(i as u64)).unwrap();
      make_bill(
        &format!("b{:04}", i),
        &(2_100_000 + i).to_string(),
        Some(&date.to_string()),
      )
    })
    .collect()
}

/// In-memory [`BillSource`] with deterministic pagination, injectable
/// failures and per-method call counters.
pub(crate) struct FakeSource {
  bills: Mutex<Vec<BillRecord>>,
  favorites: Mutex<HashMap<String, Vec<FavoriteEntry>>>,
  latest: Mutex<Option<DateTime<Utc>>>,
  latency: Mutex<Duration>,
  changes: broadcast::Sender<ChangeEvent>,
  count_calls: AtomicU32,
  fetch_calls: AtomicU32,
  latest_calls: AtomicU32,
  favorites_calls: AtomicU32,
  mutate_calls: AtomicU32,
  fail_fetches_after: AtomicU32,
}

impl FakeSource {
  pub fn new(bills: Vec<BillRecord>) -> Self {
    let (changes, _) = broadcast::channel(64);
    Self {
      bills: Mutex::new(bills),
      favorites: Mutex::new(HashMap::new()),
      latest: Mutex::new(None),
      latency: Mutex::new(Duration::ZERO),
      changes,
      count_calls: AtomicU32::new(0),
      fetch_calls: AtomicU32::new(0),
      latest_calls: AtomicU32::new(0),
      favorites_calls: AtomicU32::new(0),
      mutate_calls: AtomicU32::new(0),
      fail_fetches_after: AtomicU32::new(u32::MAX),
    }
  }

  /// Emit a change event to all subscribers.
  pub fn push_change(&self, event: ChangeEvent) {
    let _ = self.changes.send(event);
  }

  pub fn set_latest(&self, latest: Option<DateTime<Utc>>) {
    *self.latest.lock().unwrap() = latest;
  }

  /// Delay every remote call, for overlap/reentrancy tests.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  pub fn set_favorites(&self, user_id: &str, entries: Vec<FavoriteEntry>) {
    self
      .favorites
      .lock()
      .unwrap()
      .insert(user_id.to_string(), entries);
  }

  /// Fail every `fetch_bills` call after the first `n` calls.
  pub fn fail_fetches_after(&self, n: u32) {
    self.fail_fetches_after.store(n, Ordering::SeqCst);
  }

  pub fn count_calls(&self) -> u32 {
    self.count_calls.load(Ordering::SeqCst)
  }

  pub fn fetch_calls(&self) -> u32 {
    self.fetch_calls.load(Ordering::SeqCst)
  }

  pub fn latest_calls(&self) -> u32 {
    self.latest_calls.load(Ordering::SeqCst)
  }

  pub fn favorites_calls(&self) -> u32 {
    self.favorites_calls.load(Ordering::SeqCst)
  }

  pub fn mutate_calls(&self) -> u32 {
    self.mutate_calls.load(Ordering::SeqCst)
  }

  async fn pause(&self) {
    let latency = *self.latency.lock().unwrap();
    if latency > Duration::ZERO {
      tokio::time::sleep(latency).await;
    }
  }
}

#[async_trait]
impl BillSource for FakeSource {
  async fn count_bills(&self) -> Result<u64> {
    self.count_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    Ok(self.bills.lock().unwrap().len() as u64)
  }

  async fn fetch_bills(
    &self,
    order: BillOrder,
    offset: u64,
    limit: u64,
  ) -> Result<Vec<BillRecord>> {
    let calls = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if calls > self.fail_fetches_after.load(Ordering::SeqCst) {
      return Err(eyre!("injected fetch failure"));
    }
    self.pause().await;

    let mut bills = self.bills.lock().unwrap().clone();
    match order {
      BillOrder::Proposed => sort_bills(&mut bills),
      BillOrder::Processed => sort_bills_by_processed(&mut bills),
    }

    Ok(
      bills
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect(),
    )
  }

  async fn latest_update(&self) -> Result<Option<DateTime<Utc>>> {
    self.latest_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    Ok(*self.latest.lock().unwrap())
  }

  async fn fetch_favorites(&self, user_id: &str) -> Result<Vec<FavoriteEntry>> {
    self.favorites_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;
    Ok(
      self
        .favorites
        .lock()
        .unwrap()
        .get(user_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn fetch_favorite_ids(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    self.pause().await;
    Ok(
      self
        .favorites
        .lock()
        .unwrap()
        .get(user_id)
        .map(|entries| {
          entries
            .iter()
            .map(|e| (e.bill_id.clone(), e.created_at))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn mutate_favorite(
    &self,
    user_id: &str,
    bill_id: &str,
    action: FavoriteAction,
  ) -> Result<()> {
    self.mutate_calls.fetch_add(1, Ordering::SeqCst);
    self.pause().await;

    let mut favorites = self.favorites.lock().unwrap();
    let entries = favorites.entry(user_id.to_string()).or_default();
    match action {
      FavoriteAction::Add => {
        if !entries.iter().any(|e| e.bill_id == bill_id) {
          entries.push(FavoriteEntry {
            user_id: user_id.to_string(),
            bill_id: bill_id.to_string(),
            created_at: Utc::now(),
            bill: None,
          });
        }
      }
      FavoriteAction::Remove => entries.retain(|e| e.bill_id != bill_id),
    }

    Ok(())
  }

  fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
    self.changes.subscribe()
  }
}
