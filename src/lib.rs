//! Client-side cache and synchronization layer for a legislative bill
//! tracker.
//!
//! The remote relational backend owns the bill dataset; this crate keeps a
//! persistent on-device replica of it, populated progressively (cache check,
//! fast initial page, background fill), invalidated by staleness heuristics
//! and patched live from the remote change stream. A per-user favorites
//! side-cache rides alongside with its own, shorter lifecycle.
//!
//! The entry point for embedders is [`service::BillDataService`]; the remote
//! collaborator is injected through the [`bill::BillSource`] trait.

pub mod bill;
pub mod cache;
pub mod config;
pub mod service;

#[cfg(test)]
pub(crate) mod testutil;

pub use bill::{
  BillOrder, BillRecord, BillSource, CacheMetadata, ChangeEvent, ChangeKind, FavoriteAction,
  FavoriteEntry,
};
pub use cache::{
  BillStore, CacheEvent, EventBus, FavoritesCache, InvalidationEngine, InvalidationReason,
  LoadOutcome, LoadPhase, LoadProgress, ProgressiveLoader, RealtimeGuard, RealtimeSync,
};
pub use config::Config;
pub use service::{BillData, BillDataService, CacheStats, FavoritesOrigin};
