//! Client-side caching and synchronization for the bill dataset.
//!
//! This module keeps an on-device replica of the remote bill table:
//! - [`store`] persists the replica with freshness metadata
//! - [`favorites`] is the per-user side-cache
//! - [`loader`] populates the store progressively (cache check, fast initial
//!   page, background fill)
//! - [`invalidation`] decides when cached data can no longer be trusted
//! - [`realtime`] folds remote change events into the stores
//! - [`events`] is the typed bus the pieces reconcile over

pub mod events;
pub mod favorites;
pub mod invalidation;
pub mod loader;
pub mod realtime;
pub mod store;

pub use events::{CacheEvent, EventBus, InvalidationReason};
pub use favorites::FavoritesCache;
pub use invalidation::InvalidationEngine;
pub use loader::{LoadOutcome, LoadPhase, LoadProgress, ProgressiveLoader};
pub use realtime::{RealtimeGuard, RealtimeSync};
pub use store::BillStore;
