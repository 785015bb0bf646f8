//! Bill domain types and the remote-source contract.

pub mod source;
pub mod types;

pub use source::{BillOrder, BillSource};
pub use types::{
  bill_no_numeric, compare_by_processed, compare_by_proposed, sort_bills, sort_bills_by_processed,
  BillRecord, CacheMetadata, ChangeEvent, ChangeKind, FavoriteAction, FavoriteEntry,
};
