//! Incremental sync accumulation.
//!
//! - [`wire`]: serde types for deltas and snapshots.
//! - [`validate`]: per-room checks run before any mutation.
//! - [`room`]: per-room state, bounded timeline and pruning.
//! - [`receipts`]: latest-receipt bookkeeping.
//! - [`accumulator`]: folds whole deltas and produces snapshots.

pub mod accumulator;
pub mod receipts;
pub mod room;
pub mod validate;
pub mod wire;

pub use accumulator::{AccumulateError, AccumulateReport, SyncAccumulator, SyncState};
pub use receipts::{ReceiptAccumulator, ThreadKey};
pub use room::{RoomAccumulator, StateKey, TimelineEntry};
pub use validate::{MalformedReason, Membership, RoomMergeError};
pub use wire::{RawEvent, SyncDelta};
