//! tideline-core library.
//!
//! Folds incremental sync deltas into per-room state ([`sync`]), keeps
//! segmented room history with windows over it ([`timeline`]), and
//! aggregates relations with decryption deferral ([`relations`], [`crypto`]).
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums per module; `anyhow::Result` only at
//!   the edges (config loading). [`error::ErrorCode`] gives each failure a
//!   stable machine-readable code.
//! - **Logging**: `tracing` macros (`warn!`, `debug!`, `trace!`). The core
//!   never installs a subscriber.

pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod relations;
pub mod sync;
pub mod timeline;

pub use config::{AccumulatorConfig, TidelineConfig, WindowConfig};
pub use event::Event;
pub use sync::{SyncAccumulator, SyncDelta, SyncState};
