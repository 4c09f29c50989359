//! tideline-sim library.
//!
//! Deterministic simulation of a homeserver feeding tideline: gapped sync
//! deltas, stalling and failing pagination, undecryptable events. A
//! [`SyncOracle`] checks the resulting state; campaigns run seed ranges and
//! failing seeds replay exactly.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for return types.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod campaign;
pub mod crypto;
pub mod homeserver;
pub mod oracle;
pub mod rng;
pub mod simulator;

pub use campaign::{CampaignConfig, CampaignReport, DetailedTrace, replay_seed, run_campaign};
pub use homeserver::{ServerFaults, SimulatedHomeserver};
pub use oracle::{InvariantViolation, OracleResult, SyncOracle};
pub use rng::SimRng;
pub use simulator::{SimulationConfig, SimulationResult, Simulator};
