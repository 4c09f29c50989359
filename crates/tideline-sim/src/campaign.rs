//! Campaign runner: many seeds, one report.
//!
//! Executes a seed range with shared parameters, collects pass/fail per seed
//! and remembers the first failing seed for replay.

use std::ops::Range;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tideline_core::config::{AccumulatorConfig, WindowConfig};
use tracing::{info, warn};

use crate::homeserver::ServerFaults;
use crate::oracle::{OracleResult, SyncOracle};
use crate::simulator::{SimulationConfig, SimulationResult, Simulator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Seeds to execute, e.g. `0..100`.
    pub seed_range: Range<u64>,
    /// Sync rounds per seed.
    pub rounds: u64,
    /// Backward paginations after the window loads.
    pub paginations: usize,
    pub page_size: usize,
    pub max_timeline_entries: usize,
    pub window_limit: usize,
    pub initial_size: usize,
    pub request_limit: u32,
    pub faults: ServerFaults,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            rounds: sim.rounds,
            paginations: sim.paginations,
            page_size: sim.page_size,
            max_timeline_entries: sim.accumulator.max_timeline_entries,
            window_limit: sim.window.window_limit,
            initial_size: sim.window.initial_size,
            request_limit: sim.window.request_limit,
            faults: sim.faults,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            rounds: self.rounds,
            paginations: self.paginations,
            page_size: self.page_size,
            faults: self.faults,
            accumulator: AccumulatorConfig {
                max_timeline_entries: self.max_timeline_entries,
            },
            window: WindowConfig {
                window_limit: self.window_limit,
                initial_size: self.initial_size,
                request_limit: self.request_limit,
            },
        }
    }

    /// # Errors
    ///
    /// Returns an error if the seed range is empty or the per-seed config is
    /// invalid.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First failing seed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that hit a gap, stall, failed fetch or failed decryption.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A single seed replayed with its full result.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run every seed in the config.
///
/// # Errors
///
/// Returns an error if the config is invalid or a simulation fails
/// internally. Invariant violations are reported, not returned as errors.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let trace = run_seed(seed, config)?;
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace
                    .oracle
                    .violations
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            });
        }
    }

    info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        "campaign finished"
    );
    Ok(report)
}

/// Replay one seed with the full result and oracle verdict.
///
/// # Errors
///
/// Returns an error when config validation or the simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    run_seed(seed, config)
}

fn run_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let result = Simulator::new(config.sim_config_for_seed(seed))?
        .run()
        .with_context(|| format!("seed {seed}"))?;
    let oracle = SyncOracle::check_all(&result);
    Ok(DetailedTrace { result, oracle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_initial_window_rejected() {
        let config = CampaignConfig {
            window_limit: 4,
            initial_size: 8,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_carries_seed() {
        let config = CampaignConfig::default();
        let sim = config.sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.rounds, config.rounds);
        assert_eq!(sim.window.window_limit, config.window_limit);
    }

    #[test]
    fn replay_is_deterministic() {
        let config = CampaignConfig::default();
        let a = replay_seed(7, &config).unwrap();
        let b = replay_seed(7, &config).unwrap();
        assert_eq!(a.result, b.result);
        assert_eq!(a.oracle, b.oracle);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["WindowOrder: $4 at position 3 follows Some(5)".into()],
            }],
            interesting_states_reached: 5,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }
}
