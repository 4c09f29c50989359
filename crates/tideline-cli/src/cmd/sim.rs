//! `tide sim`: deterministic simulation campaigns.
//!
//! `tide sim run` executes a seed range against the invariant oracle.
//! `tide sim replay` reruns one seed with its full trace.

use std::process;

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tideline_sim::{CampaignConfig, ServerFaults};
use tideline_sim::simulator::{TraceEvent, TraceEventKind};

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across many seeds",
        long_about = "Feed a simulated homeserver's deltas through the accumulator and a\n\
                      paginating window for each seed, then check the invariant oracle.\n\
                      Reports pass/fail per seed and the first failure for replay.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    tide sim run --seeds 100\n\n\
                      # Gappy server, tight retention\n    tide sim run --seeds 200 --gap-percent 40 --max-timeline 5\n\n\
                      # Machine-readable output\n    tide sim run --seeds 100 --format json"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay a single seed with its trace",
        long_about = "Replay one seed to see every delta, pagination and decryption it\n\
                      produced, with oracle violations. Use after a campaign failure.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    tide sim replay --seed 42\n\n\
                      # Replay with the parameters of a failing campaign\n    tide sim replay --seed 42 --gap-percent 40 --max-timeline 5"
    )]
    Replay(SimReplayArgs),
}

/// Knobs shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct SimParams {
    /// Sync rounds per seed.
    #[arg(long, default_value = "24")]
    pub rounds: u64,

    /// Backward paginations after the window loads.
    #[arg(long, default_value = "6")]
    pub paginations: usize,

    /// Events requested per pagination.
    #[arg(long, default_value = "5")]
    pub page_size: usize,

    /// Timeline events the accumulator retains per room.
    #[arg(long, default_value = "12")]
    pub max_timeline: usize,

    /// Window size limit.
    #[arg(long, default_value = "16")]
    pub window_limit: usize,

    /// Chance (percent) that a delta is limited and skips events.
    #[arg(long, default_value = "10")]
    pub gap_percent: u8,

    /// Chance (percent) that a history fetch stalls with an empty page.
    #[arg(long, default_value = "10")]
    pub stall_percent: u8,

    /// Chance (percent) that a history fetch fails outright.
    #[arg(long, default_value = "5")]
    pub fetch_fail_percent: u8,

    /// Chance (percent) that an encrypted event can never be decrypted.
    #[arg(long, default_value = "25")]
    pub undecryptable_percent: u8,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    pub seeds: u64,

    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub params: SimParams,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    #[arg(long)]
    pub seed: u64,

    #[command(flatten)]
    pub params: SimParams,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    oracle_passed: bool,
    violations: Vec<String>,
    history_events: usize,
    window_events: usize,
    fetches: usize,
    stalls: usize,
    fetch_failures: usize,
    interesting_state_reached: bool,
    trace: Vec<TraceEvent>,
}

fn campaign_config(seed_start: u64, seeds: u64, params: &SimParams) -> CampaignConfig {
    let defaults = CampaignConfig::default();
    CampaignConfig {
        seed_range: seed_start..seed_start.saturating_add(seeds),
        rounds: params.rounds,
        paginations: params.paginations,
        page_size: params.page_size,
        max_timeline_entries: params.max_timeline,
        window_limit: params.window_limit,
        initial_size: defaults.initial_size.min(params.window_limit),
        faults: ServerFaults {
            gap_percent: params.gap_percent.min(100),
            stall_percent: params.stall_percent.min(100),
            fetch_fail_percent: params.fetch_fail_percent.min(100),
            undecryptable_percent: params.undecryptable_percent.min(100),
            ..defaults.faults
        },
        ..defaults
    }
}

fn replay_hint(seed: u64, params: &SimParams) -> String {
    format!(
        "tide sim replay --seed {seed} --rounds {} --max-timeline {} --gap-percent {}",
        params.rounds, params.max_timeline, params.gap_percent
    )
}

/// Execute `tide sim run`. Exits with status 1 if any seed fails.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = campaign_config(args.seed_start, args.seeds, &args.params);
    let report = tideline_sim::run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };

    let params = &args.params;
    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "campaign seeds_run={} rounds={} gap_percent={}",
                out.seeds_run, params.rounds, params.gap_percent
            )?;
            writeln!(
                w,
                "results passed={} failed={} interesting_states={} all_passed={}",
                out.seeds_passed, out.seeds_failed, out.interesting_states_reached, out.all_passed
            )?;
            for failure in out.failures.iter().take(5) {
                writeln!(
                    w,
                    "failure seed={} violations={}",
                    failure.seed,
                    failure.violations.len()
                )?;
            }
            if let Some(seed) = out.first_failure {
                writeln!(w, "hint {}", replay_hint(seed, params))?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, "Simulation Campaign")?;
            pretty_kv(w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(w, "Rounds", params.rounds.to_string())?;
            pretty_kv(w, "Gap rate", format!("{}%", params.gap_percent))?;
            pretty_kv(
                w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed, out.seeds_failed, out.interesting_states_reached
                ),
            )?;
            let Some(first) = out.first_failure else {
                return pretty_kv(w, "Status", "all seeds passed");
            };
            pretty_kv(
                w,
                "Status",
                format!("{} failures (first at seed {first})", out.seeds_failed),
            )?;
            writeln!(w)?;
            pretty_section(w, "Failure Samples")?;
            for failure in out.failures.iter().take(5) {
                writeln!(w, "seed {:<8} violations={}", failure.seed, failure.violations.len())?;
                for violation in &failure.violations {
                    writeln!(w, "  - {violation}")?;
                }
            }
            if out.failures.len() > 5 {
                writeln!(w, "... and {} more failures", out.failures.len() - 5)?;
            }
            writeln!(w)?;
            pretty_kv(w, "Replay", replay_hint(first, params))
        },
    )?;

    if !report.all_passed() {
        process::exit(1);
    }
    Ok(())
}

fn describe(kind: &TraceEventKind) -> String {
    match kind {
        TraceEventKind::Delta {
            next_batch,
            appended,
            delivered,
            limited,
        } => format!(
            "delta next_batch={next_batch} appended={appended} delivered={delivered} limited={limited}"
        ),
        TraceEventKind::RoomRejected { room_id } => format!("rejected room={room_id}"),
        TraceEventKind::WindowLoaded { events } => format!("window_loaded events={events}"),
        TraceEventKind::Paginated { grew, events } => {
            format!("paginated grew={grew} events={events}")
        }
        TraceEventKind::Decrypted { event_id, failed } => {
            format!("decrypted event={event_id} failed={failed}")
        }
        TraceEventKind::RoomUpdatesApplied { updates, events } => {
            format!("room_updates_applied updates={updates} events={events}")
        }
    }
}

/// Execute `tide sim replay`. Exits with status 1 if the oracle fails.
pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = campaign_config(args.seed, 1, &args.params);
    let trace = tideline_sim::replay_seed(args.seed, &config)?;

    let out = ReplayOutput {
        seed: args.seed,
        oracle_passed: trace.oracle.passed,
        violations: trace
            .oracle
            .violations
            .iter()
            .map(ToString::to_string)
            .collect(),
        history_events: trace.result.history.len(),
        window_events: trace.result.window_events.len(),
        fetches: trace.result.fetches.fetches,
        stalls: trace.result.fetches.stalls,
        fetch_failures: trace.result.fetches.failures,
        interesting_state_reached: trace.result.interesting_state_reached,
        trace: trace.result.trace,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "replay seed={} oracle_passed={} history={} window={} fetches={} stalls={} fetch_failures={} interesting={}",
                out.seed,
                out.oracle_passed,
                out.history_events,
                out.window_events,
                out.fetches,
                out.stalls,
                out.fetch_failures,
                out.interesting_state_reached
            )?;
            for event in &out.trace {
                writeln!(w, "round={} {}", event.round, describe(&event.kind))?;
            }
            for violation in &out.violations {
                writeln!(w, "violation={violation}")?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(w, "History", out.history_events.to_string())?;
            pretty_kv(w, "Window", out.window_events.to_string())?;
            pretty_kv(
                w,
                "Fetches",
                format!(
                    "{} ({} stalled, {} failed)",
                    out.fetches, out.stalls, out.fetch_failures
                ),
            )?;
            pretty_kv(w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(w, "Oracle", out.oracle_passed.to_string())?;
            if !out.oracle_passed {
                writeln!(w)?;
                pretty_section(w, "Invariant Violations")?;
                for violation in &out.violations {
                    writeln!(w, "- {violation}")?;
                }
            }
            writeln!(w)?;
            pretty_section(w, "Trace")?;
            for event in &out.trace {
                writeln!(w, "{:>4}  {}", event.round, describe(&event.kind))?;
            }
            Ok(())
        },
    )?;

    if !out.oracle_passed {
        process::exit(1);
    }
    Ok(())
}

/// Dispatch `tide sim` subcommands.
pub fn run_sim(args: &SimArgs, output: OutputMode) -> Result<()> {
    match &args.command {
        SimCommand::Run(run_args) => run_sim_run(run_args, output),
        SimCommand::Replay(replay_args) => run_sim_replay(replay_args, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SimParams {
        SimParams {
            rounds: 10,
            paginations: 2,
            page_size: 3,
            max_timeline: 4,
            window_limit: 6,
            gap_percent: 150,
            stall_percent: 0,
            fetch_fail_percent: 0,
            undecryptable_percent: 10,
        }
    }

    #[test]
    fn campaign_config_clamps_percentages() {
        let config = campaign_config(5, 3, &params());
        assert_eq!(config.seed_range, 5..8);
        assert_eq!(config.faults.gap_percent, 100);
        assert_eq!(config.max_timeline_entries, 4);
        assert!(config.initial_size <= config.window_limit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn replay_hint_carries_parameters() {
        let hint = replay_hint(9, &params());
        assert!(hint.contains("--seed 9"));
        assert!(hint.contains("--max-timeline 4"));
    }

    #[test]
    fn describe_renders_gaps() {
        let text = describe(&TraceEventKind::Delta {
            next_batch: "t9".into(),
            appended: 4,
            delivered: 2,
            limited: true,
        });
        assert!(text.contains("limited=true"));
    }
}
