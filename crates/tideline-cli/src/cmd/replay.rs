//! `tide replay`: fold a JSON-lines file of sync deltas into a checkpoint.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tideline_core::config::AccumulatorConfig;
use tideline_core::error::ErrorCode;
use tideline_core::sync::{SyncAccumulator, SyncDelta};
use tracing::{debug, warn};

use crate::cmd::{restore_checkpoint, write_checkpoint};
use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_error, render_mode};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSON-lines file, one sync delta per line.
    pub deltas: PathBuf,

    /// Write the resulting state here.
    #[arg(long, value_name = "PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Start from an existing checkpoint instead of an empty state.
    #[arg(long, value_name = "CHECKPOINT")]
    pub from: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RejectedRoom {
    line: usize,
    room_id: String,
    membership: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    deltas: usize,
    rooms_applied: usize,
    rejected: Vec<RejectedRoom>,
    next_batch: Option<String>,
    joined_rooms: usize,
    invited_rooms: usize,
    left_rooms: usize,
    checkpoint: Option<String>,
}

/// Execute `tide replay`.
pub fn run_replay(args: &ReplayArgs, config: AccumulatorConfig, output: OutputMode) -> Result<()> {
    let mut acc = match &args.from {
        Some(path) => restore_checkpoint(path, config, output)?,
        None => SyncAccumulator::new(config),
    };

    let file = File::open(&args.deltas)
        .with_context(|| format!("Failed to open {}", args.deltas.display()))?;

    let mut out = ReplayOutput {
        deltas: 0,
        rooms_applied: 0,
        rejected: Vec::new(),
        next_batch: None,
        joined_rooms: 0,
        invited_rooms: 0,
        left_rooms: 0,
        checkpoint: args.checkpoint.as_ref().map(|p| p.display().to_string()),
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("Failed to read line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }

        let delta: SyncDelta = match serde_json::from_str(&line) {
            Ok(delta) => delta,
            Err(err) => {
                render_error(
                    output,
                    &CliError::new(format!("line {line_no}: {err}"))
                        .with_code(ErrorCode::MalformedDelta),
                )?;
                return Err(err).with_context(|| format!("line {line_no} is not a sync delta"));
            }
        };

        let report = match acc.accumulate(&delta) {
            Ok(report) => report,
            Err(err) => {
                render_error(
                    output,
                    &CliError::new(format!("line {line_no}: {err}"))
                        .with_code(ErrorCode::from(&err)),
                )?;
                return Err(err).with_context(|| format!("line {line_no} rejected"));
            }
        };

        debug!(
            line = line_no,
            next_batch = %delta.next_batch,
            rooms = report.rooms_applied,
            "delta applied"
        );
        out.deltas += 1;
        out.rooms_applied += report.rooms_applied;
        for rejected in report.rejected {
            warn!(line = line_no, %rejected, "room skipped");
            out.rejected.push(RejectedRoom {
                line: line_no,
                room_id: rejected.room_id,
                membership: rejected.membership.to_string(),
                reason: rejected.reason.to_string(),
            });
        }
    }

    let state = acc.state();
    out.next_batch.clone_from(&state.next_batch);
    out.joined_rooms = state.rooms.join.len();
    out.invited_rooms = state.rooms.invite.len();
    out.left_rooms = state.rooms.leave.len();

    if let Some(path) = &args.checkpoint {
        write_checkpoint(path, &state)?;
    }

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "replay deltas={} rooms_applied={} rejected={} next_batch={}",
                out.deltas,
                out.rooms_applied,
                out.rejected.len(),
                out.next_batch.as_deref().unwrap_or("-")
            )?;
            writeln!(
                w,
                "rooms join={} invite={} leave={}",
                out.joined_rooms, out.invited_rooms, out.left_rooms
            )?;
            for r in &out.rejected {
                writeln!(
                    w,
                    "rejected line={} room={} membership={} reason={:?}",
                    r.line, r.room_id, r.membership, r.reason
                )?;
            }
            if let Some(path) = &out.checkpoint {
                writeln!(w, "checkpoint={path}")?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, "Replay")?;
            pretty_kv(w, "Deltas", out.deltas.to_string())?;
            pretty_kv(w, "Rooms applied", out.rooms_applied.to_string())?;
            pretty_kv(w, "Next batch", out.next_batch.as_deref().unwrap_or("(none)"))?;
            pretty_kv(
                w,
                "Rooms",
                format!(
                    "{} joined / {} invited / {} left",
                    out.joined_rooms, out.invited_rooms, out.left_rooms
                ),
            )?;
            if let Some(path) = &out.checkpoint {
                pretty_kv(w, "Checkpoint", path)?;
            }
            if !out.rejected.is_empty() {
                writeln!(w)?;
                pretty_section(w, "Rejected Rooms")?;
                for r in &out.rejected {
                    writeln!(
                        w,
                        "line {:<5} {} ({}): {}",
                        r.line, r.room_id, r.membership, r.reason
                    )?;
                }
            }
            Ok(())
        },
    )
}
