//! `tide inspect`: summarize a checkpoint, or one room in it.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use tideline_core::config::AccumulatorConfig;
use tideline_core::error::ErrorCode;
use tideline_core::sync::{RoomAccumulator, SyncAccumulator};

use crate::cmd::restore_checkpoint;
use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_error, render_mode};

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Checkpoint written by `tide replay --checkpoint`.
    pub checkpoint: PathBuf,

    /// Show one room in detail.
    #[arg(long, value_name = "ID")]
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoomLine {
    room_id: String,
    membership: &'static str,
    timeline_events: usize,
    state_events: usize,
    receipts: usize,
    prev_batch: Option<String>,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    next_batch: Option<String>,
    account_data: usize,
    rooms: Vec<RoomLine>,
}

#[derive(Debug, Serialize)]
struct TimelineLine {
    event_id: String,
    event_type: String,
    sender: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoomDetail {
    room_id: String,
    membership: &'static str,
    prev_batch: Option<String>,
    timeline: Vec<TimelineLine>,
    state: Vec<(String, String)>,
    receipts: usize,
    joined_member_count: Option<u64>,
    heroes: Vec<String>,
}

fn room_line(room_id: &str, membership: &'static str, room: &RoomAccumulator) -> RoomLine {
    RoomLine {
        room_id: room_id.to_string(),
        membership,
        timeline_events: room.timeline_len(),
        state_events: room.current_state().len(),
        receipts: room.receipts().len(),
        prev_batch: room.prev_batch().map(str::to_string),
    }
}

fn room_detail(room_id: &str, membership: &'static str, room: &RoomAccumulator) -> RoomDetail {
    RoomDetail {
        room_id: room_id.to_string(),
        membership,
        prev_batch: room.prev_batch().map(str::to_string),
        timeline: room
            .timeline()
            .iter()
            .map(|entry| TimelineLine {
                event_id: entry.event.event_id.clone().unwrap_or_default(),
                event_type: entry.event.event_type.clone(),
                sender: entry.event.sender.clone(),
                token: entry.token.clone(),
            })
            .collect(),
        state: room.current_state().into_keys().collect(),
        receipts: room.receipts().len(),
        joined_member_count: room.summary().joined_member_count,
        heroes: room.summary().heroes.clone().unwrap_or_default(),
    }
}

fn find_room<'a>(
    acc: &'a SyncAccumulator,
    room_id: &str,
) -> Option<(&'static str, &'a RoomAccumulator)> {
    acc.room(room_id)
        .map(|room| ("join", room))
        .or_else(|| acc.left_room(room_id).map(|room| ("leave", room)))
}

/// Execute `tide inspect`.
pub fn run_inspect(
    args: &InspectArgs,
    config: AccumulatorConfig,
    output: OutputMode,
) -> Result<()> {
    let acc = restore_checkpoint(&args.checkpoint, config, output)?;

    if let Some(room_id) = &args.room {
        let Some((membership, room)) = find_room(&acc, room_id) else {
            render_error(
                output,
                &CliError::new(format!("room '{room_id}' is not joined or left in this checkpoint"))
                    .with_code(ErrorCode::RoomNotFound),
            )?;
            bail!("room '{room_id}' not found");
        };
        let detail = room_detail(room_id, membership, room);
        return render_mode(output, &detail, render_detail_text, render_detail_pretty);
    }

    let state = acc.state();
    let mut rooms: Vec<RoomLine> = acc
        .joined_room_ids()
        .filter_map(|id| acc.room(id).map(|room| room_line(id, "join", room)))
        .collect();
    rooms.extend(state.rooms.leave.keys().filter_map(|id| {
        acc.left_room(id).map(|room| room_line(id, "leave", room))
    }));
    rooms.extend(state.rooms.invite.iter().map(|(id, invite)| RoomLine {
        room_id: id.clone(),
        membership: "invite",
        timeline_events: 0,
        state_events: invite.invite_state.events.len(),
        receipts: 0,
        prev_batch: None,
    }));

    let out = InspectOutput {
        next_batch: state.next_batch,
        account_data: state.account_data.len(),
        rooms,
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "checkpoint next_batch={} account_data={} rooms={}",
                out.next_batch.as_deref().unwrap_or("-"),
                out.account_data,
                out.rooms.len()
            )?;
            for r in &out.rooms {
                writeln!(
                    w,
                    "room id={} membership={} timeline={} state={} receipts={} prev_batch={}",
                    r.room_id,
                    r.membership,
                    r.timeline_events,
                    r.state_events,
                    r.receipts,
                    r.prev_batch.as_deref().unwrap_or("-")
                )?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, "Checkpoint")?;
            pretty_kv(w, "Next batch", out.next_batch.as_deref().unwrap_or("(none)"))?;
            pretty_kv(w, "Account data", out.account_data.to_string())?;
            pretty_kv(w, "Rooms", out.rooms.len().to_string())?;
            if !out.rooms.is_empty() {
                writeln!(w)?;
                pretty_section(w, "Rooms")?;
                for r in &out.rooms {
                    writeln!(
                        w,
                        "{:<32} {:<7} timeline={:<4} state={:<4} receipts={}",
                        r.room_id, r.membership, r.timeline_events, r.state_events, r.receipts
                    )?;
                }
            }
            Ok(())
        },
    )
}

fn render_detail_text(detail: &RoomDetail, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "room id={} membership={} timeline={} state={} receipts={} prev_batch={}",
        detail.room_id,
        detail.membership,
        detail.timeline.len(),
        detail.state.len(),
        detail.receipts,
        detail.prev_batch.as_deref().unwrap_or("-")
    )?;
    for e in &detail.timeline {
        writeln!(
            w,
            "event id={} type={} sender={} token={}",
            e.event_id,
            e.event_type,
            e.sender.as_deref().unwrap_or("-"),
            e.token.as_deref().unwrap_or("-")
        )?;
    }
    for (event_type, state_key) in &detail.state {
        writeln!(w, "state type={event_type} key={state_key:?}")?;
    }
    Ok(())
}

fn render_detail_pretty(detail: &RoomDetail, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Room {}", detail.room_id))?;
    pretty_kv(w, "Membership", detail.membership)?;
    pretty_kv(w, "Prev batch", detail.prev_batch.as_deref().unwrap_or("(none)"))?;
    pretty_kv(w, "Receipts", detail.receipts.to_string())?;
    if let Some(count) = detail.joined_member_count {
        pretty_kv(w, "Members", count.to_string())?;
    }
    if !detail.heroes.is_empty() {
        pretty_kv(w, "Heroes", detail.heroes.join(", "))?;
    }

    writeln!(w)?;
    pretty_section(w, &format!("Timeline ({})", detail.timeline.len()))?;
    for e in &detail.timeline {
        let marker = if e.token.is_some() { "*" } else { " " };
        writeln!(
            w,
            "{marker} {:<24} {:<20} {}",
            e.event_id,
            e.event_type,
            e.sender.as_deref().unwrap_or("")
        )?;
    }

    writeln!(w)?;
    pretty_section(w, &format!("State ({})", detail.state.len()))?;
    for (event_type, state_key) in &detail.state {
        writeln!(w, "{event_type} [{state_key}]")?;
    }
    Ok(())
}
