//! `tide window`: open a timeline window over a checkpointed room.
//!
//! The checkpoint holds only the retained tail of each room, so the window
//! runs against an offline source. Anything past the checkpoint's token edge
//! is reported as unreachable rather than fetched.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Args;
use parking_lot::Mutex;
use serde::Serialize;
use tideline_core::config::{AccumulatorConfig, WindowConfig};
use tideline_core::error::ErrorCode;
use tideline_core::timeline::{
    Direction, EventContext, PaginateOptions, PaginationChunk, RoomTimeline, SourceError,
    TimelineSource, TimelineWindow,
};
use tracing::debug;

use crate::cmd::restore_checkpoint;
use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_error, render_mode};

#[derive(Args, Debug)]
pub struct WindowArgs {
    /// Checkpoint written by `tide replay --checkpoint`.
    pub checkpoint: PathBuf,

    /// Joined room to open.
    #[arg(long, value_name = "ID")]
    pub room: String,

    /// Events to load initially (defaults to `window.initial_size`).
    #[arg(long, value_name = "N")]
    pub size: Option<usize>,

    /// Center the window on this event instead of the live edge.
    #[arg(long, value_name = "EVENT_ID")]
    pub around: Option<String>,

    /// After loading, page this many events further in each direction.
    #[arg(long, value_name = "N", default_value = "0")]
    pub extend: usize,
}

/// Serves nothing: a checkpoint has no history beyond what it retained.
#[derive(Debug)]
struct OfflineSource;

#[async_trait]
impl TimelineSource for OfflineSource {
    async fn fetch_timeline(
        &self,
        _room_id: &str,
        token: &str,
        _direction: Direction,
        _limit: usize,
    ) -> Result<PaginationChunk, SourceError> {
        Err(SourceError::Unavailable(format!(
            "history past token '{token}' is not in the checkpoint"
        )))
    }

    async fn fetch_event_context(
        &self,
        _room_id: &str,
        event_id: &str,
        _limit: usize,
    ) -> Result<EventContext, SourceError> {
        Err(SourceError::NotFound {
            event_id: event_id.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct WindowEvent {
    event_id: String,
    event_type: String,
    sender: String,
    origin_server_ts: u64,
}

#[derive(Debug, Serialize)]
struct WindowOutput {
    room_id: String,
    anchor: Option<String>,
    events: Vec<WindowEvent>,
    more_before: bool,
    more_after: bool,
    window_limit: usize,
}

/// Execute `tide window`.
pub fn run_window(
    args: &WindowArgs,
    accumulator: AccumulatorConfig,
    window: WindowConfig,
    output: OutputMode,
) -> Result<()> {
    let acc = restore_checkpoint(&args.checkpoint, accumulator, output)?;
    let state = acc.state();
    let Some(joined) = state.rooms.join.get(&args.room) else {
        render_error(
            output,
            &CliError::new(format!("room '{}' is not joined in this checkpoint", args.room))
                .with_code(ErrorCode::RoomNotFound),
        )?;
        bail!("room '{}' not found", args.room);
    };

    let mut room = RoomTimeline::new(args.room.as_str());
    let added = room.handle_sync_timeline(&joined.timeline);
    debug!(room = %args.room, added, "arena seeded from checkpoint");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("failed to start runtime")?;
    let out = runtime.block_on(open_window(
        Arc::new(Mutex::new(room)),
        window,
        args,
        output,
    ))?;

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "window room={} events={} anchor={} more_before={} more_after={}",
                out.room_id,
                out.events.len(),
                out.anchor.as_deref().unwrap_or("-"),
                out.more_before,
                out.more_after
            )?;
            for e in &out.events {
                writeln!(
                    w,
                    "event id={} type={} sender={} ts={}",
                    e.event_id, e.event_type, e.sender, e.origin_server_ts
                )?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, &format!("Window {}", out.room_id))?;
            pretty_kv(w, "Anchor", out.anchor.as_deref().unwrap_or("(live edge)"))?;
            pretty_kv(
                w,
                "Events",
                format!("{} of limit {}", out.events.len(), out.window_limit),
            )?;
            pretty_kv(w, "More before", out.more_before.to_string())?;
            pretty_kv(w, "More after", out.more_after.to_string())?;
            writeln!(w)?;
            for e in &out.events {
                let marker = if out.anchor.as_deref() == Some(e.event_id.as_str()) {
                    ">"
                } else {
                    " "
                };
                writeln!(
                    w,
                    "{marker} {:<24} {:<20} {}",
                    e.event_id, e.event_type, e.sender
                )?;
            }
            Ok(())
        },
    )
}

async fn open_window(
    room: Arc<Mutex<RoomTimeline>>,
    config: WindowConfig,
    args: &WindowArgs,
    output: OutputMode,
) -> Result<WindowOutput> {
    let window = TimelineWindow::new(room, Arc::new(OfflineSource), config);
    let size = args.size.unwrap_or(config.initial_size);

    if let Err(err) = window.load(args.around.as_deref(), size).await {
        render_error(
            output,
            &CliError::new(err.to_string()).with_code(ErrorCode::from(&err)),
        )?;
        return Err(err).context("failed to load window");
    }

    if args.extend > 0 {
        let options = PaginateOptions::local_only();
        window
            .paginate(Direction::Backward, args.extend, options)
            .await;
        window
            .paginate(Direction::Forward, args.extend, options)
            .await;
    }

    Ok(WindowOutput {
        room_id: args.room.clone(),
        anchor: window.anchor(),
        events: window
            .events()
            .into_iter()
            .map(|e| WindowEvent {
                event_type: e.effective_type().to_string(),
                event_id: e.event_id,
                sender: e.sender,
                origin_server_ts: e.origin_server_ts,
            })
            .collect(),
        more_before: window.can_paginate(Direction::Backward),
        more_after: window.can_paginate(Direction::Forward),
        window_limit: config.window_limit,
    })
}
