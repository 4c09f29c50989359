//! A bounded, paginatable view over a room's segments.
//!
//! The window is a pair of cursors into the arena. `start` points at the
//! oldest visible event and `end` one past the newest, so the visible events
//! are everything walked from `start` to `end`. Growing an edge moves its
//! cursor outward, locally first and then by fetching from the
//! [`TimelineSource`]. When the window outgrows its limit, the opposite edge
//! is moved inward.
//!
//! # Concurrency
//!
//! Methods take `&self`. Each direction has an in-flight slot: a
//! `paginate` that finds its direction busy waits for the running call and
//! reports its outcome instead of fetching again. The arena lock and the
//! window's own lock are never held across an `.await`.
//!
//! [`TimelineWindow::load`] and [`TimelineWindow::discard`] start a new
//! generation. A fetch issued under an older generation is dropped when it
//! returns.
//!
//! # Following the arena
//!
//! The window subscribes to its room's [`TimelineUpdate`]s when it is built.
//! [`TimelineWindow::apply_room_updates`] drains them: a removed segment
//! under either cursor discards the window, and a window without an anchor
//! whose end sat in the old live segment moves onto the new one after a
//! live reset.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{Receiver, error::TryRecvError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::WindowConfig;
use crate::event::Event;
use crate::timeline::arena::{RoomTimeline, SegmentError, TimelineUpdate};
use crate::timeline::cursor::TimelineCursor;
use crate::timeline::segment::{Direction, SegmentId};
use crate::timeline::source::{SourceError, TimelineSource};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("event '{event_id}' not found")]
    EventNotFound { event_id: String },

    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Options for [`TimelineWindow::paginate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginateOptions {
    /// Whether to fetch from the source when local events run out.
    pub make_request: bool,
    /// Maximum fetches for one call. A fetch counts even if it adds nothing.
    pub request_limit: u32,
}

impl Default for PaginateOptions {
    fn default() -> Self {
        Self {
            make_request: true,
            request_limit: 1,
        }
    }
}

impl PaginateOptions {
    #[must_use]
    pub const fn local_only() -> Self {
        Self {
            make_request: false,
            request_limit: 0,
        }
    }

    #[must_use]
    pub const fn from_config(config: &WindowConfig) -> Self {
        Self {
            make_request: true,
            request_limit: config.request_limit,
        }
    }
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Idle,
    InFlight {
        generation: u64,
        waiters: Vec<oneshot::Sender<bool>>,
    },
}

#[derive(Debug, Default)]
struct WindowState {
    start: Option<TimelineCursor>,
    end: Option<TimelineCursor>,
    anchor: Option<String>,
    generation: u64,
    backward: Slot,
    forward: Slot,
}

impl WindowState {
    const fn slot_mut(&mut self, direction: Direction) -> &mut Slot {
        match direction {
            Direction::Backward => &mut self.backward,
            Direction::Forward => &mut self.forward,
        }
    }

    const fn cursor_mut(&mut self, direction: Direction) -> Option<&mut TimelineCursor> {
        match direction {
            Direction::Backward => self.start.as_mut(),
            Direction::Forward => self.end.as_mut(),
        }
    }

    /// Start a new generation and release anyone waiting on the old one.
    fn bump_generation(&mut self) {
        self.generation += 1;
        for direction in [Direction::Backward, Direction::Forward] {
            if let Slot::InFlight { waiters, .. } = std::mem::take(self.slot_mut(direction)) {
                for tx in waiters {
                    let _ = tx.send(false);
                }
            }
        }
    }
}

/// Releases a direction's in-flight slot when the owning call finishes or
/// is dropped.
struct InFlightGuard<'a> {
    state: &'a Mutex<WindowState>,
    direction: Direction,
    generation: u64,
    outcome: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let slot = state.slot_mut(self.direction);
        if matches!(slot, Slot::InFlight { generation, .. } if *generation == self.generation)
            && let Slot::InFlight { waiters, .. } = std::mem::take(slot)
        {
            for tx in waiters {
                let _ = tx.send(self.outcome);
            }
        }
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_usize(n: i64) -> usize {
    usize::try_from(n.max(0)).unwrap_or(usize::MAX)
}

pub struct TimelineWindow {
    room: Arc<Mutex<RoomTimeline>>,
    source: Arc<dyn TimelineSource>,
    config: WindowConfig,
    state: Mutex<WindowState>,
    updates: Mutex<Receiver<TimelineUpdate>>,
}

impl std::fmt::Debug for TimelineWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineWindow")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TimelineWindow {
    #[must_use]
    pub fn new(
        room: Arc<Mutex<RoomTimeline>>,
        source: Arc<dyn TimelineSource>,
        config: WindowConfig,
    ) -> Self {
        let updates = room.lock().subscribe();
        Self {
            room,
            source,
            config,
            state: Mutex::new(WindowState::default()),
            updates: Mutex::new(updates),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &WindowConfig {
        &self.config
    }

    #[must_use]
    pub fn room(&self) -> &Arc<Mutex<RoomTimeline>> {
        &self.room
    }

    /// Establish the window.
    ///
    /// Without an event id the window ends at the live edge and reaches back
    /// `initial_size` events, paginating backward if the arena holds fewer.
    /// With an id it is placed around that event, fetching its context if
    /// the arena does not hold it. The anchor is biased to sit just past the
    /// middle when the segment allows.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::EventNotFound`] if the event cannot be located
    /// and [`WindowError::Fetch`] if fetching its context failed.
    pub async fn load(
        &self,
        event_id: Option<&str>,
        initial_size: usize,
    ) -> Result<(), WindowError> {
        self.state.lock().bump_generation();

        let Some(event_id) = event_id else {
            self.load_live(initial_size).await;
            return Ok(());
        };

        let found = self.room.lock().find_event(event_id);
        let (segment, position) = if let Some(found) = found {
            found
        } else {
            let room_id = self.room.lock().room_id().to_string();
            debug!(%room_id, event_id, "fetching context for window anchor");
            let context = self
                .source
                .fetch_event_context(&room_id, event_id, initial_size)
                .await
                .map_err(|err| match err {
                    SourceError::NotFound { event_id } => WindowError::EventNotFound { event_id },
                    other => WindowError::Fetch(other),
                })?;
            let mut room = self.room.lock();
            room.insert_context(context);
            room.find_event(event_id)
                .ok_or_else(|| WindowError::EventNotFound {
                    event_id: event_id.to_string(),
                })?
        };

        let room = self.room.lock();
        let seg = room
            .segment(segment)
            .ok_or(SegmentError::NotFound(segment))?;
        let size = to_i64(initial_size);
        let end = seg.max_index().min(position + (size + 1) / 2);
        let start = seg.min_index().max(end - size);

        let mut state = self.state.lock();
        state.start = Some(TimelineCursor::new(segment, start));
        state.end = Some(TimelineCursor::new(segment, end));
        state.anchor = Some(event_id.to_string());
        debug!(event_id, %segment, start, end, "window loaded around event");
        Ok(())
    }

    async fn load_live(&self, initial_size: usize) {
        let shortfall = {
            let room = self.room.lock();
            let live = room.live_segment_id();
            let end_index = room.segment(live).map_or(0, |s| s.max_index());
            let end = TimelineCursor::new(live, end_index);
            let mut start = end;
            let taken = start.retreat(&room, to_i64(initial_size));

            let mut state = self.state.lock();
            state.start = Some(start);
            state.end = Some(end);
            state.anchor = None;
            initial_size.saturating_sub(to_usize(taken))
        };

        if shortfall > 0 {
            debug!(shortfall, "live segment short; paginating backward");
            self.paginate(
                Direction::Backward,
                shortfall,
                PaginateOptions::from_config(&self.config),
            )
            .await;
        }
    }

    /// Whether events exist, locally or upstream, beyond the window edge.
    #[must_use]
    pub fn can_paginate(&self, direction: Direction) -> bool {
        let room = self.room.lock();
        let state = self.state.lock();
        let cursor = match direction {
            Direction::Backward => state.start,
            Direction::Forward => state.end,
        };
        let Some(mut probe) = cursor else {
            return false;
        };
        let step = match direction {
            Direction::Backward => -1,
            Direction::Forward => 1,
        };
        if probe.advance(&room, step) != 0 {
            return true;
        }
        // The probe has crossed any empty neighbours; its segment owns the edge.
        room.segment(probe.segment)
            .is_some_and(|seg| seg.token(direction).is_some())
    }

    /// Grow the window by up to `count` events in `direction`.
    ///
    /// Returns `true` if the visible event count went up. Revealing events
    /// that evict as many from the other edge counts as no growth. Fetch
    /// failures are logged and end the call with whatever progress was made.
    pub async fn paginate(
        &self,
        direction: Direction,
        count: usize,
        options: PaginateOptions,
    ) -> bool {
        let claim = {
            let mut state = self.state.lock();
            let generation = state.generation;
            match state.slot_mut(direction) {
                Slot::InFlight { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Err(rx)
                }
                slot => {
                    *slot = Slot::InFlight {
                        generation,
                        waiters: Vec::new(),
                    };
                    Ok(generation)
                }
            }
        };
        let generation = match claim {
            Ok(generation) => generation,
            Err(rx) => {
                debug!(%direction, "paginate already in flight; waiting");
                return rx.await.unwrap_or(false);
            }
        };

        let mut guard = InFlightGuard {
            state: &self.state,
            direction,
            generation,
            outcome: false,
        };
        let grew = self.paginate_owned(direction, count, options, generation).await;
        guard.outcome = grew;
        grew
    }

    async fn paginate_owned(
        &self,
        direction: Direction,
        count: usize,
        options: PaginateOptions,
        generation: u64,
    ) -> bool {
        let before = self.event_count();
        let mut shown = self.extend(direction, count);
        let mut requests = 0;

        while shown < count && options.make_request && requests < options.request_limit {
            let Some((segment, token)) = self.edge_token(direction) else {
                break;
            };
            requests += 1;

            let room_id = self.room.lock().room_id().to_string();
            let wanted = count - shown;
            debug!(%room_id, %direction, %segment, wanted, attempt = requests, "fetching history");
            let chunk = match self
                .source
                .fetch_timeline(&room_id, &token, direction, wanted)
                .await
            {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(%room_id, %direction, error = %err, "pagination fetch failed");
                    break;
                }
            };

            if self.state.lock().generation != generation {
                debug!(%direction, "window reloaded during fetch; dropping result");
                return false;
            }
            if let Err(err) =
                self.room
                    .lock()
                    .add_paginated_events(segment, chunk.events, direction, chunk.end)
            {
                warn!(error = %err, "edge segment vanished during fetch");
                break;
            }
            shown += self.extend(direction, wanted);
        }

        self.event_count() > before
    }

    /// The segment at the window's `direction` edge and its token, if the
    /// edge can be fetched from.
    fn edge_token(&self, direction: Direction) -> Option<(SegmentId, String)> {
        let room = self.room.lock();
        let state = self.state.lock();
        let cursor = match direction {
            Direction::Backward => state.start?,
            Direction::Forward => state.end?,
        };
        let token = room.segment(cursor.segment)?.token(direction)?;
        Some((cursor.segment, token.to_string()))
    }

    /// Move the `direction` edge outward using only local events, then evict
    /// from the other edge if over the limit. Returns events revealed.
    fn extend(&self, direction: Direction, count: usize) -> usize {
        let room = self.room.lock();
        let mut state = self.state.lock();
        let Some(cursor) = state.cursor_mut(direction) else {
            return 0;
        };
        let steps = match direction {
            Direction::Backward => cursor.retreat(&room, to_i64(count)),
            Direction::Forward => cursor.advance(&room, to_i64(count)),
        };
        let shown = to_usize(steps);

        if shown > 0 {
            let visible = Self::visible(&room, &state).len();
            if visible > self.config.window_limit {
                let excess = visible - self.config.window_limit;
                let evicted = Self::unpaginate_locked(
                    &room,
                    &mut state,
                    excess,
                    direction == Direction::Forward,
                );
                debug!(excess, evicted, %direction, "evicted from opposite edge");
            }
        }
        shown
    }

    /// Shrink the window by up to `delta` events from one edge, never past
    /// the anchor. Returns how many events left the window.
    pub fn unpaginate(&self, delta: usize, from_start: bool) -> usize {
        let room = self.room.lock();
        let mut state = self.state.lock();
        Self::unpaginate_locked(&room, &mut state, delta, from_start)
    }

    fn unpaginate_locked(
        room: &RoomTimeline,
        state: &mut WindowState,
        delta: usize,
        from_start: bool,
    ) -> usize {
        let visible = Self::visible(room, state);
        let anchor_at = state
            .anchor
            .as_deref()
            .and_then(|anchor| visible.iter().position(|e| e.event_id == anchor));
        let limit = match (anchor_at, from_start) {
            (Some(at), true) => at,
            (Some(at), false) => visible.len() - at - 1,
            (None, _) => visible.len(),
        };
        let delta = delta.min(limit);
        if delta == 0 {
            return 0;
        }

        let moved = if from_start {
            state
                .start
                .as_mut()
                .map_or(0, |cursor| cursor.advance(room, to_i64(delta)))
        } else {
            state
                .end
                .as_mut()
                .map_or(0, |cursor| cursor.retreat(room, to_i64(delta)))
        };
        to_usize(moved)
    }

    fn visible(room: &RoomTimeline, state: &WindowState) -> Vec<Event> {
        let (Some(start), Some(end)) = (state.start, state.end) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut segment = start.segment;
        let mut from = start.index;
        let mut hops_left = room.segment_count();
        loop {
            let Some(seg) = room.segment(segment) else {
                break;
            };
            if segment == end.segment {
                out.extend(seg.slice(from, end.index).cloned());
                break;
            }
            out.extend(seg.slice(from, seg.max_index()).cloned());
            let Some(next) = seg.neighbour(Direction::Forward) else {
                break;
            };
            let Some(next_seg) = room.segment(next) else {
                break;
            };
            if hops_left == 0 {
                break;
            }
            hops_left -= 1;
            segment = next;
            from = next_seg.min_index();
        }
        out
    }

    /// Visible events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        let room = self.room.lock();
        let state = self.state.lock();
        Self::visible(&room, &state)
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events().len()
    }

    #[must_use]
    pub fn anchor(&self) -> Option<String> {
        self.state.lock().anchor.clone()
    }

    /// Forget the window. Any fetch still running is ignored on arrival.
    pub fn discard(&self) {
        Self::clear_locked(&mut self.state.lock());
    }

    fn clear_locked(state: &mut WindowState) {
        state.bump_generation();
        state.start = None;
        state.end = None;
        state.anchor = None;
    }

    /// Catch up with structural changes to the room since the last call.
    /// Returns how many updates were consumed.
    ///
    /// If updates were lost to lag, the cursors are checked against the
    /// arena as it stands instead.
    pub fn apply_room_updates(&self) -> usize {
        let mut pending = Vec::new();
        let mut lagged = false;
        {
            let mut rx = self.updates.lock();
            loop {
                match rx.try_recv() {
                    Ok(update) => pending.push(update),
                    Err(TryRecvError::Lagged(missed)) => {
                        debug!(missed, "window lagged behind room updates");
                        lagged = true;
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }

        let room = self.room.lock();
        let mut state = self.state.lock();
        for update in &pending {
            match *update {
                TimelineUpdate::SegmentRemoved(id) => {
                    if [state.start, state.end]
                        .iter()
                        .flatten()
                        .any(|cursor| cursor.segment == id)
                    {
                        debug!(segment = %id, "window segment removed; discarding");
                        Self::clear_locked(&mut state);
                    }
                }
                TimelineUpdate::LiveReset { previous, live } => {
                    let tracking = state.anchor.is_none()
                        && state.end.is_some_and(|end| end.segment == previous);
                    if tracking {
                        self.follow_live_locked(&room, &mut state, live);
                    }
                }
                TimelineUpdate::EventsAdded { .. }
                | TimelineUpdate::Linked { .. }
                | TimelineUpdate::EventDecrypted { .. } => {}
            }
        }
        if lagged {
            self.reconcile_locked(&room, &mut state);
        }
        pending.len()
    }

    /// Re-establish the window at `live`, revealing as many of its events
    /// as were visible before.
    fn follow_live_locked(&self, room: &RoomTimeline, state: &mut WindowState, live: SegmentId) {
        let shown = Self::visible(room, state).len().min(self.config.window_limit);
        let Some(seg) = room.segment(live) else {
            Self::clear_locked(state);
            return;
        };
        let end = TimelineCursor::new(live, seg.max_index());
        let mut start = end;
        start.retreat(room, to_i64(shown));
        state.bump_generation();
        state.start = Some(start);
        state.end = Some(end);
        debug!(%live, shown, "window moved to new live segment");
    }

    fn reconcile_locked(&self, room: &RoomTimeline, state: &mut WindowState) {
        let dangling = [state.start, state.end]
            .iter()
            .flatten()
            .any(|cursor| room.segment(cursor.segment).is_none());
        if dangling {
            Self::clear_locked(state);
            return;
        }
        // Stranded behind a gap: the end segment is no longer live and
        // nothing continues it.
        let stranded = state.anchor.is_none()
            && state.end.is_some_and(|end| {
                room.segment(end.segment).is_some_and(|seg| {
                    !seg.is_live()
                        && seg.neighbour(Direction::Forward).is_none()
                        && seg.token(Direction::Forward).is_none()
                })
            });
        if stranded {
            self.follow_live_locked(room, state, room.live_segment_id());
        }
    }
}
