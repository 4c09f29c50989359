//! A contiguous run of a room's history.
//!
//! Events are addressed by an index relative to the segment's `base_index`.
//! Prepending moves `base_index` so that existing events keep their relative
//! index; appending leaves it alone. Valid cursor positions run from
//! [`TimelineSegment::min_index`] to [`TimelineSegment::max_index`]
//! inclusive, where `max_index` is the slot after the newest event.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Which way through history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Toward older events.
    Backward,
    /// Toward newer events.
    Forward,
}

impl Direction {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Backward => Self::Forward,
            Self::Forward => Self::Backward,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "backward",
            Self::Forward => "forward",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable handle to a segment inside a [`super::RoomTimeline`].
///
/// Handles are never reused within one arena, so a stale handle simply fails
/// to resolve after its segment is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub(crate) u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg#{}", self.0)
    }
}

/// One end of a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Edge {
    /// Where the server can continue from. `None` means exhausted.
    pub token: Option<String>,
    /// Adjacent segment, if history on that side is already held locally.
    pub neighbour: Option<SegmentId>,
}

#[derive(Debug, Clone)]
pub struct TimelineSegment {
    id: SegmentId,
    events: VecDeque<Event>,
    base_index: i64,
    backward: Edge,
    forward: Edge,
    live: bool,
}

#[allow(clippy::cast_possible_wrap)]
const fn to_i64(n: usize) -> i64 {
    n as i64
}

impl TimelineSegment {
    pub(crate) const fn new(id: SegmentId) -> Self {
        Self {
            id,
            events: VecDeque::new(),
            base_index: 0,
            backward: Edge {
                token: None,
                neighbour: None,
            },
            forward: Edge {
                token: None,
                neighbour: None,
            },
            live: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SegmentId {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events oldest first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &Event> {
        self.events.iter()
    }

    #[must_use]
    pub const fn base_index(&self) -> i64 {
        self.base_index
    }

    #[must_use]
    pub const fn min_index(&self) -> i64 {
        -self.base_index
    }

    #[must_use]
    pub fn max_index(&self) -> i64 {
        to_i64(self.events.len()) - self.base_index
    }

    /// Insert at the old (`at_start`) or new end.
    pub fn add_event(&mut self, event: Event, at_start: bool) {
        if at_start {
            self.events.push_front(event);
            self.base_index += 1;
        } else {
            self.events.push_back(event);
        }
    }

    /// Event at a relative index.
    #[must_use]
    pub fn event_at(&self, index: i64) -> Option<&Event> {
        let absolute = usize::try_from(index + self.base_index).ok()?;
        self.events.get(absolute)
    }

    /// Relative index of an event held by this segment.
    #[must_use]
    pub fn position_of(&self, event_id: &str) -> Option<i64> {
        self.events
            .iter()
            .position(|e| e.event_id == event_id)
            .map(|absolute| to_i64(absolute) - self.base_index)
    }

    #[must_use]
    pub fn contains(&self, event_id: &str) -> bool {
        self.events.iter().any(|e| e.event_id == event_id)
    }

    pub(crate) fn event_mut(&mut self, event_id: &str) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| e.event_id == event_id)
    }

    /// Events between two relative indices, `to` exclusive.
    pub fn slice(&self, from: i64, to: i64) -> impl Iterator<Item = &Event> {
        let lo = usize::try_from((from + self.base_index).max(0)).unwrap_or_default();
        let hi = usize::try_from((to + self.base_index).max(0))
            .unwrap_or_default()
            .min(self.events.len());
        self.events.range(lo.min(hi)..hi)
    }

    /// Drop up to `count` events from one end. Remaining events keep their
    /// relative indices.
    pub fn prune(&mut self, count: usize, from_start: bool) -> Vec<Event> {
        let count = count.min(self.events.len());
        if from_start {
            self.base_index -= to_i64(count);
            self.events.drain(..count).collect()
        } else {
            let keep = self.events.len() - count;
            self.events.drain(keep..).collect()
        }
    }

    #[must_use]
    pub const fn edge(&self, direction: Direction) -> &Edge {
        match direction {
            Direction::Backward => &self.backward,
            Direction::Forward => &self.forward,
        }
    }

    pub(crate) const fn edge_mut(&mut self, direction: Direction) -> &mut Edge {
        match direction {
            Direction::Backward => &mut self.backward,
            Direction::Forward => &mut self.forward,
        }
    }

    #[must_use]
    pub fn token(&self, direction: Direction) -> Option<&str> {
        self.edge(direction).token.as_deref()
    }

    pub fn set_token(&mut self, direction: Direction, token: Option<String>) {
        self.edge_mut(direction).token = token;
    }

    #[must_use]
    pub const fn neighbour(&self, direction: Direction) -> Option<SegmentId> {
        self.edge(direction).neighbour
    }

    /// The one segment per room that still receives sync deltas.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) const fn set_live(&mut self, live: bool) {
        self.live = live;
    }
}
