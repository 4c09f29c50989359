//! Positions that walk across linked segments.

use tracing::trace;

use crate::timeline::arena::RoomTimeline;
use crate::timeline::segment::{Direction, SegmentId};

/// A (segment, relative index) position.
///
/// The index may equal the segment's `max_index`, meaning "after the newest
/// event". That slot and the forward neighbour's `min_index` are the same
/// logical position, so moving between them costs no step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineCursor {
    pub segment: SegmentId,
    pub index: i64,
}

impl TimelineCursor {
    #[must_use]
    pub const fn new(segment: SegmentId, index: i64) -> Self {
        Self { segment, index }
    }

    /// Move by `delta` positions, negative meaning backward.
    ///
    /// Crosses into neighbouring segments as needed and stops where no
    /// neighbour continues. Returns the signed number of steps taken, which
    /// is smaller in magnitude than `delta` when the cursor hit a dead end.
    pub fn advance(&mut self, timeline: &RoomTimeline, delta: i64) -> i64 {
        let direction = if delta < 0 {
            Direction::Backward
        } else {
            Direction::Forward
        };
        let sign = if delta < 0 { -1 } else { 1 };
        let mut remaining = delta.unsigned_abs();
        let mut taken: u64 = 0;
        // Bounds hopping through a run of empty segments.
        let mut hops_left = timeline.segment_count();

        while remaining > 0 {
            let Some(seg) = timeline.segment(self.segment) else {
                break;
            };
            let room = match direction {
                Direction::Backward => self.index - seg.min_index(),
                Direction::Forward => seg.max_index() - self.index,
            }
            .max(0)
            .unsigned_abs();

            if room > 0 {
                let step = room.min(remaining);
                self.index += sign * i64::try_from(step).unwrap_or(i64::MAX);
                remaining -= step;
                taken += step;
                continue;
            }

            let Some(next_id) = seg.neighbour(direction) else {
                break;
            };
            let Some(next) = timeline.segment(next_id) else {
                break;
            };
            if hops_left == 0 {
                break;
            }
            hops_left -= 1;

            trace!(from = %self.segment, to = %next_id, %direction, "cursor crossing segments");
            self.segment = next_id;
            self.index = match direction {
                Direction::Backward => next.max_index(),
                Direction::Forward => next.min_index(),
            };
        }

        sign * i64::try_from(taken).unwrap_or(i64::MAX)
    }

    /// `advance(-delta)`, with the result negated back to a step count.
    pub fn retreat(&mut self, timeline: &RoomTimeline, delta: i64) -> i64 {
        -self.advance(timeline, -delta)
    }

    /// Whether at least one step is available in `direction` without
    /// touching the network.
    #[must_use]
    pub fn can_step(&self, timeline: &RoomTimeline, direction: Direction) -> bool {
        let mut probe = *self;
        let delta = match direction {
            Direction::Backward => -1,
            Direction::Forward => 1,
        };
        probe.advance(timeline, delta) != 0
    }
}
