//! Per-room arena of timeline segments.
//!
//! Segments reference each other by [`SegmentId`], never by pointer, so the
//! bidirectional neighbour graph has no ownership cycles. Removing a segment
//! is a map removal plus clearing the two neighbour links that named it; the
//! neighbours keep their pagination tokens and can re-fetch what was lost.
//!
//! Every event held by the arena is indexed by id. An event lives in at most
//! one segment.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::crypto::DecryptionUpdate;
use crate::event::Event;
use crate::sync::wire::Timeline;
use crate::timeline::segment::{Direction, SegmentId, TimelineSegment};
use crate::timeline::source::EventContext;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("segment {0} not found")]
    NotFound(SegmentId),

    #[error("segment {0} is the live segment and cannot be removed")]
    LiveSegment(SegmentId),
}

/// Change notifications, for components that mirror the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineUpdate {
    EventsAdded {
        segment: SegmentId,
        direction: Direction,
        count: usize,
    },
    Linked {
        from: SegmentId,
        to: SegmentId,
        direction: Direction,
    },
    LiveReset {
        previous: SegmentId,
        live: SegmentId,
    },
    SegmentRemoved(SegmentId),
    EventDecrypted {
        event_id: String,
    },
}

#[derive(Debug)]
pub struct RoomTimeline {
    room_id: String,
    segments: BTreeMap<SegmentId, TimelineSegment>,
    next_id: u64,
    live: SegmentId,
    index: HashMap<String, SegmentId>,
    updates: broadcast::Sender<TimelineUpdate>,
}

impl RoomTimeline {
    /// An arena holding one empty live segment.
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(64);
        let mut timeline = Self {
            room_id: room_id.into(),
            segments: BTreeMap::new(),
            next_id: 0,
            live: SegmentId(0),
            index: HashMap::new(),
            updates,
        };
        let live = timeline.create_segment();
        timeline.live = live;
        if let Some(seg) = timeline.segments.get_mut(&live) {
            seg.set_live(true);
        }
        timeline
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub const fn live_segment_id(&self) -> SegmentId {
        self.live
    }

    #[must_use]
    pub fn segment(&self, id: SegmentId) -> Option<&TimelineSegment> {
        self.segments.get(&id)
    }

    #[must_use]
    pub fn live_segment(&self) -> Option<&TimelineSegment> {
        self.segments.get(&self.live)
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.segments.keys().copied()
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total events held across all segments.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, update: TimelineUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    /// Allocate an empty, unlinked segment.
    pub fn create_segment(&mut self) -> SegmentId {
        let id = SegmentId(self.next_id);
        self.next_id += 1;
        self.segments.insert(id, TimelineSegment::new(id));
        id
    }

    /// Link `from`'s `direction` edge to `to`, and `to`'s opposite edge back.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::NotFound`] if either handle is stale.
    pub fn set_neighbour(
        &mut self,
        from: SegmentId,
        to: SegmentId,
        direction: Direction,
    ) -> Result<(), SegmentError> {
        if !self.segments.contains_key(&to) {
            return Err(SegmentError::NotFound(to));
        }
        let seg = self
            .segments
            .get_mut(&from)
            .ok_or(SegmentError::NotFound(from))?;
        seg.edge_mut(direction).neighbour = Some(to);
        if let Some(other) = self.segments.get_mut(&to) {
            other.edge_mut(direction.opposite()).neighbour = Some(from);
        }
        debug!(%from, %to, %direction, "linked segments");
        self.notify(TimelineUpdate::Linked {
            from,
            to,
            direction,
        });
        Ok(())
    }

    /// Drop a segment and everything it holds.
    ///
    /// # Errors
    ///
    /// Refuses the live segment, and fails on a stale handle.
    pub fn remove_segment(&mut self, id: SegmentId) -> Result<TimelineSegment, SegmentError> {
        if id == self.live {
            return Err(SegmentError::LiveSegment(id));
        }
        let removed = self.segments.remove(&id).ok_or(SegmentError::NotFound(id))?;

        for direction in [Direction::Backward, Direction::Forward] {
            if let Some(neighbour) = removed.neighbour(direction)
                && let Some(seg) = self.segments.get_mut(&neighbour)
            {
                let edge = seg.edge_mut(direction.opposite());
                if edge.neighbour == Some(id) {
                    edge.neighbour = None;
                }
            }
        }
        for event in removed.events() {
            self.index.remove(&event.event_id);
        }

        debug!(segment = %id, events = removed.len(), "removed segment");
        self.notify(TimelineUpdate::SegmentRemoved(id));
        Ok(removed)
    }

    /// Which segment holds an event, and at what relative index.
    #[must_use]
    pub fn find_event(&self, event_id: &str) -> Option<(SegmentId, i64)> {
        let id = *self.index.get(event_id)?;
        let index = self.segments.get(&id)?.position_of(event_id)?;
        Some((id, index))
    }

    #[must_use]
    pub fn event(&self, event_id: &str) -> Option<&Event> {
        let (id, index) = self.find_event(event_id)?;
        self.segments.get(&id)?.event_at(index)
    }

    fn insert(&mut self, id: SegmentId, event: Event, at_start: bool) -> bool {
        let Some(seg) = self.segments.get_mut(&id) else {
            return false;
        };
        self.index.insert(event.event_id.clone(), id);
        seg.add_event(event, at_start);
        true
    }

    /// Append events from sync to the live segment. Known events are skipped.
    pub fn add_live_events(&mut self, events: impl IntoIterator<Item = Event>) -> usize {
        let live = self.live;
        let mut added = 0;
        for event in events {
            if self.index.contains_key(&event.event_id) {
                trace!(event_id = %event.event_id, "skipping duplicate live event");
                continue;
            }
            if self.insert(live, event, false) {
                added += 1;
            }
        }
        if added > 0 {
            self.notify(TimelineUpdate::EventsAdded {
                segment: live,
                direction: Direction::Forward,
                count: added,
            });
        }
        added
    }

    /// Apply a sync delta's timeline section to the live segment.
    ///
    /// A `limited` timeline means the gap cannot be bridged from sync, so
    /// the live segment is replaced. Events that fail conversion are skipped.
    pub fn handle_sync_timeline(&mut self, timeline: &Timeline) -> usize {
        if timeline.limited {
            self.reset_live(timeline.prev_batch.clone());
        } else if let Some(seg) = self.segments.get_mut(&self.live)
            && seg.is_empty()
            && seg.token(Direction::Backward).is_none()
        {
            seg.set_token(Direction::Backward, timeline.prev_batch.clone());
        }

        let events: Vec<Event> = timeline
            .events
            .iter()
            .filter_map(|raw| match Event::from_raw(&self.room_id, raw) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(room_id = %self.room_id, error = %err, "skipping unusable sync event");
                    None
                }
            })
            .collect();
        self.add_live_events(events)
    }

    /// Start a fresh live segment whose history continues from
    /// `backward_token`. The old live segment stays as an ordinary segment.
    pub fn reset_live(&mut self, backward_token: Option<String>) -> SegmentId {
        let previous = self.live;
        let live = self.create_segment();
        if let Some(seg) = self.segments.get_mut(&previous) {
            seg.set_live(false);
        }
        if let Some(seg) = self.segments.get_mut(&live) {
            seg.set_live(true);
            seg.set_token(Direction::Backward, backward_token);
        }
        self.live = live;
        debug!(%previous, %live, "reset live segment after gap");
        self.notify(TimelineUpdate::LiveReset { previous, live });
        live
    }

    /// Merge a page of history into `segment`'s `direction` edge.
    ///
    /// Events already in the segment are skipped. Reaching an event held by
    /// another segment means the two runs meet: they are linked and the rest
    /// of the page is left to that segment. The edge token becomes
    /// `next_token` either way.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::NotFound`] for a stale handle.
    pub fn add_paginated_events(
        &mut self,
        segment: SegmentId,
        events: Vec<Event>,
        direction: Direction,
        next_token: Option<String>,
    ) -> Result<usize, SegmentError> {
        if !self.segments.contains_key(&segment) {
            return Err(SegmentError::NotFound(segment));
        }

        let at_start = direction == Direction::Backward;
        let mut added = 0;
        let mut met = None;
        for event in events {
            match self.index.get(&event.event_id) {
                Some(&holder) if holder == segment => {}
                Some(&holder) => {
                    met = Some(holder);
                    break;
                }
                None => {
                    self.insert(segment, event, at_start);
                    added += 1;
                }
            }
        }

        if let Some(other) = met {
            self.link_if_free(segment, other, direction)?;
        }
        if let Some(seg) = self.segments.get_mut(&segment) {
            seg.set_token(direction, next_token);
        }

        debug!(%segment, %direction, added, "merged paginated events");
        if added > 0 {
            self.notify(TimelineUpdate::EventsAdded {
                segment,
                direction,
                count: added,
            });
        }
        Ok(added)
    }

    fn link_if_free(
        &mut self,
        from: SegmentId,
        to: SegmentId,
        direction: Direction,
    ) -> Result<(), SegmentError> {
        let from_free = self
            .segment(from)
            .is_some_and(|s| s.neighbour(direction).is_none());
        let to_free = self
            .segment(to)
            .is_some_and(|s| s.neighbour(direction.opposite()).is_none());
        if from_free && to_free {
            self.set_neighbour(from, to, direction)
        } else {
            trace!(%from, %to, "segments meet but an edge is already linked");
            Ok(())
        }
    }

    /// Insert an event fetched with its context as a new segment, or return
    /// the segment that already holds it.
    pub fn insert_context(&mut self, context: EventContext) -> SegmentId {
        if let Some((id, _)) = self.find_event(&context.event.event_id) {
            return id;
        }

        let id = self.create_segment();
        self.insert(id, context.event, false);

        for (events, direction, token) in [
            (context.events_before, Direction::Backward, context.start),
            (context.events_after, Direction::Forward, context.end),
        ] {
            // Stale only if `id` vanished, which cannot happen here.
            if let Err(err) = self.add_paginated_events(id, events, direction, token) {
                warn!(error = %err, "context merge failed");
            }
        }
        id
    }

    /// Record a decryption outcome on the event, wherever it is held.
    ///
    /// Returns `false` if the event is not in the arena.
    pub fn apply_decryption(&mut self, update: &DecryptionUpdate) -> bool {
        let Some(&id) = self.index.get(&update.event_id) else {
            return false;
        };
        let Some(event) = self
            .segments
            .get_mut(&id)
            .and_then(|seg| seg.event_mut(&update.event_id))
        else {
            return false;
        };
        event.set_decryption(update.status());
        self.notify(TimelineUpdate::EventDecrypted {
            event_id: update.event_id.clone(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::wire::RawEvent;
    use serde_json::json;

    fn event(id: &str) -> Event {
        let raw = RawEvent {
            event_id: Some(id.into()),
            sender: Some("@a:hs".into()),
            ..RawEvent::new("m.room.message", json!({}))
        };
        Event::from_raw("!r:hs", &raw).unwrap()
    }

    fn events(ids: &[&str]) -> Vec<Event> {
        ids.iter().map(|id| event(id)).collect()
    }

    #[test]
    fn live_segment_cannot_be_removed() {
        let mut room = RoomTimeline::new("!r:hs");
        let live = room.live_segment_id();
        assert_eq!(room.remove_segment(live).unwrap_err(), SegmentError::LiveSegment(live));
    }

    #[test]
    fn removal_clears_neighbour_links_only() {
        let mut room = RoomTimeline::new("!r:hs");
        let live = room.live_segment_id();
        let old = room.create_segment();
        room.add_paginated_events(old, events(&["$a"]), Direction::Forward, None)
            .unwrap();
        room.set_neighbour(live, old, Direction::Backward).unwrap();
        if let Some(seg) = room.segments.get_mut(&live) {
            seg.set_token(Direction::Backward, Some("t".into()));
        }

        room.remove_segment(old).unwrap();
        let seg = room.live_segment().unwrap();
        assert_eq!(seg.neighbour(Direction::Backward), None);
        assert_eq!(seg.token(Direction::Backward), Some("t"));
        assert!(room.find_event("$a").is_none());
    }

    #[test]
    fn pagination_meeting_another_segment_links_them() {
        let mut room = RoomTimeline::new("!r:hs");
        let live = room.live_segment_id();
        room.add_live_events(events(&["$4", "$5"]));

        let ctx = room.insert_context(EventContext {
            event: event("$2"),
            events_before: events(&["$1"]),
            events_after: vec![],
            start: Some("s".into()),
            end: Some("e".into()),
        });

        // Paging forward from the context segment runs into the live segment.
        let added = room
            .add_paginated_events(
                ctx,
                events(&["$3", "$4", "$5"]),
                Direction::Forward,
                Some("n".into()),
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(room.segment(ctx).unwrap().neighbour(Direction::Forward), Some(live));
        assert_eq!(room.live_segment().unwrap().neighbour(Direction::Backward), Some(ctx));
        assert_eq!(room.find_event("$1"), Some((ctx, -1)));
    }

    #[test]
    fn limited_sync_resets_live_segment() {
        let mut room = RoomTimeline::new("!r:hs");
        let first = room.live_segment_id();
        room.add_live_events(events(&["$1"]));

        let timeline: Timeline = serde_json::from_value(json!({
            "limited": true,
            "prev_batch": "gap",
            "events": [ { "type": "m.room.message", "event_id": "$9", "content": {} } ]
        }))
        .unwrap();
        assert_eq!(room.handle_sync_timeline(&timeline), 1);

        let live = room.live_segment().unwrap();
        assert_ne!(live.id(), first);
        assert_eq!(live.token(Direction::Backward), Some("gap"));
        assert!(!room.segment(first).unwrap().is_live());
    }

    #[test]
    fn decryption_is_recorded_and_announced() {
        let mut room = RoomTimeline::new("!r:hs");
        let mut rx = room.subscribe();
        room.add_live_events(events(&["$1"]));
        assert!(room.apply_decryption(&DecryptionUpdate::failed("$1", "no key")));
        assert!(!room.apply_decryption(&DecryptionUpdate::failed("$nope", "no key")));

        assert!(matches!(rx.try_recv().unwrap(), TimelineUpdate::EventsAdded { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            TimelineUpdate::EventDecrypted {
                event_id: "$1".into()
            }
        );
        assert!(room.event("$1").unwrap().is_decryption_failure());
    }
}
