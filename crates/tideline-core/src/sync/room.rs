//! Per-room accumulation: state, bounded timeline, ephemeral, receipts,
//! account data and summary.
//!
//! # Timeline and state
//!
//! The stored state map is the room state *at the start of the retained
//! timeline*. State events inside the retained timeline fold on top of it to
//! give [`RoomAccumulator::current_state`]. Whenever timeline entries are
//! discarded (gap or pruning) their state events fold into the stored map, so
//! no state change is lost with the history that carried it.
//!
//! # Pruning
//!
//! Every delta records its `prev_batch` on the first entry it appends. Those
//! tagged entries are the only places the timeline can be cut while keeping a
//! pagination token that points exactly at the new oldest event. When the
//! timeline outgrows the limit, the cut happens at the oldest tagged entry
//! whose suffix fits. If none fits, the newest `max` entries are kept and the
//! first inherits the nearest preceding token.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::event::types;
use crate::sync::receipts::ReceiptAccumulator;
use crate::sync::wire::{
    EventList, JoinedRoom, LeftRoom, RawEvent, RoomSummary, Timeline, UnreadNotifications,
};

/// `(event type, state key)`.
pub type StateKey = (String, String);

/// A retained timeline event plus the pagination token recorded for it.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub event: RawEvent,
    /// Set on the first event of each delta, when the delta had a
    /// `prev_batch`.
    pub token: Option<String>,
}

fn state_key_of(event: &RawEvent) -> Option<StateKey> {
    event
        .state_key
        .as_ref()
        .map(|sk| (event.event_type.clone(), sk.clone()))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomAccumulator {
    state: IndexMap<StateKey, RawEvent>,
    timeline: Vec<TimelineEntry>,
    ephemeral: Vec<RawEvent>,
    receipts: ReceiptAccumulator,
    account_data: IndexMap<String, RawEvent>,
    summary: RoomSummary,
    unread_notifications: UnreadNotifications,
    unread_thread_notifications: BTreeMap<String, UnreadNotifications>,
}

impl RoomAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a joined-room delta. The entry must already be validated.
    pub fn merge_joined(&mut self, room: &JoinedRoom, max_timeline_entries: usize) {
        if room.timeline.limited {
            self.discard_timeline();
        }
        self.apply_state(&room.state.events);
        self.apply_timeline(&room.timeline, max_timeline_entries);
        self.apply_ephemeral(&room.ephemeral.events);
        self.apply_account_data(&room.account_data.events);
        self.apply_summary(&room.summary);
        self.unread_notifications = room.unread_notifications.clone();
        self.unread_thread_notifications = room.unread_thread_notifications.clone();
    }

    /// Merge a left-room delta. The entry must already be validated.
    pub fn merge_left(&mut self, room: &LeftRoom, max_timeline_entries: usize) {
        if room.timeline.limited {
            self.discard_timeline();
        }
        self.apply_state(&room.state.events);
        self.apply_timeline(&room.timeline, max_timeline_entries);
        self.apply_account_data(&room.account_data.events);
        self.ephemeral.clear();
    }

    /// Overwrite state entries, last write wins per `(type, state_key)`.
    pub fn apply_state(&mut self, events: &[RawEvent]) {
        for event in events {
            if let Some(key) = state_key_of(event) {
                self.state.insert(key, event.clone());
            }
        }
    }

    /// Append a delta's timeline, then prune to the limit.
    ///
    /// [`Self::merge_joined`] discards before applying state so the gap's
    /// folded state cannot overwrite the delta's newer state.
    pub fn apply_timeline(&mut self, timeline: &Timeline, max_timeline_entries: usize) {
        if timeline.limited && !self.timeline.is_empty() {
            self.discard_timeline();
        }

        for (index, event) in timeline.events.iter().enumerate() {
            let token = if index == 0 {
                timeline.prev_batch.clone()
            } else {
                None
            };
            self.timeline.push(TimelineEntry {
                event: event.clone(),
                token,
            });
        }

        self.prune(max_timeline_entries);
    }

    /// Drop the whole retained timeline, folding its state into the base.
    pub fn discard_timeline(&mut self) {
        let dropped = std::mem::take(&mut self.timeline);
        debug!(dropped = dropped.len(), "timeline gap: discarding retained events");
        self.fold_into_state(dropped);
    }

    fn fold_into_state(&mut self, entries: impl IntoIterator<Item = TimelineEntry>) {
        for entry in entries {
            if let Some(key) = state_key_of(&entry.event) {
                self.state.insert(key, entry.event);
            }
        }
    }

    fn prune(&mut self, max: usize) {
        let len = self.timeline.len();
        if len <= max {
            return;
        }
        if max == 0 {
            self.discard_timeline();
            return;
        }

        let earliest = len - max;
        let boundary = self
            .timeline
            .iter()
            .enumerate()
            .skip(earliest)
            .find(|(_, entry)| entry.token.is_some())
            .map(|(index, _)| index);

        match boundary {
            Some(cut) => {
                let dropped: Vec<_> = self.timeline.drain(..cut).collect();
                debug!(
                    dropped = dropped.len(),
                    kept = self.timeline.len(),
                    "pruned timeline at batch boundary"
                );
                self.fold_into_state(dropped);
            }
            None => {
                let inherited = self.timeline[..=earliest]
                    .iter()
                    .rev()
                    .find_map(|entry| entry.token.clone());
                let dropped: Vec<_> = self.timeline.drain(..earliest).collect();
                debug!(
                    dropped = dropped.len(),
                    kept = self.timeline.len(),
                    "no boundary fits; kept newest events"
                );
                self.fold_into_state(dropped);
                if let Some(first) = self.timeline.first_mut() {
                    first.token = inherited;
                }
            }
        }
    }

    /// Typing is dropped, receipts merged, everything else replaced.
    pub fn apply_ephemeral(&mut self, events: &[RawEvent]) {
        let mut others = Vec::new();
        for event in events {
            match event.event_type.as_str() {
                types::TYPING => trace!("dropping typing notification"),
                types::RECEIPT => self.receipts.consume(event),
                _ => others.push(event.clone()),
            }
        }
        self.ephemeral = others;
    }

    pub fn apply_account_data(&mut self, events: &[RawEvent]) {
        for event in events {
            self.account_data
                .insert(event.event_type.clone(), event.clone());
        }
    }

    /// Field-by-field merge; absent fields keep their stored value.
    pub fn apply_summary(&mut self, summary: &RoomSummary) {
        if summary.heroes.is_some() {
            self.summary.heroes.clone_from(&summary.heroes);
        }
        if summary.joined_member_count.is_some() {
            self.summary.joined_member_count = summary.joined_member_count;
        }
        if summary.invited_member_count.is_some() {
            self.summary.invited_member_count = summary.invited_member_count;
        }
    }

    /// The token anchoring the oldest retained event.
    #[must_use]
    pub fn prev_batch(&self) -> Option<&str> {
        self.timeline.first()?.token.as_deref()
    }

    #[must_use]
    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    #[must_use]
    pub fn timeline_len(&self) -> usize {
        self.timeline.len()
    }

    /// State at the start of the retained timeline.
    #[must_use]
    pub fn state_at_timeline_start(&self) -> &IndexMap<StateKey, RawEvent> {
        &self.state
    }

    /// State after the newest retained timeline event.
    #[must_use]
    pub fn current_state(&self) -> IndexMap<StateKey, RawEvent> {
        let mut state = self.state.clone();
        for entry in &self.timeline {
            if let Some(key) = state_key_of(&entry.event) {
                state.insert(key, entry.event.clone());
            }
        }
        state
    }

    #[must_use]
    pub fn receipts(&self) -> &ReceiptAccumulator {
        &self.receipts
    }

    #[must_use]
    pub fn account_data(&self, event_type: &str) -> Option<&RawEvent> {
        self.account_data.get(event_type)
    }

    #[must_use]
    pub fn summary(&self) -> &RoomSummary {
        &self.summary
    }

    fn timeline_snapshot(&self) -> Timeline {
        Timeline {
            events: self.timeline.iter().map(|e| e.event.clone()).collect(),
            prev_batch: self.prev_batch().map(str::to_string),
            limited: false,
        }
    }

    /// Snapshot in the joined-room wire shape.
    #[must_use]
    pub fn to_joined(&self) -> JoinedRoom {
        let mut ephemeral = self.ephemeral.clone();
        if let Some(receipts) = self.receipts.build_event() {
            ephemeral.push(receipts);
        }
        JoinedRoom {
            state: EventList::new(self.state.values().cloned().collect()),
            timeline: self.timeline_snapshot(),
            ephemeral: EventList::new(ephemeral),
            account_data: EventList::new(self.account_data.values().cloned().collect()),
            summary: self.summary.clone(),
            unread_notifications: self.unread_notifications.clone(),
            unread_thread_notifications: self.unread_thread_notifications.clone(),
        }
    }

    /// Snapshot in the left-room wire shape.
    #[must_use]
    pub fn to_left(&self) -> LeftRoom {
        LeftRoom {
            state: EventList::new(self.state.values().cloned().collect()),
            timeline: self.timeline_snapshot(),
            account_data: EventList::new(self.account_data.values().cloned().collect()),
        }
    }
}
