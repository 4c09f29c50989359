//! Top-level delta folding.
//!
//! [`SyncAccumulator`] consumes deltas one at a time and keeps enough state
//! to answer [`SyncAccumulator::state`] with what a single full sync would
//! have returned for the same inputs. The snapshot doubles as the resumption
//! checkpoint: [`SyncAccumulator::restore`] rebuilds an accumulator from it.
//!
//! # Delivery contract
//!
//! Each delta must be applied exactly once. Ephemeral, account-data and
//! summary merges are snapshot-replace and tolerate a repeat; timeline
//! appends do not.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AccumulatorConfig;
use crate::sync::room::{RoomAccumulator, StateKey};
use crate::sync::validate::{
    Membership, RoomMergeError, validate_invited, validate_joined, validate_left,
};
use crate::sync::wire::{EventList, InvitedRoom, RawEvent, Rooms, SyncDelta};

/// Whole-delta failures. Nothing is mutated when these are returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccumulateError {
    #[error("delta has an empty next_batch token")]
    MissingNextBatch,

    #[error("checkpoint has {} malformed room(s)", .0.len())]
    CorruptCheckpoint(Vec<RoomMergeError>),
}

/// What happened while folding one delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulateReport {
    /// Room entries merged.
    pub rooms_applied: usize,
    /// Room entries skipped because they failed validation.
    pub rejected: Vec<RoomMergeError>,
}

impl AccumulateReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Full-sync-equivalent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// `None` until the first delta is accumulated.
    pub next_batch: Option<String>,
    #[serde(default)]
    pub account_data: Vec<RawEvent>,
    #[serde(default)]
    pub rooms: Rooms,
}

#[derive(Debug, Clone)]
pub struct SyncAccumulator {
    config: AccumulatorConfig,
    next_batch: Option<String>,
    account_data: IndexMap<String, RawEvent>,
    join: BTreeMap<String, RoomAccumulator>,
    invite: BTreeMap<String, IndexMap<StateKey, RawEvent>>,
    leave: BTreeMap<String, RoomAccumulator>,
}

impl SyncAccumulator {
    #[must_use]
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            next_batch: None,
            account_data: IndexMap::new(),
            join: BTreeMap::new(),
            invite: BTreeMap::new(),
            leave: BTreeMap::new(),
        }
    }

    /// Rebuild an accumulator from a snapshot previously produced by
    /// [`Self::state`].
    ///
    /// # Errors
    ///
    /// Returns [`AccumulateError::CorruptCheckpoint`] if any room in the
    /// snapshot fails validation.
    pub fn restore(state: &SyncState, config: AccumulatorConfig) -> Result<Self, AccumulateError> {
        let mut acc = Self::new(config);
        let Some(next_batch) = state.next_batch.clone() else {
            return Ok(acc);
        };

        let delta = SyncDelta {
            next_batch,
            account_data: EventList::new(state.account_data.clone()),
            rooms: state.rooms.clone(),
        };
        let report = acc.accumulate(&delta)?;
        if !report.is_clean() {
            return Err(AccumulateError::CorruptCheckpoint(report.rejected));
        }
        Ok(acc)
    }

    /// Fold one delta.
    ///
    /// Rooms are validated individually; a malformed room is skipped and
    /// reported while the rest of the delta still applies.
    ///
    /// # Errors
    ///
    /// Returns [`AccumulateError::MissingNextBatch`] without mutating
    /// anything if the delta has no `next_batch`.
    pub fn accumulate(&mut self, delta: &SyncDelta) -> Result<AccumulateReport, AccumulateError> {
        if delta.next_batch.is_empty() {
            return Err(AccumulateError::MissingNextBatch);
        }

        let mut report = AccumulateReport::default();
        let max = self.config.max_timeline_entries;

        for (room_id, room) in &delta.rooms.invite {
            match validate_invited(room_id, room) {
                Ok(()) => {
                    self.accumulate_invite(room_id, room);
                    report.rooms_applied += 1;
                }
                Err(reason) => report.reject(room_id, Membership::Invite, reason),
            }
        }

        for (room_id, room) in &delta.rooms.join {
            match validate_joined(room_id, room) {
                Ok(()) => {
                    self.invite.remove(room_id);
                    let acc = match self.leave.remove(room_id) {
                        Some(previous) => self.join.entry(room_id.clone()).or_insert(previous),
                        None => self.join.entry(room_id.clone()).or_default(),
                    };
                    acc.merge_joined(room, max);
                    report.rooms_applied += 1;
                }
                Err(reason) => report.reject(room_id, Membership::Join, reason),
            }
        }

        for (room_id, room) in &delta.rooms.leave {
            match validate_left(room_id, room) {
                Ok(()) => {
                    self.invite.remove(room_id);
                    let mut acc = self
                        .join
                        .remove(room_id)
                        .or_else(|| self.leave.remove(room_id))
                        .unwrap_or_default();
                    acc.merge_left(room, max);
                    self.leave.insert(room_id.clone(), acc);
                    report.rooms_applied += 1;
                }
                Err(reason) => report.reject(room_id, Membership::Leave, reason),
            }
        }

        for event in &delta.account_data.events {
            if event.event_type.is_empty() {
                warn!("skipping global account data event with empty type");
                continue;
            }
            self.account_data
                .insert(event.event_type.clone(), event.clone());
        }

        self.next_batch = Some(delta.next_batch.clone());
        debug!(
            next_batch = %delta.next_batch,
            applied = report.rooms_applied,
            rejected = report.rejected.len(),
            "accumulated delta"
        );
        Ok(report)
    }

    fn accumulate_invite(&mut self, room_id: &str, room: &InvitedRoom) {
        let state = self.invite.entry(room_id.to_string()).or_default();
        for event in &room.invite_state.events {
            if let Some(state_key) = &event.state_key {
                state.insert((event.event_type.clone(), state_key.clone()), event.clone());
            }
        }
    }

    /// Snapshot equivalent to a full sync over the accumulated inputs.
    #[must_use]
    pub fn state(&self) -> SyncState {
        let mut rooms = Rooms::default();
        for (room_id, acc) in &self.join {
            rooms.join.insert(room_id.clone(), acc.to_joined());
        }
        for (room_id, state) in &self.invite {
            rooms.invite.insert(
                room_id.clone(),
                InvitedRoom {
                    invite_state: EventList::new(state.values().cloned().collect()),
                },
            );
        }
        for (room_id, acc) in &self.leave {
            rooms.leave.insert(room_id.clone(), acc.to_left());
        }

        SyncState {
            next_batch: self.next_batch.clone(),
            account_data: self.account_data.values().cloned().collect(),
            rooms,
        }
    }

    #[must_use]
    pub const fn config(&self) -> AccumulatorConfig {
        self.config
    }

    #[must_use]
    pub fn next_batch(&self) -> Option<&str> {
        self.next_batch.as_deref()
    }

    /// Accumulated state of a joined room.
    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<&RoomAccumulator> {
        self.join.get(room_id)
    }

    /// Accumulated state of a room the user has left.
    #[must_use]
    pub fn left_room(&self, room_id: &str) -> Option<&RoomAccumulator> {
        self.leave.get(room_id)
    }

    /// Current state of a joined room, including state changes inside the
    /// retained timeline.
    #[must_use]
    pub fn current_state(&self, room_id: &str) -> Option<IndexMap<StateKey, RawEvent>> {
        self.join.get(room_id).map(RoomAccumulator::current_state)
    }

    #[must_use]
    pub fn is_invited(&self, room_id: &str) -> bool {
        self.invite.contains_key(room_id)
    }

    pub fn joined_room_ids(&self) -> impl Iterator<Item = &str> {
        self.join.keys().map(String::as_str)
    }

    /// Global account data of the given type.
    #[must_use]
    pub fn account_data(&self, event_type: &str) -> Option<&RawEvent> {
        self.account_data.get(event_type)
    }
}

impl Default for SyncAccumulator {
    fn default() -> Self {
        Self::new(AccumulatorConfig::default())
    }
}

impl AccumulateReport {
    fn reject(
        &mut self,
        room_id: &str,
        membership: Membership,
        reason: crate::sync::validate::MalformedReason,
    ) {
        let err = RoomMergeError {
            room_id: room_id.to_string(),
            membership,
            reason,
        };
        warn!(error = %err, "rejected room entry");
        self.rejected.push(err);
    }
}
