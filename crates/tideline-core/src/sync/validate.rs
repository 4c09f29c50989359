//! Per-room validation, run before any mutation.
//!
//! A room entry either validates completely and is merged, or is rejected
//! whole. That keeps a malformed room from leaving half-applied state behind
//! while its siblings in the same delta still go through.

use std::fmt;

use crate::event::types;
use crate::sync::wire::{InvitedRoom, JoinedRoom, LeftRoom, RawEvent};

/// Which bucket of the delta a room entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Membership {
    Join,
    Invite,
    Leave,
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
        })
    }
}

/// What was wrong with a rejected room entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    #[error("room id is empty")]
    EmptyRoomId,

    #[error("{section} event has an empty type")]
    EmptyType { section: &'static str },

    #[error("state event of type '{event_type}' has no state_key")]
    StateWithoutKey { event_type: String },

    #[error("timeline event of type '{event_type}' has no event_id")]
    TimelineWithoutId { event_type: String },

    #[error("receipt content is not an object")]
    ReceiptNotObject,
}

/// A room entry that was skipped during accumulation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{membership} room '{room_id}' rejected: {reason}")]
pub struct RoomMergeError {
    pub room_id: String,
    pub membership: Membership,
    pub reason: MalformedReason,
}

fn check_types(section: &'static str, events: &[RawEvent]) -> Result<(), MalformedReason> {
    if events.iter().any(|e| e.event_type.is_empty()) {
        return Err(MalformedReason::EmptyType { section });
    }
    Ok(())
}

fn check_state(section: &'static str, events: &[RawEvent]) -> Result<(), MalformedReason> {
    check_types(section, events)?;
    match events.iter().find(|e| e.state_key.is_none()) {
        Some(e) => Err(MalformedReason::StateWithoutKey {
            event_type: e.event_type.clone(),
        }),
        None => Ok(()),
    }
}

fn check_timeline(events: &[RawEvent]) -> Result<(), MalformedReason> {
    check_types("timeline", events)?;
    match events.iter().find(|e| e.event_id.is_none()) {
        Some(e) => Err(MalformedReason::TimelineWithoutId {
            event_type: e.event_type.clone(),
        }),
        None => Ok(()),
    }
}

fn check_room_id(room_id: &str) -> Result<(), MalformedReason> {
    if room_id.trim().is_empty() {
        return Err(MalformedReason::EmptyRoomId);
    }
    Ok(())
}

/// Validate a joined-room entry.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate_joined(room_id: &str, room: &JoinedRoom) -> Result<(), MalformedReason> {
    check_room_id(room_id)?;
    check_state("state", &room.state.events)?;
    check_timeline(&room.timeline.events)?;
    check_types("ephemeral", &room.ephemeral.events)?;
    check_types("account_data", &room.account_data.events)?;
    if room
        .ephemeral
        .events
        .iter()
        .any(|e| e.event_type == types::RECEIPT && !e.content.is_object())
    {
        return Err(MalformedReason::ReceiptNotObject);
    }
    Ok(())
}

/// Validate an invited-room entry.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate_invited(room_id: &str, room: &InvitedRoom) -> Result<(), MalformedReason> {
    check_room_id(room_id)?;
    check_state("invite_state", &room.invite_state.events)
}

/// Validate a left-room entry.
///
/// # Errors
///
/// Returns the first problem found.
pub fn validate_left(room_id: &str, room: &LeftRoom) -> Result<(), MalformedReason> {
    check_room_id(room_id)?;
    check_state("state", &room.state.events)?;
    check_timeline(&room.timeline.events)?;
    check_types("account_data", &room.account_data.events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn joined(value: serde_json::Value) -> JoinedRoom {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn empty_room_id_is_rejected() {
        assert_eq!(
            validate_joined("", &JoinedRoom::default()),
            Err(MalformedReason::EmptyRoomId)
        );
    }

    #[test]
    fn state_event_needs_state_key() {
        let room = joined(json!({ "state": { "events": [ { "type": "m.room.name" } ] } }));
        assert_eq!(
            validate_joined("!r:hs", &room),
            Err(MalformedReason::StateWithoutKey {
                event_type: "m.room.name".into()
            })
        );
    }

    #[test]
    fn timeline_event_needs_id() {
        let room = joined(json!({ "timeline": { "events": [ { "type": "m.room.message" } ] } }));
        assert!(matches!(
            validate_joined("!r:hs", &room),
            Err(MalformedReason::TimelineWithoutId { .. })
        ));
    }

    #[test]
    fn receipt_content_must_be_object() {
        let room = joined(json!({
            "ephemeral": { "events": [ { "type": "m.receipt", "content": [] } ] }
        }));
        assert_eq!(
            validate_joined("!r:hs", &room),
            Err(MalformedReason::ReceiptNotObject)
        );
    }

    #[test]
    fn error_names_the_room() {
        let err = RoomMergeError {
            room_id: "!bad:hs".into(),
            membership: Membership::Join,
            reason: MalformedReason::EmptyType { section: "state" },
        };
        assert_eq!(
            err.to_string(),
            "join room '!bad:hs' rejected: state event has an empty type"
        );
    }
}
