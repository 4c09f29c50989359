//! Serde model of the synchronization payloads.
//!
//! Field names follow the protocol's JSON exactly. Every section defaults to
//! empty when absent, so a parsed snapshot and a parsed delta can be compared
//! structurally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single event as it appears on the wire.
///
/// Only `type` is always present. Timeline and state events carry an
/// `event_id`; ephemeral and account-data events usually do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

impl RawEvent {
    /// Build a content-only event (ephemeral and account-data shape).
    #[must_use]
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            content,
            event_id: None,
            sender: None,
            state_key: None,
            origin_server_ts: None,
            room_id: None,
            redacts: None,
            unsigned: None,
        }
    }

    /// Returns `true` if this event carries a state key.
    #[must_use]
    pub const fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// `unsigned.prev_content`, if the server supplied it.
    #[must_use]
    pub fn prev_content(&self) -> Option<&Value> {
        self.unsigned.as_ref()?.get("prev_content")
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// `{ "events": [...] }` wrapper used by most sections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

impl EventList {
    #[must_use]
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self { events }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The timeline section of a room entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RawEvent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,

    /// `true` when the server skipped events between the previous delta and
    /// this one.
    #[serde(default)]
    pub limited: bool,
}

/// Room summary; every field is optional and merged independently.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<String>>,

    #[serde(
        rename = "m.joined_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub joined_member_count: Option<u64>,

    #[serde(
        rename = "m.invited_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub invited_member_count: Option<u64>,
}

/// Unread counters as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub ephemeral: EventList,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub summary: RoomSummary,
    #[serde(default)]
    pub unread_notifications: UnreadNotifications,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unread_thread_notifications: BTreeMap<String, UnreadNotifications>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: EventList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeftRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub account_data: EventList,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<String, LeftRoom>,
}

/// One incremental synchronization payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncDelta {
    pub next_batch: String,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub rooms: Rooms,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_sections_default_to_empty() {
        let delta: SyncDelta = serde_json::from_value(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!a:hs": {} } }
        }))
        .unwrap();

        let room = &delta.rooms.join["!a:hs"];
        assert!(room.state.is_empty());
        assert!(room.timeline.events.is_empty());
        assert!(!room.timeline.limited);
        assert_eq!(room.summary, RoomSummary::default());
        assert!(delta.account_data.is_empty());
    }

    #[test]
    fn summary_uses_protocol_field_names() {
        let summary: RoomSummary = serde_json::from_value(json!({
            "m.heroes": ["@alice:hs"],
            "m.joined_member_count": 3
        }))
        .unwrap();
        assert_eq!(summary.heroes, Some(vec!["@alice:hs".to_string()]));
        assert_eq!(summary.joined_member_count, Some(3));
        assert_eq!(summary.invited_member_count, None);
    }

    #[test]
    fn raw_event_defaults_content_to_object() {
        let ev: RawEvent = serde_json::from_value(json!({ "type": "m.typing" })).unwrap();
        assert_eq!(ev.content, json!({}));
        assert!(!ev.is_state());
    }

    #[test]
    fn prev_content_reads_unsigned() {
        let ev: RawEvent = serde_json::from_value(json!({
            "type": "m.room.name",
            "state_key": "",
            "content": { "name": "new" },
            "unsigned": { "prev_content": { "name": "old" } }
        }))
        .unwrap();
        assert_eq!(ev.prev_content(), Some(&json!({ "name": "old" })));
    }
}
