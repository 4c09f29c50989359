//! Room event model shared by the timeline and relation layers.
//!
//! An [`Event`] is the typed view of a wire [`RawEvent`] that belongs to a
//! room's history. Identity is the `event_id`: every collection in this crate
//! keys events by id, so two `Event` values with the same id are the same
//! logical event even when their decryption state differs.
//!
//! Encrypted events (`m.room.encrypted`) start out [`DecryptionStatus::Pending`].
//! The crypto collaborator resolves them to `Decrypted` or `Failed`; the
//! `effective_*` accessors then return the clear payload or a placeholder.

pub mod relation;
pub mod types;

pub use relation::{RelatesTo, RelationType};

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::sync::wire::RawEvent;

/// Errors converting a wire event into a room [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("event of type '{event_type}' has no event_id")]
    MissingEventId { event_type: String },

    #[error("event has an empty type")]
    MissingType,
}

/// Clear payload produced by a successful decryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedPayload {
    pub event_type: String,
    pub content: Value,
}

/// Where an event stands with respect to end-to-end encryption.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DecryptionStatus {
    /// Never encrypted.
    #[default]
    Clear,
    /// Encrypted and not yet resolved.
    Pending,
    /// Encrypted and successfully decrypted.
    Decrypted(DecryptedPayload),
    /// Encrypted and terminally undecryptable.
    Failed { reason: String },
}

/// A room timeline event.
///
/// Equality and hashing look only at `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    /// Type as sent on the wire (`m.room.encrypted` for encrypted events).
    pub event_type: String,
    pub state_key: Option<String>,
    /// Content as sent on the wire.
    pub content: Value,
    pub origin_server_ts: u64,
    pub redacts: Option<String>,
    pub unsigned: Option<Value>,
    pub decryption: DecryptionStatus,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.event_id.hash(state);
    }
}

impl Event {
    /// Convert a wire event belonging to `room_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] when the event has no id or an empty type.
    pub fn from_raw(room_id: &str, raw: &RawEvent) -> Result<Self, EventError> {
        if raw.event_type.is_empty() {
            return Err(EventError::MissingType);
        }
        let event_id = raw
            .event_id
            .clone()
            .ok_or_else(|| EventError::MissingEventId {
                event_type: raw.event_type.clone(),
            })?;

        let decryption = if raw.event_type == types::ENCRYPTED {
            DecryptionStatus::Pending
        } else {
            DecryptionStatus::Clear
        };

        // Older servers put `redacts` in content rather than at the top level.
        let redacts = raw.redacts.clone().or_else(|| {
            raw.content
                .get("redacts")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        Ok(Self {
            event_id,
            room_id: raw.room_id.clone().unwrap_or_else(|| room_id.to_string()),
            sender: raw.sender.clone().unwrap_or_default(),
            event_type: raw.event_type.clone(),
            state_key: raw.state_key.clone(),
            content: raw.content.clone(),
            origin_server_ts: raw.origin_server_ts.unwrap_or_default(),
            redacts,
            unsigned: raw.unsigned.clone(),
            decryption,
        })
    }

    /// Back to the wire shape, as stored in checkpoints.
    #[must_use]
    pub fn to_raw(&self) -> RawEvent {
        RawEvent {
            event_type: self.event_type.clone(),
            content: self.content.clone(),
            event_id: Some(self.event_id.clone()),
            sender: Some(self.sender.clone()),
            state_key: self.state_key.clone(),
            origin_server_ts: Some(self.origin_server_ts),
            room_id: Some(self.room_id.clone()),
            redacts: self.redacts.clone(),
            unsigned: self.unsigned.clone(),
        }
    }

    /// Returns `true` if `other` is the same logical event.
    #[must_use]
    pub fn same_event(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }

    #[must_use]
    pub const fn is_pending_decryption(&self) -> bool {
        matches!(self.decryption, DecryptionStatus::Pending)
    }

    #[must_use]
    pub const fn is_decryption_failure(&self) -> bool {
        matches!(self.decryption, DecryptionStatus::Failed { .. })
    }

    /// The clear event type: the decrypted type if known, else the wire type.
    #[must_use]
    pub fn effective_type(&self) -> &str {
        match &self.decryption {
            DecryptionStatus::Decrypted(payload) => &payload.event_type,
            _ => &self.event_type,
        }
    }

    /// The content a reader should see.
    #[must_use]
    pub fn effective_content(&self) -> Value {
        match &self.decryption {
            DecryptionStatus::Decrypted(payload) => payload.content.clone(),
            DecryptionStatus::Failed { reason } => json!({
                "msgtype": types::BAD_ENCRYPTED_MSGTYPE,
                "body": format!("** Unable to decrypt: {reason} **"),
            }),
            DecryptionStatus::Clear | DecryptionStatus::Pending => self.content.clone(),
        }
    }

    /// Relation metadata, read from the wire content first.
    ///
    /// `m.relates_to` stays in the clear on encrypted events, so this works
    /// while decryption is still pending.
    #[must_use]
    pub fn relation(&self) -> Option<RelatesTo> {
        RelatesTo::from_content(&self.content).or_else(|| match &self.decryption {
            DecryptionStatus::Decrypted(payload) => RelatesTo::from_content(&payload.content),
            _ => None,
        })
    }

    /// Record the outcome of a decryption attempt.
    pub fn set_decryption(&mut self, status: DecryptionStatus) {
        self.decryption = status;
    }
}
