//! Relation metadata carried in `content["m.relates_to"]`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of relationship one event has to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationType {
    /// Reactions and other keyed annotations.
    Annotation,
    /// Edits.
    Replace,
    /// Thread membership.
    Thread,
    /// Generic references.
    Reference,
    /// Rich replies (`m.in_reply_to`, which has no `rel_type`).
    Reply,
    /// Anything else the server hands us.
    Other(String),
}

impl RelationType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Annotation => "m.annotation",
            Self::Replace => "m.replace",
            Self::Thread => "m.thread",
            Self::Reference => "m.reference",
            Self::Reply => "m.in_reply_to",
            Self::Other(raw) => raw,
        }
    }
}

impl From<&str> for RelationType {
    fn from(raw: &str) -> Self {
        match raw {
            "m.annotation" => Self::Annotation,
            "m.replace" => Self::Replace,
            "m.thread" => Self::Thread,
            "m.reference" => Self::Reference,
            "m.in_reply_to" => Self::Reply,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for RelationType {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<RelationType> for String {
    fn from(rel: RelationType) -> Self {
        rel.as_str().to_string()
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `m.relates_to` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatesTo {
    pub rel_type: RelationType,
    /// The event this one relates to.
    pub target: String,
    /// Aggregation key, set for annotations.
    pub key: Option<String>,
}

impl RelatesTo {
    /// Extract relation metadata from an event content object.
    ///
    /// A `rel_type` with an `event_id` wins; a bare `m.in_reply_to` is read
    /// as a reply.
    #[must_use]
    pub fn from_content(content: &Value) -> Option<Self> {
        let relates_to = content.get("m.relates_to")?;

        if let (Some(rel_type), Some(target)) = (
            relates_to.get("rel_type").and_then(Value::as_str),
            relates_to.get("event_id").and_then(Value::as_str),
        ) {
            return Some(Self {
                rel_type: RelationType::from(rel_type),
                target: target.to_string(),
                key: relates_to
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        let reply_target = relates_to
            .get("m.in_reply_to")?
            .get("event_id")?
            .as_str()?;
        Some(Self {
            rel_type: RelationType::Reply,
            target: reply_target.to_string(),
            key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn annotation_keeps_key() {
        let rel = RelatesTo::from_content(&json!({
            "m.relates_to": { "rel_type": "m.annotation", "event_id": "$t", "key": "👍" }
        }))
        .unwrap();
        assert_eq!(rel.rel_type, RelationType::Annotation);
        assert_eq!(rel.target, "$t");
        assert_eq!(rel.key.as_deref(), Some("👍"));
    }

    #[test]
    fn bare_reply_is_recognised() {
        let rel = RelatesTo::from_content(&json!({
            "body": "> quoted",
            "m.relates_to": { "m.in_reply_to": { "event_id": "$orig" } }
        }))
        .unwrap();
        assert_eq!(rel.rel_type, RelationType::Reply);
        assert_eq!(rel.target, "$orig");
    }

    #[test]
    fn unknown_rel_type_round_trips() {
        let rel = RelationType::from("org.example.custom");
        assert_eq!(rel, RelationType::Other("org.example.custom".into()));
        assert_eq!(String::from(rel), "org.example.custom");
    }

    #[test]
    fn content_without_relation_is_none() {
        assert!(RelatesTo::from_content(&json!({ "body": "hi" })).is_none());
        assert!(RelatesTo::from_content(&json!({ "m.relates_to": {} })).is_none());
    }
}
