//! Query results for relation lookups.

use indexmap::IndexMap;
use serde::Serialize;

use crate::event::{Event, RelationType};

/// Annotations sharing one aggregation key, e.g. every 👍 on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationGroup {
    pub key: String,
    pub count: usize,
    /// Distinct senders, in order of first annotation.
    pub senders: Vec<String>,
}

/// Relation events of one type pointing at one target, oldest first and
/// without duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSet {
    target: String,
    rel_type: RelationType,
    events: Vec<Event>,
}

impl RelationSet {
    pub(crate) const fn new(target: String, rel_type: RelationType, events: Vec<Event>) -> Self {
        Self {
            target,
            rel_type,
            events,
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub const fn rel_type(&self) -> &RelationType {
        &self.rel_type
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn contains(&self, event_id: &str) -> bool {
        self.events.iter().any(|e| e.event_id == event_id)
    }

    /// Annotations grouped by key, most popular first. Ties keep the order
    /// in which each key first appeared.
    #[must_use]
    pub fn annotations(&self) -> Vec<AnnotationGroup> {
        let mut groups: IndexMap<String, AnnotationGroup> = IndexMap::new();
        for event in &self.events {
            let Some(key) = event.relation().and_then(|r| r.key) else {
                continue;
            };
            let group = groups
                .entry(key.clone())
                .or_insert_with(|| AnnotationGroup {
                    key,
                    count: 0,
                    senders: Vec::new(),
                });
            group.count += 1;
            if !group.senders.contains(&event.sender) {
                group.senders.push(event.sender.clone());
            }
        }

        let mut groups: Vec<_> = groups.into_values().collect();
        // Stable, so equal counts stay in first-appearance order.
        groups.sort_by(|a, b| b.count.cmp(&a.count));
        groups
    }

    /// The newest edit made by the original sender. Edits by anyone else
    /// are ignored.
    #[must_use]
    pub fn last_replacement(&self, original_sender: &str) -> Option<&Event> {
        if self.rel_type != RelationType::Replace {
            return None;
        }
        self.events
            .iter()
            .filter(|e| e.sender == original_sender)
            .fold(None, |best: Option<&Event>, e| match best {
                Some(b) if b.origin_server_ts > e.origin_server_ts => Some(b),
                _ => Some(e),
            })
    }
}
