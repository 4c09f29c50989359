//! Relation aggregation over the visible timeline.
//!
//! [`RelationsCollection`] indexes edits, reactions, replies, thread
//! membership and any other `m.relates_to` links by `(target, rel_type)`.
//! Sync and pagination can both deliver the same event, so
//! [`RelationsCollection::add_event`] is idempotent by event id.
//!
//! # Decryption deferral
//!
//! A relation is held back while the relation event itself or its target is
//! still pending decryption. [`RelationsCollection::on_decryption_completed`]
//! releases what was waiting on that event. An event whose own decryption
//! failed is never aggregated. A target whose decryption failed still
//! releases the relations pointing at it, since those were readable all
//! along.

pub mod set;
pub mod trigger;

pub use set::{AnnotationGroup, RelationSet};
pub use trigger::{DecryptionListener, ReaggregationTrigger};

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::crypto::DecryptionUpdate;
use crate::event::{DecryptionStatus, Event, RelatesTo, RelationType, types};

type RelationKey = (String, RelationType);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Pending,
    Failed,
}

impl Readiness {
    const fn of(event: &Event) -> Self {
        match event.decryption {
            DecryptionStatus::Pending => Self::Pending,
            DecryptionStatus::Failed { .. } => Self::Failed,
            DecryptionStatus::Clear | DecryptionStatus::Decrypted(_) => Self::Ready,
        }
    }
}

#[derive(Debug, Default)]
pub struct RelationsCollection {
    /// Every event id ever added, for idempotence.
    seen: HashSet<String>,
    readiness: HashMap<String, Readiness>,
    aggregated: HashMap<RelationKey, IndexMap<String, Event>>,
    /// Relation event id -> where it was aggregated.
    placed: HashMap<String, RelationKey>,
    /// Relation candidates held back by pending decryption.
    deferred: IndexMap<String, Event>,
    /// Pending events with no visible relation; decryption may reveal one.
    undecided: HashMap<String, Event>,
    redacted: HashSet<String>,
}

impl RelationsCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event. Re-adding a known event id is a no-op.
    pub fn add_event(&mut self, event: &Event) {
        if !self.seen.insert(event.event_id.clone()) {
            trace!(event_id = %event.event_id, "relation already known");
            return;
        }
        if event.effective_type() == types::REDACTION {
            if let Some(redacts) = &event.redacts {
                self.redact(redacts);
            }
            return;
        }
        if self.redacted.contains(&event.event_id) {
            return;
        }

        let readiness = Readiness::of(event);
        self.readiness.insert(event.event_id.clone(), readiness);
        match readiness {
            Readiness::Failed => {}
            Readiness::Pending => {
                self.withhold_relations_to(&event.event_id);
                match event.relation() {
                    Some(_) => {
                        self.deferred.insert(event.event_id.clone(), event.clone());
                    }
                    None => {
                        self.undecided.insert(event.event_id.clone(), event.clone());
                    }
                }
            }
            Readiness::Ready => {
                if let Some(relation) = event.relation() {
                    self.place(event.clone(), relation);
                }
            }
        }
    }

    /// Aggregate now, or defer if the target is pending.
    fn place(&mut self, event: Event, relation: RelatesTo) {
        if self.readiness.get(&relation.target) == Some(&Readiness::Pending) {
            trace!(
                event_id = %event.event_id,
                target = %relation.target,
                "deferring until target decrypts"
            );
            self.deferred.insert(event.event_id.clone(), event);
            return;
        }

        let key = (relation.target, relation.rel_type);
        self.placed.insert(event.event_id.clone(), key.clone());
        self.aggregated
            .entry(key)
            .or_default()
            .entry(event.event_id.clone())
            .or_insert(event);
    }

    /// Pull relations already aggregated onto `target` back into deferral.
    /// Paging backward delivers relations before their older targets.
    fn withhold_relations_to(&mut self, target: &str) {
        let keys: Vec<RelationKey> = self
            .aggregated
            .keys()
            .filter(|(t, _)| t == target)
            .cloned()
            .collect();
        for key in keys {
            let Some(events) = self.aggregated.remove(&key) else {
                continue;
            };
            debug!(target, withheld = events.len(), "target pending; withholding relations");
            for (id, event) in events {
                self.placed.remove(&id);
                self.deferred.insert(id, event);
            }
        }
    }

    fn redact(&mut self, event_id: &str) {
        self.redacted.insert(event_id.to_string());
        self.deferred.shift_remove(event_id);
        self.undecided.remove(event_id);
        if let Some(key) = self.placed.remove(event_id)
            && let Some(events) = self.aggregated.get_mut(&key)
        {
            events.shift_remove(event_id);
            if events.is_empty() {
                self.aggregated.remove(&key);
            }
            debug!(event_id, "redacted relation removed");
        }
    }

    /// React to a decryption outcome. Signals for events that are not
    /// pending are ignored, so repeats are harmless.
    pub fn on_decryption_completed(&mut self, update: &DecryptionUpdate) {
        let id = update.event_id.as_str();
        if self.readiness.get(id) != Some(&Readiness::Pending) {
            return;
        }

        let own = self
            .deferred
            .shift_remove(id)
            .or_else(|| self.undecided.remove(id));

        if update.is_failure() {
            self.readiness.insert(id.to_string(), Readiness::Failed);
            if own.is_some() {
                debug!(event_id = id, "dropping undecryptable relation candidate");
            }
        } else {
            self.readiness.insert(id.to_string(), Readiness::Ready);
            if let Some(mut event) = own {
                event.set_decryption(update.status());
                if let Some(relation) = event.relation() {
                    self.place(event, relation);
                }
            }
        }

        let released: Vec<String> = self
            .deferred
            .iter()
            .filter(|(_, candidate)| {
                !candidate.is_pending_decryption()
                    && candidate.relation().is_some_and(|r| r.target == id)
            })
            .map(|(candidate_id, _)| candidate_id.clone())
            .collect();
        for candidate_id in released {
            if let Some(candidate) = self.deferred.shift_remove(&candidate_id)
                && let Some(relation) = candidate.relation()
            {
                trace!(event_id = %candidate_id, target = id, "releasing deferred relation");
                self.place(candidate, relation);
            }
        }
    }

    /// Relations of `rel_type` pointing at `event_id`, optionally only
    /// those whose clear type is `event_type`.
    #[must_use]
    pub fn get_relations_for_event(
        &self,
        event_id: &str,
        rel_type: &RelationType,
        event_type: Option<&str>,
    ) -> Option<RelationSet> {
        let events = self
            .aggregated
            .get(&(event_id.to_string(), rel_type.clone()))?;
        let matching: Vec<Event> = events
            .values()
            .filter(|e| event_type.is_none_or(|t| e.effective_type() == t))
            .cloned()
            .collect();
        if matching.is_empty() {
            return None;
        }
        Some(RelationSet::new(
            event_id.to_string(),
            rel_type.clone(),
            matching,
        ))
    }

    /// Relation candidates waiting on decryption.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    #[must_use]
    pub fn is_known(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DecryptedPayload;
    use crate::sync::wire::RawEvent;
    use serde_json::{Value, json};

    fn event(id: &str, sender: &str, event_type: &str, content: Value, ts: u64) -> Event {
        let raw = RawEvent {
            event_id: Some(id.into()),
            sender: Some(sender.into()),
            origin_server_ts: Some(ts),
            ..RawEvent::new(event_type, content)
        };
        Event::from_raw("!r:hs", &raw).unwrap()
    }

    fn reaction(id: &str, sender: &str, target: &str, key: &str) -> Event {
        event(
            id,
            sender,
            types::REACTION,
            json!({ "m.relates_to": { "rel_type": "m.annotation", "event_id": target, "key": key } }),
            0,
        )
    }

    fn edit(id: &str, sender: &str, target: &str, ts: u64) -> Event {
        event(
            id,
            sender,
            types::MESSAGE,
            json!({ "m.relates_to": { "rel_type": "m.replace", "event_id": target } }),
            ts,
        )
    }

    #[test]
    fn annotations_group_by_key_and_popularity() {
        let mut rels = RelationsCollection::new();
        rels.add_event(&reaction("$r1", "@a:hs", "$t", "👀"));
        rels.add_event(&reaction("$r2", "@a:hs", "$t", "👍"));
        rels.add_event(&reaction("$r3", "@b:hs", "$t", "👍"));
        rels.add_event(&reaction("$r4", "@c:hs", "$t", "🎉"));

        let set = rels
            .get_relations_for_event("$t", &RelationType::Annotation, Some(types::REACTION))
            .unwrap();
        let groups = set.annotations();
        assert_eq!(groups[0].key, "👍");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].senders, ["@a:hs", "@b:hs"]);
        assert_eq!(groups[1].key, "👀");
        assert_eq!(groups[2].key, "🎉");
    }

    #[test]
    fn event_type_filter_excludes_other_types() {
        let mut rels = RelationsCollection::new();
        rels.add_event(&reaction("$r1", "@a:hs", "$t", "👍"));
        assert!(
            rels.get_relations_for_event("$t", &RelationType::Annotation, Some("m.sticker"))
                .is_none()
        );
    }

    #[test]
    fn last_replacement_ignores_other_senders() {
        let mut rels = RelationsCollection::new();
        rels.add_event(&edit("$e1", "@a:hs", "$t", 10));
        rels.add_event(&edit("$e2", "@a:hs", "$t", 30));
        rels.add_event(&edit("$e3", "@mallory:hs", "$t", 50));

        let set = rels
            .get_relations_for_event("$t", &RelationType::Replace, None)
            .unwrap();
        assert_eq!(set.last_replacement("@a:hs").unwrap().event_id, "$e2");
    }

    #[test]
    fn pending_relation_with_hidden_payload_resolves_on_decryption() {
        let mut rels = RelationsCollection::new();
        let pending = event("$x", "@a:hs", types::ENCRYPTED, json!({ "ciphertext": "…" }), 0);
        rels.add_event(&pending);
        assert_eq!(rels.deferred_count(), 0);

        rels.on_decryption_completed(&DecryptionUpdate::decrypted(
            "$x",
            DecryptedPayload {
                event_type: types::MESSAGE.into(),
                content: json!({ "m.relates_to": { "rel_type": "m.thread", "event_id": "$root" } }),
            },
        ));
        let set = rels
            .get_relations_for_event("$root", &RelationType::Thread, Some(types::MESSAGE))
            .unwrap();
        assert!(set.contains("$x"));
    }
}
