//! Forwarding "decryption completed" signals to the components that care.
//!
//! Nothing subscribes implicitly. A [`ReaggregationTrigger`] is built with a
//! bus subscription and then told which listeners to feed; dropping it ends
//! the forwarding. A trigger that falls behind the bus replays the bus's
//! outcome log, so listeners must tolerate repeated updates.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tracing::{debug, warn};

use crate::crypto::{DecryptionBus, DecryptionUpdate, OutcomeLog};
use crate::relations::RelationsCollection;
use crate::timeline::RoomTimeline;

pub trait DecryptionListener: Send + Sync {
    fn on_decryption_completed(&self, update: &DecryptionUpdate);
}

impl DecryptionListener for Mutex<RelationsCollection> {
    fn on_decryption_completed(&self, update: &DecryptionUpdate) {
        self.lock().on_decryption_completed(update);
    }
}

impl DecryptionListener for Mutex<RoomTimeline> {
    fn on_decryption_completed(&self, update: &DecryptionUpdate) {
        self.lock().apply_decryption(update);
    }
}

pub struct ReaggregationTrigger {
    rx: Receiver<DecryptionUpdate>,
    log: OutcomeLog,
    listeners: Vec<Arc<dyn DecryptionListener>>,
}

impl std::fmt::Debug for ReaggregationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaggregationTrigger")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ReaggregationTrigger {
    /// Subscribe to `bus`. Updates published before this call are not seen.
    #[must_use]
    pub fn new(bus: &DecryptionBus) -> Self {
        Self {
            rx: bus.subscribe(),
            log: bus.log(),
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, listener: Arc<dyn DecryptionListener>) {
        self.listeners.push(listener);
    }

    fn forward(&self, update: &DecryptionUpdate) {
        for listener in &self.listeners {
            listener.on_decryption_completed(update);
        }
    }

    /// Replay every outcome the bus has logged after missing `missed`
    /// updates. Returns how many were replayed.
    fn resync(&self, missed: u64) -> usize {
        let outcomes = self.log.snapshot();
        warn!(
            missed,
            replayed = outcomes.len(),
            "decryption listener lagged; replaying log"
        );
        for update in &outcomes {
            self.forward(update);
        }
        outcomes.len()
    }

    /// Forward updates until the bus closes. Returns how many were forwarded.
    pub async fn run(mut self) -> usize {
        let mut forwarded = 0;
        loop {
            match self.rx.recv().await {
                Ok(update) => {
                    self.forward(&update);
                    forwarded += 1;
                }
                Err(RecvError::Lagged(missed)) => {
                    self.resync(missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(forwarded, "decryption bus closed");
        forwarded
    }

    /// Forward whatever is queued without waiting.
    pub fn pump(&mut self) -> usize {
        let mut forwarded = 0;
        loop {
            match self.rx.try_recv() {
                Ok(update) => {
                    self.forward(&update);
                    forwarded += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    self.resync(missed);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, RelationType};
    use crate::sync::wire::RawEvent;
    use serde_json::json;

    fn raw(id: &str, event_type: &str, content: serde_json::Value) -> Event {
        let raw = RawEvent {
            event_id: Some(id.into()),
            sender: Some("@a:hs".into()),
            ..RawEvent::new(event_type, content)
        };
        Event::from_raw("!r:hs", &raw).unwrap()
    }

    #[tokio::test]
    async fn forwards_to_every_listener_until_closed() {
        let bus = DecryptionBus::default();
        let relations = Arc::new(Mutex::new(RelationsCollection::new()));
        let timeline = Arc::new(Mutex::new(RoomTimeline::new("!r:hs")));

        let target = raw("$t", "m.room.encrypted", json!({}));
        relations.lock().add_event(&target);
        relations.lock().add_event(&raw(
            "$r",
            "m.reaction",
            json!({ "m.relates_to": { "rel_type": "m.annotation", "event_id": "$t", "key": "x" } }),
        ));
        timeline.lock().add_live_events([target]);

        let mut trigger = ReaggregationTrigger::new(&bus);
        trigger.register(relations.clone());
        trigger.register(timeline.clone());

        bus.publish(DecryptionUpdate::failed("$t", "withheld"));
        drop(bus);
        assert_eq!(trigger.run().await, 1);

        assert!(timeline.lock().event("$t").unwrap().is_decryption_failure());
        assert!(
            relations
                .lock()
                .get_relations_for_event("$t", &RelationType::Annotation, None)
                .is_some()
        );
    }

    #[test]
    fn pump_drains_without_blocking() {
        let bus = DecryptionBus::default();
        let mut trigger = ReaggregationTrigger::new(&bus);
        assert_eq!(trigger.pump(), 0);
        bus.publish(DecryptionUpdate::failed("$a", "x"));
        bus.publish(DecryptionUpdate::failed("$b", "x"));
        assert_eq!(trigger.pump(), 2);
    }

    #[test]
    fn lagging_pump_recovers_missed_updates() {
        let bus = DecryptionBus::new(16);
        let relations = Arc::new(Mutex::new(RelationsCollection::new()));
        let mut trigger = ReaggregationTrigger::new(&bus);
        trigger.register(relations.clone());

        for n in 0..300 {
            let mut rels = relations.lock();
            rels.add_event(&raw(&format!("$t{n}"), "m.room.encrypted", json!({})));
            rels.add_event(&raw(
                &format!("$r{n}"),
                "m.reaction",
                json!({ "m.relates_to": {
                    "rel_type": "m.annotation", "event_id": format!("$t{n}"), "key": "x"
                } }),
            ));
        }
        assert_eq!(relations.lock().deferred_count(), 300);

        for n in 0..300 {
            bus.publish(DecryptionUpdate::failed(format!("$t{n}"), "withheld"));
        }
        trigger.pump();

        assert_eq!(relations.lock().deferred_count(), 0);
        assert!(
            relations
                .lock()
                .get_relations_for_event("$t299", &RelationType::Annotation, None)
                .is_some()
        );
    }

    #[tokio::test]
    async fn lagging_run_recovers_missed_updates() {
        let bus = DecryptionBus::new(2);
        let timeline = Arc::new(Mutex::new(RoomTimeline::new("!r:hs")));
        let events = (0..5).map(|n| raw(&format!("$e{n}"), "m.room.encrypted", json!({})));
        timeline.lock().add_live_events(events);

        let mut trigger = ReaggregationTrigger::new(&bus);
        trigger.register(timeline.clone());
        for n in 0..5 {
            bus.publish(DecryptionUpdate::failed(format!("$e{n}"), "withheld"));
        }
        drop(bus);
        trigger.run().await;

        for n in 0..5 {
            let id = format!("$e{n}");
            assert!(timeline.lock().event(&id).unwrap().is_decryption_failure());
        }
    }
}
