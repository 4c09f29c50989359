//! A single-room homeserver with a linear history.
//!
//! History positions double as pagination tokens: `tN` sits after the first
//! `N` events. Each call to [`SimulatedHomeserver::next_delta`] appends a
//! random batch and returns the sync delta describing it, sometimes as a
//! `limited` delta that hides part of the batch behind a gap. The same
//! server answers pagination through [`TimelineSource`], with injected
//! stalls and transient failures.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tideline_core::event::{Event, types};
use tideline_core::sync::SyncDelta;
use tideline_core::sync::wire::{EventList, JoinedRoom, RawEvent, Rooms, Timeline};
use tideline_core::timeline::{
    Direction, EventContext, PaginationChunk, SourceError, TimelineSource,
};
use tracing::{debug, trace};

use crate::crypto::{LOST_SESSION, SHARED_SESSION};
use crate::rng::SimRng;

pub const ROOM_ID: &str = "!sim:tideline.test";

const USERS: [&str; 4] = [
    "@ada:tideline.test",
    "@bo:tideline.test",
    "@cy:tideline.test",
    "@di:tideline.test",
];
const REACTION_KEYS: [&str; 3] = ["👍", "🎉", "👀"];

/// Fault and content mix for the simulated server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFaults {
    /// Largest batch appended per sync round.
    pub max_batch: usize,
    /// Chance a delta is `limited`, hiding older events of the batch.
    pub gap_percent: u8,
    /// Chance a delta repeats the current topic in its state section.
    pub duplicate_state_percent: u8,
    /// Chance a delta carries a read receipt.
    pub receipt_percent: u8,
    /// Chance a new event is a reaction to an earlier message.
    pub reaction_percent: u8,
    /// Chance a new message is encrypted.
    pub encrypted_percent: u8,
    /// Chance an encrypted message uses a session the client never gets.
    pub undecryptable_percent: u8,
    /// Chance a fetch returns nothing while claiming more history.
    pub stall_percent: u8,
    /// Chance a fetch fails outright.
    pub fetch_fail_percent: u8,
}

impl Default for ServerFaults {
    fn default() -> Self {
        Self {
            max_batch: 6,
            gap_percent: 10,
            duplicate_state_percent: 10,
            receipt_percent: 40,
            reaction_percent: 20,
            encrypted_percent: 20,
            undecryptable_percent: 25,
            stall_percent: 10,
            fetch_fail_percent: 5,
        }
    }
}

/// What a delta did, for the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub next_batch: String,
    pub appended: usize,
    pub delivered: usize,
    pub limited: bool,
}

#[derive(Debug)]
struct ServerState {
    history: Vec<RawEvent>,
    batch: u64,
    content_rng: SimRng,
    fault_rng: SimRng,
    receipts: BTreeMap<String, String>,
    receipt_ts: u64,
    topic: Option<RawEvent>,
    fetches: usize,
    stalls: usize,
    failures: usize,
}

#[derive(Debug)]
pub struct SimulatedHomeserver {
    faults: ServerFaults,
    state: Mutex<ServerState>,
}

impl SimulatedHomeserver {
    #[must_use]
    pub fn new(seed: u64, faults: ServerFaults) -> Self {
        let mut root = SimRng::new(seed);
        Self {
            faults,
            state: Mutex::new(ServerState {
                history: Vec::new(),
                batch: 0,
                content_rng: root.fork(0xC0),
                fault_rng: root.fork(0xFA),
                receipts: BTreeMap::new(),
                receipt_ts: 0,
                topic: None,
                fetches: 0,
                stalls: 0,
                failures: 0,
            }),
        }
    }

    /// Append a batch and describe it as a sync delta.
    pub fn next_delta(&self) -> (SyncDelta, DeltaSummary) {
        let mut state = self.state.lock();
        let synced = state.history.len();
        let appended = state.content_rng.between(1, self.faults.max_batch.max(1));
        for _ in 0..appended {
            let event = self.generate(&mut state);
            if event.state_key.is_some() {
                state.topic = Some(event.clone());
            }
            state.history.push(event);
        }

        let len = state.history.len();
        let limited = appended > 1 && state.content_rng.chance(self.faults.gap_percent);
        let first = if limited {
            len - state.content_rng.between(1, appended - 1)
        } else {
            synced
        };

        let mut joined = JoinedRoom {
            timeline: Timeline {
                events: state.history[first..].to_vec(),
                prev_batch: Some(format!("t{first}")),
                limited,
            },
            ..JoinedRoom::default()
        };

        if state.content_rng.chance(self.faults.duplicate_state_percent)
            && let Some(topic) = state.topic.clone()
        {
            joined.state = EventList::new(vec![topic]);
        }

        if state.content_rng.chance(self.faults.receipt_percent)
            && let Some(latest) = state.history.last().and_then(|e| e.event_id.clone())
            && let Some(user) = state.content_rng.pick(&USERS).copied()
        {
            state.receipt_ts += 1;
            let ts = state.receipt_ts;
            joined.ephemeral = EventList::new(vec![RawEvent::new(
                types::RECEIPT,
                json!({ latest.as_str(): { "m.read": { user: { "ts": ts } } } }),
            )]);
            state.receipts.insert(user.to_string(), latest);
        }

        state.batch += 1;
        let next_batch = format!("s{}", state.batch);
        let mut rooms = Rooms::default();
        rooms.join.insert(ROOM_ID.to_string(), joined);

        let summary = DeltaSummary {
            next_batch: next_batch.clone(),
            appended,
            delivered: len - first,
            limited,
        };
        debug!(batch = state.batch, appended, limited, "generated delta");
        (
            SyncDelta {
                next_batch,
                rooms,
                ..SyncDelta::default()
            },
            summary,
        )
    }

    fn generate(&self, state: &mut ServerState) -> RawEvent {
        let seq = state.history.len() + 1;
        let rng = &mut state.content_rng;
        let sender = rng.pick(&USERS).copied().unwrap_or(USERS[0]);
        let base = RawEvent {
            event_id: Some(format!("${seq}")),
            sender: Some(sender.to_string()),
            origin_server_ts: Some(1_700_000_000_000 + seq as u64),
            room_id: Some(ROOM_ID.to_string()),
            ..RawEvent::new(types::MESSAGE, Value::Null)
        };

        let messages: Vec<&RawEvent> = state
            .history
            .iter()
            .filter(|e| e.event_type == types::MESSAGE || e.event_type == types::ENCRYPTED)
            .collect();

        if !messages.is_empty() && rng.chance(self.faults.reaction_percent) {
            let target = messages[rng.below(messages.len())]
                .event_id
                .clone()
                .unwrap_or_default();
            let key = rng.pick(&REACTION_KEYS).copied().unwrap_or("👍");
            return RawEvent {
                event_type: types::REACTION.to_string(),
                content: json!({
                    "m.relates_to": { "rel_type": "m.annotation", "event_id": target, "key": key }
                }),
                ..base
            };
        }

        if rng.chance(10) {
            return RawEvent {
                event_type: "m.room.topic".to_string(),
                state_key: Some(String::new()),
                content: json!({ "topic": format!("topic {seq}") }),
                ..base
            };
        }

        let body = json!({ "msgtype": "m.text", "body": format!("message {seq}") });
        if rng.chance(self.faults.encrypted_percent) {
            let session = if rng.chance(self.faults.undecryptable_percent) {
                LOST_SESSION
            } else {
                SHARED_SESSION
            };
            return RawEvent {
                event_type: types::ENCRYPTED.to_string(),
                content: json!({
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "session_id": session,
                    "ciphertext": format!("ct{seq}"),
                    "sim_plaintext": { "type": types::MESSAGE, "content": body },
                }),
                ..base
            };
        }

        RawEvent {
            content: body,
            ..base
        }
    }

    /// Every event id in server order.
    #[must_use]
    pub fn history_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .history
            .iter()
            .filter_map(|e| e.event_id.clone())
            .collect()
    }

    /// Latest read receipt sent per user.
    #[must_use]
    pub fn expected_receipts(&self) -> BTreeMap<String, String> {
        self.state.lock().receipts.clone()
    }

    #[must_use]
    pub fn fetch_stats(&self) -> FetchStats {
        let state = self.state.lock();
        FetchStats {
            fetches: state.fetches,
            stalls: state.stalls,
            failures: state.failures,
        }
    }

    fn to_event(raw: &RawEvent) -> Option<Event> {
        Event::from_raw(ROOM_ID, raw).ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub fetches: usize,
    pub stalls: usize,
    pub failures: usize,
}

fn parse_token(token: &str) -> Result<usize, SourceError> {
    token
        .strip_prefix('t')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| SourceError::Unavailable(format!("unknown token '{token}'")))
}

#[async_trait]
impl TimelineSource for SimulatedHomeserver {
    async fn fetch_timeline(
        &self,
        room_id: &str,
        token: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<PaginationChunk, SourceError> {
        let mut state = self.state.lock();
        state.fetches += 1;
        if room_id != ROOM_ID {
            return Err(SourceError::Unavailable(format!("unknown room {room_id}")));
        }
        if state.fault_rng.chance(self.faults.fetch_fail_percent) {
            state.failures += 1;
            return Err(SourceError::Transport("injected failure".into()));
        }
        if state.fault_rng.chance(self.faults.stall_percent) {
            state.stalls += 1;
            trace!(token, "injected stall");
            return Ok(PaginationChunk {
                events: Vec::new(),
                end: Some(token.to_string()),
            });
        }

        let at = parse_token(token)?.min(state.history.len());
        let len = state.history.len();
        let chunk = match direction {
            Direction::Backward => {
                let lo = at.saturating_sub(limit);
                PaginationChunk {
                    events: state.history[lo..at]
                        .iter()
                        .rev()
                        .filter_map(Self::to_event)
                        .collect(),
                    end: (lo > 0).then(|| format!("t{lo}")),
                }
            }
            Direction::Forward => {
                let hi = at.saturating_add(limit).min(len);
                PaginationChunk {
                    events: state.history[at..hi]
                        .iter()
                        .filter_map(Self::to_event)
                        .collect(),
                    end: (hi < len).then(|| format!("t{hi}")),
                }
            }
        };
        Ok(chunk)
    }

    async fn fetch_event_context(
        &self,
        room_id: &str,
        event_id: &str,
        limit: usize,
    ) -> Result<EventContext, SourceError> {
        let mut state = self.state.lock();
        state.fetches += 1;
        let not_found = || SourceError::NotFound {
            event_id: event_id.to_string(),
        };
        if room_id != ROOM_ID {
            return Err(not_found());
        }
        let position = state
            .history
            .iter()
            .position(|e| e.event_id.as_deref() == Some(event_id))
            .ok_or_else(not_found)?;
        let event = Self::to_event(&state.history[position]).ok_or_else(not_found)?;

        let half = limit / 2;
        let lo = position.saturating_sub(half);
        let hi = (position + 1 + half).min(state.history.len());
        Ok(EventContext {
            event,
            events_before: state.history[lo..position]
                .iter()
                .rev()
                .filter_map(Self::to_event)
                .collect(),
            events_after: state.history[position + 1..hi]
                .iter()
                .filter_map(Self::to_event)
                .collect(),
            start: (lo > 0).then(|| format!("t{lo}")),
            end: (hi < state.history.len()).then(|| format!("t{hi}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> ServerFaults {
        ServerFaults {
            gap_percent: 0,
            stall_percent: 0,
            fetch_fail_percent: 0,
            ..ServerFaults::default()
        }
    }

    #[test]
    fn deltas_cover_history_without_gaps() {
        let server = SimulatedHomeserver::new(9, quiet());
        let mut delivered = Vec::new();
        for _ in 0..10 {
            let (delta, summary) = server.next_delta();
            assert!(!summary.limited);
            let room = &delta.rooms.join[ROOM_ID];
            delivered.extend(room.timeline.events.iter().filter_map(|e| e.event_id.clone()));
        }
        assert_eq!(delivered, server.history_ids());
    }

    #[test]
    fn limited_delta_points_prev_batch_at_first_delivered() {
        let server = SimulatedHomeserver::new(
            4,
            ServerFaults {
                gap_percent: 100,
                max_batch: 8,
                ..quiet()
            },
        );
        for _ in 0..20 {
            let (delta, summary) = server.next_delta();
            let timeline = &delta.rooms.join[ROOM_ID].timeline;
            let ids = server.history_ids();
            let first = ids.len() - summary.delivered;
            assert_eq!(timeline.prev_batch, Some(format!("t{first}")));
            assert_eq!(timeline.events[0].event_id.as_deref(), Some(ids[first].as_str()));
        }
    }

    #[tokio::test]
    async fn backward_fetch_walks_history() {
        let server = SimulatedHomeserver::new(2, quiet());
        for _ in 0..5 {
            server.next_delta();
        }
        let ids = server.history_ids();
        let token = format!("t{}", ids.len());
        let chunk = server
            .fetch_timeline(ROOM_ID, &token, Direction::Backward, 3)
            .await
            .unwrap();
        let got: Vec<_> = chunk.events.iter().map(|e| e.event_id.clone()).collect();
        let want: Vec<_> = ids.iter().rev().take(got.len()).cloned().collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn unknown_context_is_not_found() {
        let server = SimulatedHomeserver::new(2, quiet());
        server.next_delta();
        let err = server
            .fetch_event_context(ROOM_ID, "$nope", 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }
}
