//! Read-receipt accumulation.
//!
//! The server sends receipts as `m.receipt` ephemeral events whose content
//! maps `event_id -> receipt_type -> user_id -> data`. Deltas only carry what
//! changed, so the accumulator keeps the latest receipt per
//! `(user, receipt type, thread)` and rebuilds one combined event for readers.
//!
//! # Supersession
//!
//! - A receipt replaces the stored one for the same key unless its `ts` is
//!   strictly older. Equal or missing timestamps fall back to arrival order.
//! - An unthreaded receipt is ignored when the user already holds a receipt
//!   of the same type on the `main` thread with an equal-or-newer `ts`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::trace;

use crate::event::types;
use crate::sync::wire::RawEvent;

/// Which timeline a receipt applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreadKey {
    Unthreaded,
    Main,
    Thread(String),
}

impl ThreadKey {
    fn from_data(data: &Value) -> Self {
        match data.get("thread_id").and_then(Value::as_str) {
            None => Self::Unthreaded,
            Some(types::MAIN_THREAD) => Self::Main,
            Some(thread) => Self::Thread(thread.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredReceipt {
    event_id: String,
    data: Value,
}

impl StoredReceipt {
    fn ts(&self) -> Option<u64> {
        receipt_ts(&self.data)
    }
}

fn receipt_ts(data: &Value) -> Option<u64> {
    data.get("ts").and_then(Value::as_u64)
}

type ReceiptKey = (String, String, ThreadKey);

/// Latest receipt per `(user, receipt type, thread)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiptAccumulator {
    entries: BTreeMap<ReceiptKey, StoredReceipt>,
}

impl ReceiptAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored `(user, type, thread)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Fold one `m.receipt` event into the accumulator.
    ///
    /// Entries that are not JSON objects are skipped.
    pub fn consume(&mut self, event: &RawEvent) {
        let Some(by_event) = event.content.as_object() else {
            return;
        };
        for (event_id, by_type) in by_event {
            let Some(by_type) = by_type.as_object() else {
                trace!(event_id, "skipping malformed receipt entry");
                continue;
            };
            for (receipt_type, by_user) in by_type {
                let Some(by_user) = by_user.as_object() else {
                    continue;
                };
                for (user_id, data) in by_user {
                    self.set_receipt(event_id, receipt_type, user_id, data);
                }
            }
        }
    }

    /// Store a single receipt, returning `true` if it was applied.
    pub fn set_receipt(
        &mut self,
        event_id: &str,
        receipt_type: &str,
        user_id: &str,
        data: &Value,
    ) -> bool {
        let thread = ThreadKey::from_data(data);
        let incoming_ts = receipt_ts(data);

        if thread == ThreadKey::Unthreaded {
            let main_key = (
                user_id.to_string(),
                receipt_type.to_string(),
                ThreadKey::Main,
            );
            if let Some(main) = self.entries.get(&main_key)
                && let (Some(main_ts), Some(new_ts)) = (main.ts(), incoming_ts)
                && main_ts >= new_ts
            {
                trace!(user_id, receipt_type, "unthreaded receipt behind main thread");
                return false;
            }
        }

        let key = (user_id.to_string(), receipt_type.to_string(), thread);
        if let Some(existing) = self.entries.get(&key)
            && let (Some(old_ts), Some(new_ts)) = (existing.ts(), incoming_ts)
            && new_ts < old_ts
        {
            return false;
        }

        self.entries.insert(
            key,
            StoredReceipt {
                event_id: event_id.to_string(),
                data: data.clone(),
            },
        );
        true
    }

    /// The event a user's receipt currently points at.
    #[must_use]
    pub fn receipt_for(
        &self,
        user_id: &str,
        receipt_type: &str,
        thread: &ThreadKey,
    ) -> Option<&str> {
        self.entries
            .get(&(user_id.to_string(), receipt_type.to_string(), thread.clone()))
            .map(|stored| stored.event_id.as_str())
    }

    /// Rebuild a single synthetic `m.receipt` event from every stored entry.
    ///
    /// Returns `None` when nothing is stored. If two entries for the same
    /// user and type land on the same event, the newer one is kept.
    #[must_use]
    pub fn build_event(&self) -> Option<RawEvent> {
        if self.entries.is_empty() {
            return None;
        }

        let mut content: BTreeMap<&str, BTreeMap<&str, BTreeMap<&str, &StoredReceipt>>> =
            BTreeMap::new();
        for ((user_id, receipt_type, _), stored) in &self.entries {
            let slot = content
                .entry(stored.event_id.as_str())
                .or_default()
                .entry(receipt_type.as_str())
                .or_default();
            let replace = slot.get(user_id.as_str()).is_none_or(|current| {
                stored.ts().unwrap_or_default() >= current.ts().unwrap_or_default()
            });
            if replace {
                slot.insert(user_id.as_str(), stored);
            }
        }

        let mut by_event = Map::new();
        for (event_id, by_type) in content {
            let mut type_map = Map::new();
            for (receipt_type, by_user) in by_type {
                let user_map: Map<String, Value> = by_user
                    .into_iter()
                    .map(|(user, stored)| (user.to_string(), stored.data.clone()))
                    .collect();
                type_map.insert(receipt_type.to_string(), Value::Object(user_map));
            }
            by_event.insert(event_id.to_string(), Value::Object(type_map));
        }

        Some(RawEvent::new(types::RECEIPT, Value::Object(by_event)))
    }
}
