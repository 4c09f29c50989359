//! Decryption boundary.
//!
//! Key management lives elsewhere. This module only defines the capability
//! the core consumes ([`Decryptor`]) and the broadcast channel that tells
//! interested components when an event has been resolved
//! ([`DecryptionBus`]). Failures are terminal here; retry policy belongs to
//! the crypto collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::event::{DecryptedPayload, DecryptionStatus, Event};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptionError {
    #[error("no session key for {session_id}")]
    MissingKey { session_id: String },

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn attempt_decryption(&self, event: &Event) -> Result<DecryptedPayload, DecryptionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecryptionOutcome {
    Decrypted(DecryptedPayload),
    Failed(String),
}

/// "Decryption completed" signal for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptionUpdate {
    pub event_id: String,
    pub outcome: DecryptionOutcome,
}

impl DecryptionUpdate {
    #[must_use]
    pub fn decrypted(event_id: impl Into<String>, payload: DecryptedPayload) -> Self {
        Self {
            event_id: event_id.into(),
            outcome: DecryptionOutcome::Decrypted(payload),
        }
    }

    #[must_use]
    pub fn failed(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            outcome: DecryptionOutcome::Failed(reason.into()),
        }
    }

    /// The status an event should take on receipt of this update.
    #[must_use]
    pub fn status(&self) -> DecryptionStatus {
        match &self.outcome {
            DecryptionOutcome::Decrypted(payload) => DecryptionStatus::Decrypted(payload.clone()),
            DecryptionOutcome::Failed(reason) => DecryptionStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self.outcome, DecryptionOutcome::Failed(_))
    }
}

/// Latest outcome per event id, in first-resolved order.
///
/// A subscriber that falls behind the broadcast channel replays this to
/// recover the updates it missed.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLog {
    outcomes: Arc<Mutex<IndexMap<String, DecryptionUpdate>>>,
}

impl OutcomeLog {
    fn record(&self, update: &DecryptionUpdate) {
        self.outcomes
            .lock()
            .insert(update.event_id.clone(), update.clone());
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<DecryptionUpdate> {
        self.outcomes.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }
}

/// Fan-out of [`DecryptionUpdate`]s.
///
/// Dropping every clone of the bus closes it; subscribers then drain what is
/// queued and stop. Every published outcome is also kept in an
/// [`OutcomeLog`].
#[derive(Debug, Clone)]
pub struct DecryptionBus {
    tx: broadcast::Sender<DecryptionUpdate>,
    log: OutcomeLog,
}

impl DecryptionBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            log: OutcomeLog::default(),
        }
    }

    /// A handle on the outcome log. Holding it does not keep the bus open.
    #[must_use]
    pub fn log(&self) -> OutcomeLog {
        self.log.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DecryptionUpdate> {
        self.tx.subscribe()
    }

    /// Publish an update, returning how many subscribers will see it.
    pub fn publish(&self, update: DecryptionUpdate) -> usize {
        trace!(event_id = %update.event_id, "publishing decryption update");
        self.log.record(&update);
        self.tx.send(update).unwrap_or(0)
    }
}

impl Default for DecryptionBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Try once to decrypt `event`, record the outcome on it and publish it.
///
/// Returns `None` without calling the decryptor if the event is not pending.
pub async fn decrypt_event(
    decryptor: &dyn Decryptor,
    event: &mut Event,
    bus: &DecryptionBus,
) -> Option<DecryptionUpdate> {
    if !event.is_pending_decryption() {
        return None;
    }

    let update = match decryptor.attempt_decryption(event).await {
        Ok(payload) => DecryptionUpdate::decrypted(event.event_id.clone(), payload),
        Err(err) => {
            debug!(event_id = %event.event_id, error = %err, "decryption failed");
            DecryptionUpdate::failed(event.event_id.clone(), err.to_string())
        }
    };
    event.set_decryption(update.status());
    bus.publish(update.clone());
    Some(update)
}
