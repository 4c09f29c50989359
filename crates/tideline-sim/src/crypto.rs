//! Stand-in decryptor. Encrypted sim events carry their plaintext next to
//! the ciphertext; only the session id decides whether it is readable.

use async_trait::async_trait;
use tideline_core::crypto::{DecryptionError, Decryptor};
use tideline_core::event::{DecryptedPayload, Event};

pub const SHARED_SESSION: &str = "sim-shared";
pub const LOST_SESSION: &str = "sim-lost";

#[derive(Debug, Default, Clone, Copy)]
pub struct SimDecryptor;

#[async_trait]
impl Decryptor for SimDecryptor {
    async fn attempt_decryption(&self, event: &Event) -> Result<DecryptedPayload, DecryptionError> {
        let session = event
            .content
            .get("session_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if session != SHARED_SESSION {
            return Err(DecryptionError::MissingKey {
                session_id: session.to_string(),
            });
        }

        let plaintext = event
            .content
            .get("sim_plaintext")
            .ok_or_else(|| DecryptionError::Malformed("no plaintext".into()))?;
        let event_type = plaintext
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DecryptionError::Malformed("plaintext without type".into()))?;
        Ok(DecryptedPayload {
            event_type: event_type.to_string(),
            content: plaintext.get("content").cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideline_core::sync::wire::RawEvent;

    fn encrypted(session: &str) -> Event {
        let raw = RawEvent {
            event_id: Some("$e".into()),
            ..RawEvent::new(
                "m.room.encrypted",
                json!({
                    "session_id": session,
                    "sim_plaintext": { "type": "m.room.message", "content": { "body": "hi" } }
                }),
            )
        };
        Event::from_raw("!r:hs", &raw).unwrap()
    }

    #[tokio::test]
    async fn shared_session_decrypts() {
        let payload = SimDecryptor
            .attempt_decryption(&encrypted(SHARED_SESSION))
            .await
            .unwrap();
        assert_eq!(payload.event_type, "m.room.message");
        assert_eq!(payload.content["body"], "hi");
    }

    #[tokio::test]
    async fn lost_session_fails() {
        let err = SimDecryptor
            .attempt_decryption(&encrypted(LOST_SESSION))
            .await
            .unwrap_err();
        assert!(matches!(err, DecryptionError::MissingKey { .. }));
    }
}
