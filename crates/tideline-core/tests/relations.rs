use serde_json::{Value, json};
use tideline_core::crypto::DecryptionUpdate;
use tideline_core::event::{DecryptedPayload, Event, RelationType};
use tideline_core::relations::RelationsCollection;
use tideline_core::sync::wire::RawEvent;

fn event(id: &str, event_type: &str, content: Value) -> Event {
    let raw = RawEvent {
        event_id: Some(id.into()),
        sender: Some("@alice:hs".into()),
        origin_server_ts: Some(1),
        ..RawEvent::new(event_type, content)
    };
    Event::from_raw("!room:hs", &raw).unwrap()
}

fn target(id: &str) -> Event {
    event(id, "m.room.message", json!({ "body": "hello" }))
}

fn encrypted_target(id: &str) -> Event {
    event(id, "m.room.encrypted", json!({ "ciphertext": "AAAA" }))
}

fn reaction(id: &str, target: &str, key: &str) -> Event {
    event(
        id,
        "m.reaction",
        json!({ "m.relates_to": { "rel_type": "m.annotation", "event_id": target, "key": key } }),
    )
}

fn annotations(rels: &RelationsCollection, target: &str) -> Option<Vec<String>> {
    rels.get_relations_for_event(target, &RelationType::Annotation, Some("m.reaction"))
        .map(|set| set.events().iter().map(|e| e.event_id.clone()).collect())
}

#[test]
fn same_event_twice_is_counted_once() {
    let mut rels = RelationsCollection::new();
    rels.add_event(&target("$t"));

    let first = reaction("$r", "$t", "👍");
    let second = reaction("$r", "$t", "👍");
    rels.add_event(&first);
    rels.add_event(&first);
    rels.add_event(&second);

    let set = rels
        .get_relations_for_event("$t", &RelationType::Annotation, None)
        .unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.annotations()[0].count, 1);
}

#[test]
fn relation_waits_for_pending_target() {
    let mut rels = RelationsCollection::new();
    rels.add_event(&encrypted_target("$t"));
    rels.add_event(&reaction("$r", "$t", "🎉"));

    assert_eq!(annotations(&rels, "$t"), None);
    assert_eq!(rels.deferred_count(), 1);

    rels.on_decryption_completed(&DecryptionUpdate::decrypted(
        "$t",
        DecryptedPayload {
            event_type: "m.room.message".into(),
            content: json!({ "body": "secret" }),
        },
    ));

    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r".to_string()]));
    assert_eq!(rels.deferred_count(), 0);
}

#[test]
fn repeated_decryption_signal_is_harmless() {
    let mut rels = RelationsCollection::new();
    rels.add_event(&encrypted_target("$t"));
    rels.add_event(&reaction("$r", "$t", "🎉"));

    let update = DecryptionUpdate::decrypted(
        "$t",
        DecryptedPayload {
            event_type: "m.room.message".into(),
            content: json!({}),
        },
    );
    rels.on_decryption_completed(&update);
    rels.on_decryption_completed(&update);
    rels.on_decryption_completed(&DecryptionUpdate::failed("$t", "late failure"));

    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r".to_string()]));
}

#[test]
fn undecryptable_relation_is_never_aggregated() {
    let mut rels = RelationsCollection::new();
    rels.add_event(&target("$t"));
    let encrypted_reply = event(
        "$reply",
        "m.room.encrypted",
        json!({
            "ciphertext": "AAAA",
            "m.relates_to": { "m.in_reply_to": { "event_id": "$t" } }
        }),
    );
    rels.add_event(&encrypted_reply);
    assert_eq!(rels.deferred_count(), 1);

    rels.on_decryption_completed(&DecryptionUpdate::failed("$reply", "unknown session"));

    assert_eq!(rels.deferred_count(), 0);
    assert!(
        rels.get_relations_for_event("$t", &RelationType::Reply, None)
            .is_none()
    );
}

#[test]
fn failed_target_still_releases_readable_relations() {
    let mut rels = RelationsCollection::new();
    rels.add_event(&encrypted_target("$t"));
    rels.add_event(&reaction("$r", "$t", "👀"));

    rels.on_decryption_completed(&DecryptionUpdate::failed("$t", "withheld"));
    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r".to_string()]));
}

#[test]
fn redaction_removes_relation() {
    let mut rels = RelationsCollection::new();
    rels.add_event(&target("$t"));
    rels.add_event(&reaction("$r1", "$t", "👍"));
    rels.add_event(&reaction("$r2", "$t", "👍"));

    let redaction = RawEvent {
        event_id: Some("$red".into()),
        sender: Some("@alice:hs".into()),
        redacts: Some("$r1".into()),
        ..RawEvent::new("m.room.redaction", json!({}))
    };
    rels.add_event(&Event::from_raw("!room:hs", &redaction).unwrap());

    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r2".to_string()]));

    // Redacted before we ever saw it: stays out.
    let redaction = RawEvent {
        event_id: Some("$red2".into()),
        redacts: Some("$r3".into()),
        ..RawEvent::new("m.room.redaction", json!({}))
    };
    rels.add_event(&Event::from_raw("!room:hs", &redaction).unwrap());
    rels.add_event(&reaction("$r3", "$t", "🎉"));
    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r2".to_string()]));
}

#[test]
fn relation_seen_before_its_pending_target_is_withheld() {
    // Backward pagination: the newer reaction arrives first.
    let mut rels = RelationsCollection::new();
    rels.add_event(&reaction("$r", "$t", "👀"));
    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r".to_string()]));

    rels.add_event(&encrypted_target("$t"));
    assert_eq!(annotations(&rels, "$t"), None);
    assert_eq!(rels.deferred_count(), 1);

    rels.on_decryption_completed(&DecryptionUpdate::failed("$t", "withheld"));
    assert_eq!(annotations(&rels, "$t"), Some(vec!["$r".to_string()]));
    assert_eq!(rels.deferred_count(), 0);
}
