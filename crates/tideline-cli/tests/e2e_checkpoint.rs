//! E2E flow: replay deltas into a checkpoint, inspect it, window over it.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ROOM: &str = "!a:tideline.test";

fn tide_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tide"));
    cmd.current_dir(dir);
    cmd.env("TIDELINE_LOG", "error");
    cmd.env_remove("FORMAT");
    cmd
}

fn message(id: &str, ts: u64) -> Value {
    json!({
        "type": "m.room.message",
        "event_id": id,
        "sender": "@alice:tideline.test",
        "origin_server_ts": ts,
        "content": { "msgtype": "m.text", "body": format!("message {id}") }
    })
}

fn write_deltas(dir: &Path, deltas: &[Value]) -> PathBuf {
    let path = dir.join("deltas.jsonl");
    let lines: Vec<String> = deltas.iter().map(Value::to_string).collect();
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn two_deltas() -> Vec<Value> {
    vec![
        json!({
            "next_batch": "s1",
            "rooms": { "join": { ROOM: {
                "state": { "events": [{
                    "type": "m.room.create", "state_key": "", "event_id": "$create",
                    "sender": "@alice:tideline.test", "content": {}
                }]},
                "timeline": {
                    "events": [message("$1", 1), message("$2", 2), message("$3", 3)],
                    "prev_batch": "p0"
                }
            }}}
        }),
        json!({
            "next_batch": "s2",
            "rooms": { "join": { ROOM: {
                "timeline": { "events": [message("$4", 4), message("$5", 5)] },
                "ephemeral": { "events": [{
                    "type": "m.receipt",
                    "content": { "$5": { "m.read": { "@bob:tideline.test": { "ts": 10 } } } }
                }]}
            }}}
        }),
    ]
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("tide should not crash");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON")
}

fn replay_to_checkpoint(dir: &Path) -> PathBuf {
    let deltas = write_deltas(dir, &two_deltas());
    let checkpoint = dir.join("state.json");
    tide_cmd(dir)
        .arg("replay")
        .arg(&deltas)
        .arg("--checkpoint")
        .arg(&checkpoint)
        .assert()
        .success();
    checkpoint
}

#[test]
fn replay_writes_checkpoint() {
    let dir = TempDir::new().unwrap();
    let deltas = write_deltas(dir.path(), &two_deltas());
    let checkpoint = dir.path().join("state.json");

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("replay")
            .arg(&deltas)
            .arg("--checkpoint")
            .arg(&checkpoint)
            .args(["--format", "json"]),
    );
    assert_eq!(out["deltas"], 2);
    assert_eq!(out["joined_rooms"], 1);
    assert_eq!(out["next_batch"], "s2");
    assert!(out["rejected"].as_array().unwrap().is_empty());

    let state: Value = serde_json::from_str(&fs::read_to_string(&checkpoint).unwrap()).unwrap();
    assert_eq!(state["next_batch"], "s2");
    let timeline = state["rooms"]["join"][ROOM]["timeline"]["events"]
        .as_array()
        .unwrap();
    assert_eq!(timeline.len(), 5);
    assert_eq!(state["rooms"]["join"][ROOM]["timeline"]["prev_batch"], "p0");
}

#[test]
fn replay_continues_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());
    let more = dir.path().join("more.jsonl");
    fs::write(
        &more,
        json!({
            "next_batch": "s3",
            "rooms": { "join": { ROOM: { "timeline": { "events": [message("$6", 6)] } } } }
        })
        .to_string(),
    )
    .unwrap();

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("replay")
            .arg(&more)
            .arg("--from")
            .arg(&checkpoint)
            .args(["--format", "json"]),
    );
    assert_eq!(out["deltas"], 1);
    assert_eq!(out["next_batch"], "s3");
}

#[test]
fn malformed_room_is_reported_and_siblings_apply() {
    let dir = TempDir::new().unwrap();
    let deltas = write_deltas(
        dir.path(),
        &[json!({
            "next_batch": "s1",
            "rooms": { "join": {
                ROOM: { "timeline": { "events": [message("$1", 1)] } },
                "!bad:tideline.test": { "timeline": { "events": [{ "type": "m.room.message", "content": {} }] } }
            }}
        })],
    );

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("replay")
            .arg(&deltas)
            .args(["--format", "json"]),
    );
    assert_eq!(out["joined_rooms"], 1);
    let rejected = out["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["room_id"], "!bad:tideline.test");
    assert_eq!(rejected[0]["membership"], "join");
}

#[test]
fn delta_without_next_batch_fails_with_code() {
    let dir = TempDir::new().unwrap();
    let deltas = write_deltas(dir.path(), &[json!({ "next_batch": "", "rooms": {} })]);

    tide_cmd(dir.path())
        .arg("replay")
        .arg(&deltas)
        .args(["--format", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2001"));
}

#[test]
fn inspect_lists_rooms_and_details() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("inspect")
            .arg(&checkpoint)
            .args(["--format", "json"]),
    );
    let rooms = out["rooms"].as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["room_id"], ROOM);
    assert_eq!(rooms[0]["timeline_events"], 5);

    let detail = json_stdout(
        tide_cmd(dir.path())
            .arg("inspect")
            .arg(&checkpoint)
            .args(["--room", ROOM, "--format", "json"]),
    );
    assert_eq!(detail["prev_batch"], "p0");
    assert_eq!(detail["timeline"][0]["event_id"], "$1");
    assert_eq!(detail["timeline"][0]["token"], "p0");
    assert!(detail["receipts"].as_u64().unwrap() >= 1);
}

#[test]
fn inspect_unknown_room_fails() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());

    tide_cmd(dir.path())
        .arg("inspect")
        .arg(&checkpoint)
        .args(["--room", "!nope:tideline.test", "--format", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E3001"));
}

#[test]
fn inspect_rejects_garbage_checkpoint() {
    let dir = TempDir::new().unwrap();
    let checkpoint = dir.path().join("state.json");
    fs::write(&checkpoint, "not json").unwrap();

    tide_cmd(dir.path())
        .arg("inspect")
        .arg(&checkpoint)
        .assert()
        .failure()
        .stderr(predicate::str::contains("E1003"));
}

#[test]
fn window_at_live_edge_shows_newest_events() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("window")
            .arg(&checkpoint)
            .args(["--room", ROOM, "--size", "2", "--format", "json"]),
    );
    let ids: Vec<&str> = out["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["$4", "$5"]);
    assert_eq!(out["more_before"], true);
    assert_eq!(out["more_after"], false);
}

#[test]
fn window_stops_at_checkpoint_edge() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("window")
            .arg(&checkpoint)
            .args(["--room", ROOM, "--size", "50", "--format", "json"]),
    );
    assert_eq!(out["events"].as_array().unwrap().len(), 5);
    // The checkpoint still records a token before $1.
    assert_eq!(out["more_before"], true);
}

#[test]
fn window_around_event_centers_on_it() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());

    let out = json_stdout(
        tide_cmd(dir.path())
            .arg("window")
            .arg(&checkpoint)
            .args(["--room", ROOM, "--around", "$3", "--size", "3", "--format", "json"]),
    );
    assert_eq!(out["anchor"], "$3");
    let ids: Vec<&str> = out["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"$3"));
    assert_eq!(ids.len(), 3);
}

#[test]
fn window_around_unknown_event_fails() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());

    tide_cmd(dir.path())
        .arg("window")
        .arg(&checkpoint)
        .args(["--room", ROOM, "--around", "$missing", "--format", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E3002"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let checkpoint = replay_to_checkpoint(dir.path());
    let config = dir.path().join("config.toml");
    fs::write(&config, "[accumulator]\nmax_timeline_entries = 0\n").unwrap();

    tide_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("inspect")
        .arg(&checkpoint)
        .assert()
        .failure()
        .stderr(predicate::str::contains("E1001"));
}

#[test]
fn config_limits_retained_timeline() {
    let dir = TempDir::new().unwrap();
    let deltas = write_deltas(dir.path(), &two_deltas());
    let checkpoint = dir.path().join("state.json");
    let config = dir.path().join("config.toml");
    fs::write(&config, "[accumulator]\nmax_timeline_entries = 2\n").unwrap();

    tide_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("replay")
        .arg(&deltas)
        .arg("--checkpoint")
        .arg(&checkpoint)
        .assert()
        .success();

    let state: Value = serde_json::from_str(&fs::read_to_string(&checkpoint).unwrap()).unwrap();
    let timeline = state["rooms"]["join"][ROOM]["timeline"]["events"]
        .as_array()
        .unwrap();
    assert_eq!(timeline.len(), 2);
}
