//! CLI Integration Tests
//!
//! These tests run the `publicrooms` binary against a temporary redb store
//! and check the wiring between the CLI and the core library.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command backed by a store inside `data_dir`
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("publicrooms").expect("Failed to find publicrooms binary");
    cmd.arg("--database").arg(data_dir.path().join("rooms.redb"));
    cmd
}

/// Write a JSON file into `data_dir` and return its path
fn write_json(data_dir: &TempDir, name: &str, json: &str) -> PathBuf {
    let path = data_dir.path().join(name);
    std::fs::write(&path, json).unwrap();
    path
}

const EVENTS: &str = r#"[
    {"room_id": "!rust:example.org", "token": 1, "content": {"type": "visibility", "visible": true}},
    {"room_id": "!rust:example.org", "token": 2, "content": {"type": "name", "name": "Rustaceans"}},
    {"room_id": "!rust:example.org", "token": 3, "content": {"type": "membership", "user_id": "@a:example.org", "membership": "join"}},
    {"room_id": "!rust:example.org", "token": 4, "content": {"type": "membership", "user_id": "@b:example.org", "membership": "join"}},
    {"room_id": "!go:example.org", "token": 1, "content": {"type": "visibility", "visible": true}},
    {"room_id": "!go:example.org", "token": 2, "content": {"type": "name", "name": "Gophers"}}
]"#;

fn seed(data_dir: &TempDir) {
    let events = write_json(data_dir, "events.json", EVENTS);
    cli_cmd(data_dir).arg("apply").arg(&events).assert().success();
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Public Rooms Directory"))
        .stdout(predicate::str::contains("Published rooms: 0"));
}

#[test]
fn test_info_reads_config_file() {
    let data_dir = TempDir::new().unwrap();
    let config = write_json(&data_dir, "config.json", r#"{"server_name": "a.example"}"#);

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Server name: a.example"));
}

#[test]
fn test_server_name_flag_overrides_config() {
    let data_dir = TempDir::new().unwrap();
    let config = write_json(&data_dir, "config.json", r#"{"server_name": "a.example"}"#);

    cli_cmd(&data_dir)
        .args(["--server-name", "b.example", "--config"])
        .arg(&config)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Server name: b.example"));
}

#[test]
fn test_postgres_database_is_rejected() {
    let data_dir = TempDir::new().unwrap();

    Command::cargo_bin("publicrooms")
        .unwrap()
        .args(["--database", "postgres://dendrite@localhost/rooms", "info"])
        .current_dir(data_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

// ============================================================================
// Visibility Command Tests
// ============================================================================

#[test]
fn test_visibility_unknown_room_is_private() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["visibility", "get", "!nobody:example.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("private"));
}

#[test]
fn test_visibility_set_and_get() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["visibility", "set", "!abc:example.org", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is now public"));

    cli_cmd(&data_dir)
        .args(["visibility", "get", "!abc:example.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("public"));

    cli_cmd(&data_dir)
        .arg("count")
        .assert()
        .success()
        .stdout(predicate::str::diff("1\n"));

    cli_cmd(&data_dir)
        .args(["visibility", "set", "!abc:example.org", "false"])
        .assert()
        .success();

    cli_cmd(&data_dir)
        .arg("count")
        .assert()
        .success()
        .stdout(predicate::str::diff("0\n"));
}

#[test]
fn test_invalid_room_id() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["visibility", "get", "#alias:example.org"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid room ID"));
}

// ============================================================================
// Apply / List Command Tests
// ============================================================================

#[test]
fn test_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No published rooms."));
}

#[test]
fn test_apply_then_list() {
    let data_dir = TempDir::new().unwrap();
    seed(&data_dir);

    let output = cli_cmd(&data_dir).arg("list").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<_> = stdout.lines().collect();

    // Members descending puts the busier room first
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("!rust:example.org  2 member(s)  Rustaceans"));
    assert!(lines[1].starts_with("!go:example.org  0 member(s)  Gophers"));
}

#[test]
fn test_list_filter_and_pagination() {
    let data_dir = TempDir::new().unwrap();
    seed(&data_dir);

    cli_cmd(&data_dir)
        .args(["list", "--filter", "GOPH"])
        .assert()
        .success()
        .stdout(predicate::str::contains("!go:example.org"))
        .stdout(predicate::str::contains("!rust:example.org").not());

    cli_cmd(&data_dir)
        .args(["list", "--offset", "1", "--limit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("!go:example.org"))
        .stdout(predicate::str::contains("!rust:example.org").not());

    cli_cmd(&data_dir)
        .args(["count", "--filter", "rust"])
        .assert()
        .success()
        .stdout(predicate::str::diff("1\n"));
}

#[test]
fn test_list_json() {
    let data_dir = TempDir::new().unwrap();
    seed(&data_dir);

    let output = cli_cmd(&data_dir).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());

    let rooms: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rooms = rooms.as_array().unwrap();
    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms[0]["room_id"], "!rust:example.org");
    assert_eq!(rooms[0]["num_joined_members"], 2);
}

#[test]
fn test_apply_with_retractions() {
    let data_dir = TempDir::new().unwrap();
    seed(&data_dir);

    let remove = write_json(
        &data_dir,
        "remove.json",
        r#"[{"room_id": "!rust:example.org", "token": 4, "content": {"type": "membership", "user_id": "@b:example.org", "membership": "join"}}]"#,
    );
    let empty = write_json(&data_dir, "empty.json", "[]");

    cli_cmd(&data_dir)
        .arg("apply")
        .arg(&empty)
        .arg("--remove")
        .arg(&remove)
        .assert()
        .success()
        .stdout(predicate::str::contains("retracted 1 event(s)"));

    cli_cmd(&data_dir)
        .args(["show", "!rust:example.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"num_joined_members\": 1"));
}

#[test]
fn test_apply_rejects_malformed_events() {
    let data_dir = TempDir::new().unwrap();
    let events = write_json(&data_dir, "bad.json", r#"[{"room_id": "nope", "token": 1}]"#);

    cli_cmd(&data_dir)
        .arg("apply")
        .arg(&events)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid events"));
}

// ============================================================================
// Show Command Tests
// ============================================================================

#[test]
fn test_show_room() {
    let data_dir = TempDir::new().unwrap();
    seed(&data_dir);

    cli_cmd(&data_dir)
        .args(["show", "!go:example.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"Gophers\""))
        .stdout(predicate::str::contains("\"visible\": true"));
}

#[test]
fn test_show_unknown_room() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["show", "!missing:example.org"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Room not found"));
}

// ============================================================================
// Serve Command Tests
// ============================================================================

#[test]
fn test_serve_rejects_bad_bootstrap() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["serve", "--bootstrap", "not-hex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid hex format"));
}
