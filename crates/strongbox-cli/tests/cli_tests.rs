use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn strongbox(key: &str, key_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("strongbox").unwrap();
    cmd.env_clear()
        .env("STRONGBOX_ENCRYPTION_KEY", key)
        .env("STRONGBOX_KEY_DIR", key_dir)
        .env("STRONGBOX_LOCK_TIMEOUT_MS", "2000");
    cmd
}

fn fresh_key() -> String {
    let mut cmd = assert_cmd::Command::cargo_bin("strongbox").unwrap();
    let out = cmd.arg("generate-key").assert().success().get_output().stdout.clone();
    String::from_utf8(out).unwrap().trim().to_string()
}

#[test]
fn generate_key_prints_base64_32_bytes() {
    let key = fresh_key();
    assert_eq!(key.len(), 44);
    assert!(key.ends_with('='));
}

#[test]
fn put_then_get_uses_pq_envelope() {
    let dir = tempdir().unwrap();
    let key = fresh_key();
    let state = dir.path().join("state");

    strongbox(&key, &dir.path().join("keys"))
        .arg("put")
        .arg(&state)
        .arg(r#"{"a":1}"#)
        .assert()
        .success()
        .stdout(predicate::str::contains("state.pqenc"));
    assert!(dir.path().join("state.pqenc").exists());
    assert!(!state.exists());

    strongbox(&key, &dir.path().join("keys"))
        .arg("get")
        .arg(&state)
        .assert()
        .success()
        .stdout(r#"{"a":1}"#);
}

#[test]
fn get_with_wrong_key_fails() {
    let dir = tempdir().unwrap();
    let state = dir.path().join("state");
    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("--no-pq")
        .arg("put")
        .arg(&state)
        .arg("secret")
        .assert()
        .success();

    strongbox(&fresh_key(), &dir.path().join("other-keys"))
        .arg("--no-pq")
        .arg("get")
        .arg(&state)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Authentication failed"));
}

#[test]
fn missing_state_is_not_an_error() {
    let dir = tempdir().unwrap();
    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("--no-pq")
        .arg("get")
        .arg(dir.path().join("nothing"))
        .assert()
        .success()
        .stdout("")
        .stderr(predicate::str::contains("no saved state"));
}

#[test]
fn status_reports_key_source() {
    let dir = tempdir().unwrap();
    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"key_source\": \"environment\""))
        .stdout(predicate::str::contains("ML-KEM-768"));
}

#[test]
fn read_only_refuses_writes() {
    let dir = tempdir().unwrap();
    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("--read-only")
        .arg("put")
        .arg(dir.path().join("state"))
        .arg("x")
        .assert()
        .failure()
        .stderr(predicate::str::contains("read-only"));
}

#[test]
fn force_unlock_clears_abandoned_lock() {
    let dir = tempdir().unwrap();
    let state = dir.path().join("state");
    let record = serde_json::json!({
        "pid": 4_000_000u32,
        "lockId": "abandoned",
        "timestamp": 0,
        "hostname": "elsewhere",
    });
    fs::write(dir.path().join("state.lock"), record.to_string()).unwrap();

    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("lock-status")
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stale\": true"));

    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("force-unlock")
        .arg(&state)
        .assert()
        .success()
        .stdout("true\n");
    assert!(!dir.path().join("state.lock").exists());
}

#[test]
fn reset_requires_confirmation() {
    let dir = tempdir().unwrap();
    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("reset-pq-keys")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn audit_log_records_chain() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("audit.jsonl");
    strongbox(&fresh_key(), &dir.path().join("keys"))
        .arg("--audit-log")
        .arg(&log)
        .arg("status")
        .assert()
        .success();
    let text = fs::read_to_string(&log).unwrap();
    assert!(text.contains("pq_keys_generated"));
    assert!(text.contains("encryption_init"));
    assert!(text.contains("CHAIN_START"));
}
