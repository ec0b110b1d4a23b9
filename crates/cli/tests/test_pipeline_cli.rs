use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn write_description(dir: &TempDir, text: &str) -> PathBuf {
    let p = dir.path().join("description.txt");
    fs::write(&p, text).unwrap();
    p
}

fn write_comments(dir: &TempDir, comments: &[&str]) -> PathBuf {
    let p = dir.path().join("comments.json");
    fs::write(&p, serde_json::to_string(comments).unwrap()).unwrap();
    p
}

fn bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("escalatesafe-control")
}

#[test]
fn create_run_redacts_and_leaves_run_ready_for_review() {
    let repo = TempDir::new().unwrap();
    let description = write_description(
        &repo,
        "Customer jane.doe@example.com can't log in, phone +1-555-123-4567.",
    );
    let state_file = repo.path().join("run_state.json");
    let audit_log = repo.path().join("runtime").join("logs").join("audit.jsonl");

    let output = Command::new(bin())
        .args([
            "create-run",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--tenant-id",
            "acme",
            "--ticket-id",
            "42",
            "--description",
            description.to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"leak_check_passed\":true"))
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).unwrap();
    assert!(stdout.contains("\"status\":\"ReadyForReview\""));

    let state: serde_json::Value = serde_json::from_slice(&fs::read(&state_file).unwrap()).unwrap();
    assert_eq!(state["run"]["status"], "ready_for_review");
    assert!(state["redacted_text"].as_str().unwrap().contains("EMAIL_REDACTED"));
    assert!(!state["redacted_text"].as_str().unwrap().contains("jane.doe"));
}

#[test]
fn internal_notes_without_tenant_allowance_rejects_before_creating_a_run() {
    let repo = TempDir::new().unwrap();
    let description = write_description(&repo, "Nothing sensitive here.");
    let state_file = repo.path().join("run_state.json");
    let audit_log = repo.path().join("runtime").join("logs").join("audit.jsonl");

    Command::new(bin())
        .args([
            "create-run",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--tenant-id",
            "acme",
            "--ticket-id",
            "7",
            "--description",
            description.to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
            "--include-internal-notes",
            "true",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("internal notes"));

    assert!(!state_file.exists());
}

#[test]
fn approve_exports_then_is_idempotent_on_second_call() {
    let repo = TempDir::new().unwrap();
    let description = write_description(&repo, "Customer report, nothing sensitive.");
    let comments = write_comments(&repo, &["Follow-up: still broken for them."]);
    let state_file = repo.path().join("run_state.json");
    let audit_log = repo.path().join("runtime").join("logs").join("audit.jsonl");

    Command::new(bin())
        .args([
            "create-run",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--tenant-id",
            "acme",
            "--ticket-id",
            "99",
            "--description",
            description.to_str().unwrap(),
            "--comments",
            comments.to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success();

    let first = Command::new(bin())
        .args([
            "approve",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"Exported\""))
        .get_output()
        .stdout
        .clone();
    let first = String::from_utf8(first).unwrap();
    let marker = "\"downstream_key\":\"";
    let start = first.find(marker).unwrap() + marker.len();
    let end = first[start..].find('"').unwrap() + start;
    let first_key = first[start..end].to_string();

    let second = Command::new(bin())
        .args([
            "approve",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("\"downstream_key\":\"{first_key}\"")))
        .get_output()
        .stdout
        .clone();
    let _ = String::from_utf8(second).unwrap();
}

#[test]
fn cancel_transitions_a_ready_run_to_cancelled() {
    let repo = TempDir::new().unwrap();
    let description = write_description(&repo, "Routine question about billing.");
    let state_file = repo.path().join("run_state.json");
    let audit_log = repo.path().join("runtime").join("logs").join("audit.jsonl");

    Command::new(bin())
        .args([
            "create-run",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--tenant-id",
            "acme",
            "--ticket-id",
            "5",
            "--description",
            description.to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success();

    Command::new(bin())
        .args([
            "cancel",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"Cancelled\""));
}

#[test]
fn verify_audit_replays_the_hash_chain_after_a_full_run() {
    let repo = TempDir::new().unwrap();
    let description = write_description(&repo, "Account locked out, no PII here.");
    let state_file = repo.path().join("run_state.json");
    let audit_log = repo.path().join("runtime").join("logs").join("audit.jsonl");

    Command::new(bin())
        .args([
            "create-run",
            "--repo-root",
            repo.path().to_str().unwrap(),
            "--tenant-id",
            "acme",
            "--ticket-id",
            "11",
            "--description",
            description.to_str().unwrap(),
            "--state-file",
            state_file.to_str().unwrap(),
            "--audit-log",
            audit_log.to_str().unwrap(),
        ])
        .assert()
        .success();

    Command::new(bin())
        .args(["verify-audit", "--audit-log", audit_log.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("sha256:"));
}
