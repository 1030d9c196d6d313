use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::json;
use tempfile::{TempDir, tempdir};

fn write_feed(dir: &Path, name: &str, lines: &[serde_json::Value]) -> PathBuf {
    let path = dir.join(name);
    let body: Vec<String> = lines.iter().map(ToString::to_string).collect();
    fs::write(&path, body.join("\n")).unwrap();
    path
}

fn write_request(file: &str) -> serde_json::Value {
    json!({
        "type": "permission_request",
        "tool_name": "Write",
        "tool_input": {"file_path": file},
    })
}

fn question_request() -> serde_json::Value {
    json!({
        "type": "permission_request",
        "tool_name": "AskUserQuestion",
        "tool_input": {"questions": [{
            "question": "Which database?",
            "options": [
                {"label": "Postgres", "description": "relational"},
                {"label": "SQLite"},
            ],
        }]},
    })
}

fn conversation_feed(dir: &TempDir) -> PathBuf {
    write_feed(
        dir.path(),
        "conversation.jsonl",
        &[
            json!({"type": "text_delta", "text": "Hello "}),
            json!({"type": "text_delta", "text": "world"}),
            json!({
                "type": "tool_invocation",
                "id": "1",
                "name": "Task",
                "input": {"description": "Dig", "subagent_type": "explorer"},
            }),
            json!({"type": "text_delta", "scope": "1", "text": "nested thoughts"}),
            json!({"type": "tool_result", "id": "1", "content": "found it"}),
            write_request("notes.txt"),
            json!({
                "type": "tool_invocation",
                "id": "2",
                "name": "Write",
                "input": {"file_path": "notes.txt"},
            }),
            json!({"type": "tool_result", "id": "2", "content": "ok"}),
            json!({"type": "text_delta", "text": "All done"}),
            json!({"type": "response_complete", "session_id": "s1"}),
        ],
    )
}

#[test]
fn test_replay_routes_root_text_to_stdout() {
    let dir = tempdir().unwrap();
    let feed = conversation_feed(&dir);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "allow"])
        .arg(&feed)
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello world"))
        .stdout(predicate::str::contains("All done"))
        .stdout(predicate::str::contains("nested thoughts").not())
        .stderr(predicate::str::contains("Task: Dig (explorer)"))
        .stderr(predicate::str::contains("nested thoughts"))
        .stderr(predicate::str::contains("Allow Write: notes.txt?"));
}

#[test]
fn test_replay_deny_reports_denial() {
    let dir = tempdir().unwrap();
    let feed = write_feed(dir.path(), "deny.jsonl", &[write_request("a.txt")]);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "deny"])
        .arg(&feed)
        .assert()
        .success()
        .stderr(predicate::str::contains("User denied permission"));
}

#[test]
fn test_replay_allow_all_prompts_once() {
    let dir = tempdir().unwrap();
    let feed = write_feed(
        dir.path(),
        "edits.jsonl",
        &[write_request("a.txt"), write_request("b.txt")],
    );

    let output = cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "allow-all"])
        .arg(&feed)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert_eq!(stderr.matches("? Allow Write").count(), 1);
    assert!(!stderr.contains("User denied permission"));
}

#[test]
fn test_replay_each_feed_gets_a_fresh_policy() {
    let dir = tempdir().unwrap();
    let first = write_feed(dir.path(), "first.jsonl", &[write_request("a.txt")]);
    let second = write_feed(dir.path(), "second.jsonl", &[write_request("b.txt")]);

    let output = cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "allow-all"])
        .arg(&first)
        .arg(&second)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert_eq!(stderr.matches("? Allow Write").count(), 2);
}

#[test]
fn test_replay_ask_reads_stdin() {
    let dir = tempdir().unwrap();
    let feed = write_feed(dir.path(), "ask.jsonl", &[write_request("a.txt")]);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "ask"])
        .arg(&feed)
        .write_stdin("2\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("Yes, this time only"))
        .stderr(predicate::str::contains("User denied permission").not());
}

#[test]
fn test_replay_ask_denies_at_end_of_input() {
    let dir = tempdir().unwrap();
    let feed = write_feed(dir.path(), "ask.jsonl", &[write_request("a.txt")]);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "ask"])
        .arg(&feed)
        .write_stdin("")
        .assert()
        .success()
        .stderr(predicate::str::contains("User denied permission"));
}

#[test]
fn test_replay_questions_are_answered_not_approved() {
    let dir = tempdir().unwrap();
    let feed = write_feed(dir.path(), "question.jsonl", &[question_request()]);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "allow"])
        .arg(&feed)
        .assert()
        .success()
        .stderr(predicate::str::contains("? [1/1] Which database?"))
        .stderr(predicate::str::contains("1) Postgres - relational"))
        .stderr(predicate::str::contains("→ Which database? Postgres"))
        .stderr(predicate::str::contains("Allow AskUserQuestion").not());
}

#[test]
fn test_replay_ask_answers_question_from_stdin() {
    let dir = tempdir().unwrap();
    let feed = write_feed(dir.path(), "question.jsonl", &[question_request()]);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "ask"])
        .arg(&feed)
        .write_stdin("\n2\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("pick 1-2 or type an answer"))
        .stderr(predicate::str::contains("→ Which database? SQLite"));
}

#[test]
fn test_replay_deny_cancels_questions() {
    let dir = tempdir().unwrap();
    let feed = write_feed(dir.path(), "question.jsonl", &[question_request()]);

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "deny"])
        .arg(&feed)
        .assert()
        .success()
        .stderr(predicate::str::contains("User cancelled questions"));
}

#[test]
fn test_replay_skips_malformed_lines() {
    let dir = tempdir().unwrap();
    let feed = dir.path().join("broken.jsonl");
    fs::write(
        &feed,
        "{not json\n{\"type\":\"mystery\"}\n{\"type\":\"text_delta\",\"text\":\"still here\"}\n",
    )
    .unwrap();

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "deny"])
        .arg(&feed)
        .assert()
        .success()
        .stdout(predicate::str::contains("still here"));
}

#[test]
fn test_replay_missing_feed_fails() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("tollgate")
        .env("TOLLGATE_HOME", dir.path())
        .args(["replay", "--decision", "deny"])
        .arg(dir.path().join("missing.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read feed"));
}
