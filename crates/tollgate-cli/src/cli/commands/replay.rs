//! Replay command handler.
//!
//! Each feed file is replayed in a fresh connection, as if the agent session
//! were resumed. Lines are agent events, or permission requests that the
//! driver sends through the gate and waits on before reading further.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tollgate_core::config::Config;
use tollgate_core::core::permission::PermissionVerdict;
use tollgate_core::core::queues::ObservabilityQueues;
use tollgate_core::core::session::ConnectionManager;
use tracing::{info, warn};

use crate::prompt::{ResolverMode, TerminalPrompts, spawn_resolver};
use crate::render::TerminalRenderer;

/// A feed line asking for permission on behalf of the agent.
#[derive(Debug, Deserialize)]
struct PermissionLine {
    tool_name: String,
    #[serde(default)]
    tool_input: Value,
}

enum FeedLine {
    Event(Value),
    Permission(PermissionLine),
}

fn parse_line(line: &str) -> Result<Option<FeedLine>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line).context("invalid JSON")?;
    if value.get("type").and_then(Value::as_str) == Some("permission_request") {
        let request = serde_json::from_value(value).context("invalid permission request")?;
        return Ok(Some(FeedLine::Permission(request)));
    }
    Ok(Some(FeedLine::Event(value)))
}

pub async fn run(feeds: &[PathBuf], mode: ResolverMode, config: Config) -> Result<()> {
    let queues = ObservabilityQueues::new();
    let (prompts, questions) = TerminalPrompts::new();
    let resolver = spawn_resolver(mode, queues.subscribe_pending(), questions);
    let mut manager = ConnectionManager::new(config, queues);
    let prompts = Arc::new(prompts);

    let mut result = Ok(());
    for feed in feeds {
        if let Err(err) = replay_feed(&mut manager, Arc::clone(&prompts), feed).await {
            result = Err(err);
            break;
        }
    }

    manager.disconnect();
    resolver.abort();
    result
}

async fn replay_feed(
    manager: &mut ConnectionManager,
    prompts: Arc<TerminalPrompts>,
    feed: &Path,
) -> Result<()> {
    let contents = fs::read_to_string(feed)
        .with_context(|| format!("Failed to read feed {}", feed.display()))?;

    let connection = manager.connect(Box::new(TerminalRenderer::new()), prompts);
    info!(connection = %connection.id(), feed = %feed.display(), "replaying feed");

    for (index, line) in contents.lines().enumerate() {
        let line_no = index + 1;
        match parse_line(line) {
            Ok(None) => {}
            Ok(Some(FeedLine::Event(value))) => {
                manager.send(value);
            }
            Ok(Some(FeedLine::Permission(request))) => {
                let verdict = connection
                    .gate()
                    .check(&request.tool_name, request.tool_input)
                    .await;
                report_verdict(&request.tool_name, &verdict);
            }
            Err(err) => {
                warn!(feed = %feed.display(), line = line_no, "skipping feed line: {err:#}");
            }
        }
    }

    manager.disconnect();
    let session = connection
        .finished()
        .await
        .context("event consumer stopped unexpectedly")?;
    let violations = session.router().violations().count();
    if violations > 0 {
        warn!(feed = %feed.display(), violations, "feed contained protocol violations");
    }
    Ok(())
}

fn report_verdict(tool_name: &str, verdict: &PermissionVerdict) {
    match verdict {
        PermissionVerdict::Deny { message } => eprintln!("✗ {tool_name}: {message}"),
        PermissionVerdict::Allow {
            updated_input: Some(input),
        } => {
            if let Some(answers) = input.get("answers").and_then(Value::as_object) {
                for (question, answer) in answers {
                    eprintln!("  → {question} {}", answer.as_str().unwrap_or_default());
                }
            }
        }
        PermissionVerdict::Allow {
            updated_input: None,
        } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_lines_are_recognized() {
        let line = r#"{"type":"permission_request","tool_name":"Write","tool_input":{"file_path":"a"}}"#;
        let Some(FeedLine::Permission(request)) = parse_line(line).unwrap() else {
            panic!("expected permission line");
        };
        assert_eq!(request.tool_name, "Write");
    }

    #[test]
    fn event_lines_pass_through() {
        let line = r#"{"type":"text_delta","text":"hi"}"#;
        assert!(matches!(parse_line(line).unwrap(), Some(FeedLine::Event(_))));
        assert!(parse_line("  ").unwrap().is_none());
        assert!(parse_line("{nope").is_err());
    }
}
