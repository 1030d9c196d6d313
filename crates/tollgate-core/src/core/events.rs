//! Inbound agent event types.
//!
//! This module defines the contract for events supplied by the upstream agent
//! connection. Events are serializable so recorded feeds can be replayed.
//! A `scope` of `None` addresses the top-level conversation; `Some(id)` addresses
//! the delegated scope opened by the invocation `id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::violation::ProtocolViolation;

/// Events emitted by the upstream agent, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental assistant text.
    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        text: String,
    },

    /// The agent invoked a tool.
    ToolInvocation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    /// A tool invocation finished.
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: String,
    },

    /// A nested scope was announced explicitly by the agent.
    ScopeStart {
        scope: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default)]
        descriptor: Value,
    },

    /// A nested scope ended.
    ScopeEnd { scope: String },

    /// Out-of-band system message (compaction, context usage, ...).
    SystemNotice {
        kind: NoticeKind,
        #[serde(default)]
        payload: Value,
    },

    /// A top-level response finished.
    ResponseComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl AgentEvent {
    /// Parses and validates a raw JSON event.
    ///
    /// Empty scope strings are normalized to the root scope. Empty invocation
    /// or scope ids are rejected.
    ///
    /// # Errors
    /// Returns `ProtocolViolation::Malformed` if the value is not a well-formed event.
    pub fn from_value(value: Value) -> Result<Self, ProtocolViolation> {
        let event: AgentEvent =
            serde_json::from_value(value).map_err(|err| ProtocolViolation::Malformed {
                reason: err.to_string(),
            })?;
        event.normalized()
    }

    /// Parses one JSON line.
    ///
    /// # Errors
    /// Returns `ProtocolViolation::Malformed` for invalid JSON or an invalid event.
    pub fn from_json_line(line: &str) -> Result<Self, ProtocolViolation> {
        let value: Value =
            serde_json::from_str(line).map_err(|err| ProtocolViolation::Malformed {
                reason: err.to_string(),
            })?;
        Self::from_value(value)
    }

    fn normalized(mut self) -> Result<Self, ProtocolViolation> {
        match &mut self {
            AgentEvent::TextDelta { scope, .. } => normalize_scope(scope),
            AgentEvent::ToolInvocation { scope, id, name, .. } => {
                normalize_scope(scope);
                require_non_empty("invocation id", id)?;
                require_non_empty("tool name", name)?;
            }
            AgentEvent::ToolResult { scope, id, .. } => {
                normalize_scope(scope);
                require_non_empty("invocation id", id)?;
            }
            AgentEvent::ScopeStart { scope, parent, .. } => {
                require_non_empty("scope id", scope)?;
                normalize_scope(parent);
            }
            AgentEvent::ScopeEnd { scope } => require_non_empty("scope id", scope)?,
            AgentEvent::SystemNotice { .. } | AgentEvent::ResponseComplete { .. } => {}
        }
        Ok(self)
    }

    /// Returns the scope this event is addressed to, if it is scope-routed.
    pub fn scope(&self) -> Option<&str> {
        match self {
            AgentEvent::TextDelta { scope, .. }
            | AgentEvent::ToolInvocation { scope, .. }
            | AgentEvent::ToolResult { scope, .. } => scope.as_deref(),
            AgentEvent::ScopeStart { scope, .. } | AgentEvent::ScopeEnd { scope } => {
                Some(scope.as_str())
            }
            AgentEvent::SystemNotice { .. } | AgentEvent::ResponseComplete { .. } => None,
        }
    }

    /// Short event name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AgentEvent::TextDelta { .. } => "text_delta",
            AgentEvent::ToolInvocation { .. } => "tool_invocation",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::ScopeStart { .. } => "scope_start",
            AgentEvent::ScopeEnd { .. } => "scope_end",
            AgentEvent::SystemNotice { .. } => "system_notice",
            AgentEvent::ResponseComplete { .. } => "response_complete",
        }
    }
}

fn normalize_scope(scope: &mut Option<String>) {
    if scope.as_deref().is_some_and(|s| s.trim().is_empty()) {
        *scope = None;
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ProtocolViolation> {
    if value.trim().is_empty() {
        return Err(ProtocolViolation::Malformed {
            reason: format!("{field} is empty"),
        });
    }
    Ok(())
}

/// System notice categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// The agent compacted its context (`payload.pre_tokens`).
    CompactBoundary,
    /// Context token usage is known (`payload.tokens`).
    ContextUsage,
    /// Anything else; logged and ignored.
    #[serde(other)]
    Other,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoticeKind::CompactBoundary => write!(f, "compact_boundary"),
            NoticeKind::ContextUsage => write!(f, "context_usage"),
            NoticeKind::Other => write!(f, "other"),
        }
    }
}

/// Token usage reported with a finished response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    /// Input tokens (non-cached)
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_input_tokens: u64,
    /// Tokens written to cache
    pub cache_creation_input_tokens: u64,
}

/// One item of the inbound feed: a typed event or raw JSON still to be validated.
#[derive(Debug, Clone)]
pub enum FeedItem {
    Event(AgentEvent),
    Json(Value),
}

impl From<AgentEvent> for FeedItem {
    fn from(event: AgentEvent) -> Self {
        FeedItem::Event(event)
    }
}

impl From<Value> for FeedItem {
    fn from(value: Value) -> Self {
        FeedItem::Json(value)
    }
}

impl FeedItem {
    /// Resolves the item into a validated event.
    ///
    /// # Errors
    /// Returns `ProtocolViolation::Malformed` for raw JSON that is not a valid event.
    pub fn into_event(self) -> Result<AgentEvent, ProtocolViolation> {
        match self {
            FeedItem::Event(event) => event.normalized(),
            FeedItem::Json(value) => AgentEvent::from_value(value),
        }
    }
}
