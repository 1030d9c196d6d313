//! Live agent connections.
//!
//! A `Session` owns everything that lives exactly as long as one agent
//! connection: the router with its scopes and ledgers, the permission gate
//! with its approval policy, and the session-level facts reported by the agent.
//! `ConnectionManager` keeps exactly one connection live; connecting again
//! builds fresh state instead of reusing the old session.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::core::consumer::EventStreamConsumer;
use crate::core::events::{AgentEvent, FeedItem, NoticeKind, Usage};
use crate::core::permission::{ApprovalPromptSink, PermissionGate};
use crate::core::policy::ToolCategories;
use crate::core::queues::{CompletedTurnNotice, ObservabilityQueues};
use crate::core::router::{ConversationRouter, RouterSettings};
use crate::core::sink::RenderSink;
use crate::core::violation::ProtocolViolation;

#[derive(Debug)]
pub struct Session {
    connection_id: Uuid,
    agent_session_id: Option<String>,
    context_tokens: Option<u64>,
    router: ConversationRouter,
    gate: PermissionGate,
    queues: ObservabilityQueues,
}

impl Session {
    pub fn new(
        config: &Config,
        queues: ObservabilityQueues,
        render: Box<dyn RenderSink>,
        prompts: Arc<dyn ApprovalPromptSink>,
    ) -> Self {
        let connection_id = Uuid::new_v4();
        let gate = PermissionGate::new(
            connection_id,
            ToolCategories::from_groups(&config.permissions.groups),
            queues.clone(),
            prompts,
        );
        Self {
            connection_id,
            agent_session_id: None,
            context_tokens: None,
            router: ConversationRouter::new(RouterSettings::from_config(config), render),
            gate,
            queues,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Session id last reported by the agent.
    pub fn agent_session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }

    pub fn context_tokens(&self) -> Option<u64> {
        self.context_tokens
    }

    pub fn router(&self) -> &ConversationRouter {
        &self.router
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Applies one validated event.
    pub fn apply(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::SystemNotice { kind, payload } => self.on_notice(kind, &payload),
            AgentEvent::ResponseComplete { session_id, usage } => {
                self.on_response_complete(session_id, usage);
            }
            event => self.router.handle(event),
        }
    }

    /// Records an event that never made it to the router.
    pub fn reject(&mut self, violation: ProtocolViolation) {
        self.router.record_violation("feed", violation);
    }

    /// Feed ended: open units are closed as-is. Pending permission requests
    /// are left to whoever supervises the connection.
    pub fn finish(&mut self) {
        self.router.finish();
        let orphaned = self.gate.pending().len();
        info!(connection = %self.connection_id, orphaned, "event feed ended");
    }

    fn on_notice(&mut self, kind: NoticeKind, payload: &Value) {
        match kind {
            NoticeKind::CompactBoundary => {
                let tokens = token_count(payload, "pre_tokens")
                    .map_or_else(|| "?".to_string(), |n| n.to_string());
                self.router.show_notice(&format!("Compacted: {tokens} tokens"));
            }
            NoticeKind::ContextUsage => {
                if let Some(tokens) = token_count(payload, "tokens") {
                    self.context_tokens = Some(tokens);
                    self.router.show_notice(&format!("Context: {tokens} tokens"));
                }
            }
            NoticeKind::Other => debug!(?payload, "system notice ignored"),
        }
    }

    fn on_response_complete(&mut self, session_id: Option<String>, usage: Option<Usage>) {
        if session_id.is_some() {
            self.agent_session_id = session_id;
        }
        self.router.end_turn();
        info!(
            connection = %self.connection_id,
            session = ?self.agent_session_id,
            "response complete"
        );
        self.queues.publish_completed(CompletedTurnNotice {
            connection_id: self.connection_id,
            session_id: self.agent_session_id.clone(),
            usage,
        });
    }
}

fn token_count(payload: &Value, key: &str) -> Option<u64> {
    payload.get(key).and_then(Value::as_u64)
}

struct FeedSender {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<FeedItem>,
}

/// A connection started by `ConnectionManager::connect`.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    gate: PermissionGate,
    task: JoinHandle<Session>,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Waits for the consumer to drain its feed and returns the final session.
    ///
    /// Completes only once the feed is closed (by `disconnect` or a newer `connect`).
    pub async fn finished(self) -> Result<Session, JoinError> {
        self.task.await
    }
}

/// Owns the single live connection.
pub struct ConnectionManager {
    config: Config,
    queues: ObservabilityQueues,
    current: Option<FeedSender>,
}

impl ConnectionManager {
    pub fn new(config: Config, queues: ObservabilityQueues) -> Self {
        Self {
            config,
            queues,
            current: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queues(&self) -> &ObservabilityQueues {
        &self.queues
    }

    /// Starts a new connection (new query or resumed session).
    ///
    /// The previous connection's feed is closed; its consumer drains what was
    /// already sent and stops. Its pending requests stay orphaned. Must be
    /// called inside a tokio runtime.
    pub fn connect(
        &mut self,
        render: Box<dyn RenderSink>,
        prompts: Arc<dyn ApprovalPromptSink>,
    ) -> Connection {
        self.disconnect();

        let session = Session::new(&self.config, self.queues.clone(), render, prompts);
        let id = session.connection_id();
        let gate = session.gate().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(EventStreamConsumer::new(session).run(rx));

        info!(connection = %id, "connection started");
        self.current = Some(FeedSender {
            connection_id: id,
            tx,
        });
        Connection { id, gate, task }
    }

    /// Feeds one item to the live connection. Returns false if there is none.
    pub fn send(&self, item: impl Into<FeedItem>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.tx.send(item.into()).is_ok())
    }

    /// Closes the live connection's feed.
    pub fn disconnect(&mut self) {
        if let Some(old) = self.current.take() {
            info!(connection = %old.connection_id, "connection closed");
        }
    }

    pub fn current_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(|c| c.connection_id)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("current", &self.current_id())
            .finish_non_exhaustive()
    }
}
