//! Permission negotiation gate.
//!
//! Every tool call passes through the gate before it executes. A request moves
//! `Created -> AwaitingResolution -> Resolved(decision)`, or straight to
//! `Resolved(allow)` when its category is already auto-approved.
//!
//! The decision slot is written exactly once. Interactive and programmatic
//! resolvers may race; the first writer wins and every later write is a silent
//! no-op. Waiters suspend on a `Notify` and never hold a gate lock while
//! suspended, so they can be woken from any thread or runtime.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::policy::{AutoApprovalPolicy, ToolCategories, ToolCategory};
use crate::core::queues::{ObservabilityQueues, PendingRequestNotice};
use crate::core::question::{CANCELLED_MESSAGE, QUESTION_TOOL, QuestionOutcome, QuestionRequest};

pub type RequestId = Uuid;

const DENIED_MESSAGE: &str = "User denied permission";
const BASH_HEADER_MAX_CHARS: usize = 50;

/// A resolver's answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Allow this call only.
    Allow,
    /// Allow this call and auto-approve the tool's category for the connection.
    AllowAll,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow | Decision::AllowAll)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::AllowAll => "allow_all",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "yes" | "y" => Ok(Decision::Allow),
            "allow_all" | "allow-all" | "all" => Ok(Decision::AllowAll),
            "deny" | "no" | "n" => Ok(Decision::Deny),
            other => Err(format!(
                "Invalid decision '{other}'. Valid options: allow, allow_all, deny"
            )),
        }
    }
}

/// Who wrote the decision slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    /// Auto-approved by the connection's policy.
    Policy,
    /// Answered at an interactive prompt.
    Interactive,
    /// Answered by code (harness, supervisor, scripted resolver).
    Programmatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub decision: Decision,
    pub resolved_by: ResolvedBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    AwaitingResolution,
    Resolved(Resolution),
}

/// Outcome handed back to the agent for a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionVerdict {
    /// Run the tool, with `updated_input` replacing its input when set.
    Allow { updated_input: Option<Value> },
    Deny { message: String },
}

impl From<Decision> for PermissionVerdict {
    fn from(decision: Decision) -> Self {
        if decision.is_allowed() {
            PermissionVerdict::Allow {
                updated_input: None,
            }
        } else {
            PermissionVerdict::Deny {
                message: DENIED_MESSAGE.to_string(),
            }
        }
    }
}

/// Presentation-side hooks for requests entering/leaving `AwaitingResolution`.
///
/// All methods may be called from any thread.
pub trait ApprovalPromptSink: Send + Sync {
    fn present_request(&self, request: &Arc<PermissionRequest>);
    fn dismiss_request(&self, request: &PermissionRequest);

    /// Shows questions from the question tool. Whoever collects the answers
    /// calls `answer` or `cancel` on the request; sinks that cannot ask cancel.
    fn present_questions(&self, request: &Arc<QuestionRequest>) {
        request.cancel();
    }
}

/// Prompt sink for headless connections.
#[derive(Debug, Default)]
pub struct NoopPrompts;

impl ApprovalPromptSink for NoopPrompts {
    fn present_request(&self, _request: &Arc<PermissionRequest>) {}
    fn dismiss_request(&self, _request: &PermissionRequest) {}
}

/// Write-once result cell with an async wait accessor.
pub(crate) struct WriteOnceCell<T> {
    slot: OnceLock<T>,
    notify: Notify,
    /// Serializes writers only; waiters never take it.
    writer: Mutex<()>,
}

impl<T> Default for WriteOnceCell<T> {
    fn default() -> Self {
        Self {
            slot: OnceLock::new(),
            notify: Notify::new(),
            writer: Mutex::new(()),
        }
    }
}

impl<T: Clone> WriteOnceCell<T> {
    pub(crate) fn resolved(value: T) -> Self {
        let cell = Self::default();
        let _ = cell.slot.set(value);
        cell
    }

    /// Writes the slot if it is empty and returns true if this call won.
    ///
    /// `on_win` runs for the winning writer only, before any waiter can see the value.
    pub(crate) fn set_with(&self, value: T, on_win: impl FnOnce()) -> bool {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.slot.get().is_some() {
            return false;
        }
        on_win();
        let _ = self.slot.set(value);
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.slot.get().cloned()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }

    pub(crate) async fn wait(&self) -> T {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // Register before checking the slot so a concurrent `set` cannot slip between.
            notified.as_mut().enable();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

/// A tool call awaiting (or past) its allow/deny decision.
pub struct PermissionRequest {
    id: RequestId,
    tool_name: String,
    tool_input: Value,
    category: ToolCategory,
    grouped: bool,
    cell: WriteOnceCell<Resolution>,
    gate: Weak<GateInner>,
}

impl PermissionRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn tool_input(&self) -> &Value {
        &self.tool_input
    }

    pub fn category(&self) -> &ToolCategory {
        &self.category
    }

    /// Prompt title, e.g. `Allow Write: notes.txt?`.
    pub fn title(&self) -> String {
        format!("Allow {}?", tool_header(&self.tool_name, &self.tool_input))
    }

    /// Choices to offer at a prompt. `allow_all` is offered only for grouped tools.
    pub fn options(&self) -> Vec<(Decision, &'static str)> {
        let mut options = vec![
            (Decision::Allow, "Yes, this time only"),
            (Decision::Deny, "No"),
        ];
        if self.grouped {
            options.insert(0, (Decision::AllowAll, "Yes, all edits in this session"));
        }
        options
    }

    pub fn state(&self) -> RequestState {
        match self.cell.get() {
            Some(resolution) => RequestState::Resolved(resolution),
            None => RequestState::AwaitingResolution,
        }
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.cell.get()
    }

    pub fn decision(&self) -> Option<Decision> {
        self.cell.get().map(|r| r.decision)
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.is_set()
    }

    /// Writes the decision if nobody has yet.
    ///
    /// Returns true if this call took effect. Later calls are silent no-ops.
    pub fn respond(&self, decision: Decision, resolved_by: ResolvedBy) -> bool {
        let resolution = Resolution {
            decision,
            resolved_by,
        };
        let gate = self.gate.upgrade();
        let won = self.cell.set_with(resolution, || {
            if decision == Decision::AllowAll
                && let Some(gate) = &gate
            {
                gate.escalate(&self.category);
            }
        });
        if !won {
            debug!(request = %self.id, %decision, "late permission response ignored");
            return false;
        }
        if let Some(gate) = gate {
            gate.on_resolved(self, resolution);
        }
        true
    }

    /// Suspends until the request is resolved.
    ///
    /// Never returns if nothing resolves the request; cancellation (dropping
    /// the future, a timeout) is the caller's responsibility.
    pub async fn wait(&self) -> Decision {
        self.cell.wait().await.decision
    }
}

impl fmt::Debug for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionRequest")
            .field("id", &self.id)
            .field("tool_name", &self.tool_name)
            .field("category", &self.category)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct GateInner {
    connection_id: Uuid,
    categories: ToolCategories,
    policy: Mutex<AutoApprovalPolicy>,
    requests: Mutex<HashMap<RequestId, Arc<PermissionRequest>>>,
    queues: ObservabilityQueues,
    prompts: Arc<dyn ApprovalPromptSink>,
}

impl GateInner {
    fn escalate(&self, category: &ToolCategory) {
        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .toggle(category, true);
        info!(%category, "auto-approval enabled for the rest of the connection");
    }

    fn on_resolved(&self, request: &PermissionRequest, resolution: Resolution) {
        info!(
            tool = %request.tool_name,
            decision = %resolution.decision,
            resolved_by = ?resolution.resolved_by,
            "permission resolved"
        );
        self.prompts.dismiss_request(request);
    }
}

/// Cloneable handle to one connection's permission gate.
#[derive(Clone)]
pub struct PermissionGate {
    inner: Arc<GateInner>,
}

impl PermissionGate {
    pub fn new(
        connection_id: Uuid,
        categories: ToolCategories,
        queues: ObservabilityQueues,
        prompts: Arc<dyn ApprovalPromptSink>,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                connection_id,
                categories,
                policy: Mutex::new(AutoApprovalPolicy::new()),
                requests: Mutex::new(HashMap::new()),
                queues,
                prompts,
            }),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    pub fn categories(&self) -> &ToolCategories {
        &self.inner.categories
    }

    /// Opens a permission request for a tool call.
    ///
    /// Auto-approved categories resolve immediately to `allow` without being
    /// presented, published or retained by the gate. Otherwise the request is presented to the prompt
    /// sink and a pending-request notification is published.
    pub fn request(&self, tool_name: &str, tool_input: Value) -> Arc<PermissionRequest> {
        let category = self.inner.categories.category_of(tool_name);
        let auto_approved = self.policy().is_approved(&category);

        let cell = if auto_approved {
            WriteOnceCell::resolved(Resolution {
                decision: Decision::Allow,
                resolved_by: ResolvedBy::Policy,
            })
        } else {
            WriteOnceCell::default()
        };
        let request = Arc::new(PermissionRequest {
            id: Uuid::new_v4(),
            tool_name: tool_name.to_string(),
            tool_input,
            grouped: self.inner.categories.is_grouped(tool_name),
            category,
            cell,
            gate: Arc::downgrade(&self.inner),
        });
        if auto_approved {
            info!(tool = %tool_name, "auto-approved");
            return request;
        }

        // Only requests that can still be awaited or resolved by id are kept.
        self.requests()
            .insert(request.id, Arc::clone(&request));
        info!(tool = %tool_name, request = %request.id, "permission requested");
        self.inner.prompts.present_request(&request);
        self.inner.queues.publish_pending(PendingRequestNotice {
            connection_id: self.inner.connection_id,
            request: Arc::clone(&request),
        });
        request
    }

    /// Resolves request `id`. Returns true only for the first effective write.
    pub fn resolve(&self, id: RequestId, decision: Decision, resolved_by: ResolvedBy) -> bool {
        match self.get(id) {
            Some(request) => request.respond(decision, resolved_by),
            None => {
                debug!(request = %id, "resolve for unknown permission request ignored");
                false
            }
        }
    }

    /// Waits for request `id`; `None` if the id is unknown to this gate.
    pub async fn wait(&self, id: RequestId) -> Option<Decision> {
        let request = self.get(id)?;
        Some(request.wait().await)
    }

    /// Requests permission and waits for the verdict.
    ///
    /// The question tool skips the allow/deny prompt and goes through `ask`.
    pub async fn check(&self, tool_name: &str, tool_input: Value) -> PermissionVerdict {
        if tool_name == QUESTION_TOOL {
            return self.ask(tool_input).await;
        }
        let request = self.request(tool_name, tool_input);
        request.wait().await.into()
    }

    /// Presents the question tool's questions and waits for the answers.
    ///
    /// Answers allow the call with `{questions, answers}` as its new input.
    /// Cancelling denies it. A call without questions is allowed unchanged.
    pub async fn ask(&self, tool_input: Value) -> PermissionVerdict {
        let Some(request) = QuestionRequest::from_input(&tool_input) else {
            warn!("question tool called without questions");
            return PermissionVerdict::Allow {
                updated_input: Some(tool_input),
            };
        };
        let request = Arc::new(request);
        info!(request = %request.id(), questions = request.questions().len(), "questions asked");
        self.inner.prompts.present_questions(&request);

        match request.wait().await {
            QuestionOutcome::Answered(answers) => {
                info!(request = %request.id(), "questions answered");
                PermissionVerdict::Allow {
                    updated_input: Some(json!({
                        "questions": request.raw_questions(),
                        "answers": answers,
                    })),
                }
            }
            QuestionOutcome::Cancelled => {
                info!(request = %request.id(), "questions cancelled");
                PermissionVerdict::Deny {
                    message: CANCELLED_MESSAGE.to_string(),
                }
            }
        }
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<PermissionRequest>> {
        self.requests().get(&id).map(Arc::clone)
    }

    /// Requests still awaiting resolution.
    pub fn pending(&self) -> Vec<Arc<PermissionRequest>> {
        self.requests()
            .values()
            .filter(|r| !r.is_resolved())
            .map(Arc::clone)
            .collect()
    }

    pub fn toggle(&self, category: &ToolCategory, on: bool) {
        self.policy().toggle(category, on);
        info!(%category, on, "auto-approval toggled");
    }

    /// Flips a configured group's flag; returns the new state, or `None` for an unknown group.
    pub fn toggle_group(&self, name: &str) -> Option<bool> {
        let category = self.inner.categories.group(name)?;
        let mut policy = self.policy();
        let on = !policy.is_approved(&category);
        policy.toggle(&category, on);
        info!(%category, on, "auto-approval toggled");
        Some(on)
    }

    pub fn is_auto_approved(&self, tool_name: &str) -> bool {
        let category = self.inner.categories.category_of(tool_name);
        self.policy().is_approved(&category)
    }

    pub fn approved_categories(&self) -> Vec<ToolCategory> {
        self.policy().approved()
    }

    fn policy(&self) -> std::sync::MutexGuard<'_, AutoApprovalPolicy> {
        self.inner
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn requests(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Arc<PermissionRequest>>> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGate")
            .field("connection_id", &self.inner.connection_id)
            .finish_non_exhaustive()
    }
}

/// One-line summary of a tool call.
pub fn tool_header(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("?");
    match name {
        "Edit" | "Write" | "Read" => format!("{name}: {}", field("file_path")),
        "Bash" => {
            let description = input
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if description.is_empty() {
                let command = field("command");
                let truncated: String = command.chars().take(BASH_HEADER_MAX_CHARS).collect();
                let ellipsis = if command.chars().count() > BASH_HEADER_MAX_CHARS {
                    "..."
                } else {
                    ""
                };
                format!("Bash: {truncated}{ellipsis}")
            } else {
                format!("Bash: {description}")
            }
        }
        "Glob" | "Grep" => format!("{name}: {}", field("pattern")),
        _ => name.to_string(),
    }
}
