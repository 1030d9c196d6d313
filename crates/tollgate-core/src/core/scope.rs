//! Conversation scopes.
//!
//! A scope is the routing context of the top-level conversation or of one
//! delegated sub-task. Each scope owns its message units, its tool ledger and a
//! bounded recency window of tool displays, so events from different scopes
//! never touch each other's state.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::debug;

use crate::core::ledger::{ToolInvocationRecord, ToolLedger, ToolResultPayload};
use crate::core::sink::{MessageHandle, RenderSink, ToolDisplayHints, ToolHandle};
use crate::core::violation::ProtocolViolation;

/// Streaming state of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    Idle,
    Streaming,
    AwaitingAfterTool,
}

/// Coalesced text of one uninterrupted streaming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUnit {
    pub handle: MessageHandle,
    pub after_tool: bool,
    pub content: String,
}

/// What a delegated scope is working on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationDescriptor {
    pub description: Option<String>,
    pub subagent_type: Option<String>,
}

impl DelegationDescriptor {
    /// Reads `description` and `subagent_type` from a tool input or scope descriptor.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };
        Self {
            description: text("description"),
            subagent_type: text("subagent_type"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.subagent_type.is_none()
    }

    /// Fields set in `newer` win; the rest are kept.
    pub fn merged(self, newer: DelegationDescriptor) -> Self {
        Self {
            description: newer.description.or(self.description),
            subagent_type: newer.subagent_type.or(self.subagent_type),
        }
    }

    /// `Task: <description> (<subagent_type>)`.
    pub fn label(&self) -> String {
        let description = self.description.as_deref().unwrap_or("?");
        match &self.subagent_type {
            Some(kind) => format!("Task: {description} ({kind})"),
            None => format!("Task: {description}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Delegated {
        /// Invocation id that opened the scope; doubles as the scope id.
        id: String,
        parent: Option<String>,
        descriptor: DelegationDescriptor,
    },
}

/// A rendered tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDisplay {
    Leaf {
        handle: ToolHandle,
        collapsed: bool,
    },
    Delegated {
        handle: ToolHandle,
        collapsed: bool,
        /// Scope opened by this invocation.
        scope: String,
    },
}

impl ToolDisplay {
    pub fn handle(&self) -> ToolHandle {
        match self {
            ToolDisplay::Leaf { handle, .. } | ToolDisplay::Delegated { handle, .. } => *handle,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        match self {
            ToolDisplay::Leaf { collapsed, .. } | ToolDisplay::Delegated { collapsed, .. } => {
                *collapsed
            }
        }
    }

    pub fn nested_scope(&self) -> Option<&str> {
        match self {
            ToolDisplay::Leaf { .. } => None,
            ToolDisplay::Delegated { scope, .. } => Some(scope),
        }
    }

    /// Collapses the display once; repeated calls do nothing.
    pub fn collapse(&mut self, sink: &mut dyn RenderSink) {
        let (handle, collapsed) = match self {
            ToolDisplay::Leaf { handle, collapsed }
            | ToolDisplay::Delegated {
                handle, collapsed, ..
            } => (*handle, collapsed),
        };
        if !*collapsed {
            *collapsed = true;
            sink.collapse_invocation(handle);
        }
    }

    pub fn show_result(&self, sink: &mut dyn RenderSink, result: &ToolResultPayload) {
        sink.update_invocation_result(self.handle(), result);
    }
}

/// Keeps the last `limit` tool displays expanded.
///
/// Eviction only changes display granularity; records are never removed.
#[derive(Debug, Clone)]
pub struct RecencyWindow {
    limit: usize,
    ids: VecDeque<String>,
}

impl RecencyWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ids: VecDeque::new(),
        }
    }

    /// Adds `id` and returns the ids evicted to stay within the limit.
    pub fn push(&mut self, id: &str) -> Vec<String> {
        self.ids.push_back(id.to_string());
        let mut evicted = Vec::new();
        while self.ids.len() > self.limit {
            if let Some(old) = self.ids.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug)]
pub struct ConversationScope {
    kind: ScopeKind,
    phase: ScopePhase,
    open_unit: Option<MessageUnit>,
    closed_units: Vec<MessageUnit>,
    recent: RecencyWindow,
    displays: HashMap<String, ToolDisplay>,
    ledger: ToolLedger,
}

impl ConversationScope {
    pub fn root(recent_limit: usize) -> Self {
        Self::with_kind(ScopeKind::Root, recent_limit)
    }

    pub fn delegated(
        id: &str,
        parent: Option<&str>,
        descriptor: DelegationDescriptor,
        recent_limit: usize,
    ) -> Self {
        Self::with_kind(
            ScopeKind::Delegated {
                id: id.to_string(),
                parent: parent.map(str::to_string),
                descriptor,
            },
            recent_limit,
        )
    }

    fn with_kind(kind: ScopeKind, recent_limit: usize) -> Self {
        Self {
            kind,
            phase: ScopePhase::Idle,
            open_unit: None,
            closed_units: Vec::new(),
            recent: RecencyWindow::new(recent_limit),
            displays: HashMap::new(),
            ledger: ToolLedger::new(),
        }
    }

    /// Scope id; `None` for the root.
    pub fn id(&self) -> Option<&str> {
        match &self.kind {
            ScopeKind::Root => None,
            ScopeKind::Delegated { id, .. } => Some(id),
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match &self.kind {
            ScopeKind::Root => None,
            ScopeKind::Delegated { parent, .. } => parent.as_deref(),
        }
    }

    pub fn kind(&self) -> &ScopeKind {
        &self.kind
    }

    pub fn phase(&self) -> ScopePhase {
        self.phase
    }

    pub fn open_unit(&self) -> Option<&MessageUnit> {
        self.open_unit.as_ref()
    }

    /// Every unit of the scope in arrival order, including the open one.
    pub fn units(&self) -> Vec<&MessageUnit> {
        self.closed_units
            .iter()
            .chain(self.open_unit.as_ref())
            .collect()
    }

    pub fn ledger(&self) -> &ToolLedger {
        &self.ledger
    }

    pub fn display(&self, invocation_id: &str) -> Option<&ToolDisplay> {
        self.displays.get(invocation_id)
    }

    pub fn descriptor(&self) -> Option<&DelegationDescriptor> {
        match &self.kind {
            ScopeKind::Root => None,
            ScopeKind::Delegated { descriptor, .. } => Some(descriptor),
        }
    }

    pub fn set_descriptor(&mut self, new: DelegationDescriptor) {
        if let ScopeKind::Delegated { descriptor, .. } = &mut self.kind {
            *descriptor = new;
        }
    }

    /// Appends streamed text, opening a unit if none is open.
    pub fn push_text(&mut self, sink: &mut dyn RenderSink, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.phase == ScopePhase::Streaming
            && let Some(unit) = self.open_unit.as_mut()
        {
            unit.content.push_str(text);
            sink.append_text(unit.handle, text);
            return;
        }

        self.flush_unit(sink);
        let after_tool = self.phase == ScopePhase::AwaitingAfterTool;
        let handle = sink.open_message(self.id(), after_tool);
        sink.append_text(handle, text);
        self.open_unit = Some(MessageUnit {
            handle,
            after_tool,
            content: text.to_string(),
        });
        self.phase = ScopePhase::Streaming;
    }

    /// Records and shows a tool invocation.
    ///
    /// # Errors
    /// Returns `DuplicateInvocation` if the id is already known to this scope;
    /// nothing changes in that case.
    pub fn record_invocation(
        &mut self,
        sink: &mut dyn RenderSink,
        id: &str,
        name: &str,
        input: Value,
        hints: &ToolDisplayHints,
    ) -> Result<(), ProtocolViolation> {
        let scope = self.id().map(str::to_string);
        self.ledger.register(scope.as_deref(), id, name, input)?;

        self.flush_unit(sink);
        self.phase = ScopePhase::AwaitingAfterTool;

        let Some(record) = self.ledger.get(id) else {
            return Ok(());
        };
        let handle = sink.show_invocation(scope.as_deref(), record, hints);
        let display = if hints.delegation.is_some() {
            ToolDisplay::Delegated {
                handle,
                collapsed: hints.collapsed,
                scope: id.to_string(),
            }
        } else {
            ToolDisplay::Leaf {
                handle,
                collapsed: hints.collapsed,
            }
        };
        self.displays.insert(id.to_string(), display);

        for evicted in self.recent.push(id) {
            if let Some(display) = self.displays.get_mut(&evicted) {
                debug!(invocation = %evicted, "tool display left the recency window");
                display.collapse(sink);
            }
        }
        Ok(())
    }

    /// Completes a pending invocation and shows its result.
    ///
    /// Returns the nested scope id when the invocation was a delegation.
    ///
    /// # Errors
    /// Returns `UnknownInvocation` if the id is not pending in this scope.
    pub fn complete_invocation(
        &mut self,
        sink: &mut dyn RenderSink,
        id: &str,
        result: ToolResultPayload,
    ) -> Result<Option<String>, ProtocolViolation> {
        let record = self.ledger.resolve(id, result)?;
        let Some(display) = self.displays.get(id) else {
            return Ok(None);
        };
        if let Some(result) = record.result() {
            display.show_result(sink, result);
        }
        Ok(display.nested_scope().map(str::to_string))
    }

    pub fn record(&self, id: &str) -> Option<&ToolInvocationRecord> {
        self.ledger.get(id)
    }

    /// Closes the open unit as-is; the next text starts a fresh, non-after-tool unit.
    pub fn finish(&mut self, sink: &mut dyn RenderSink) {
        self.flush_unit(sink);
        self.phase = ScopePhase::Idle;
    }

    fn flush_unit(&mut self, sink: &mut dyn RenderSink) {
        if let Some(unit) = self.open_unit.take() {
            sink.close_message(unit.handle);
            self.closed_units.push(unit);
        }
    }
}
