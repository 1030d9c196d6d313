//! In-memory sinks for tests.

use std::sync::{Arc, Mutex, PoisonError};

use crate::core::ledger::{ToolInvocationRecord, ToolResultPayload};
use crate::core::permission::{ApprovalPromptSink, PermissionRequest};
use crate::core::sink::{MessageHandle, RenderSink, ToolDisplayHints, ToolHandle};

/// One call made on a `RecordingSink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    OpenMessage {
        handle: u64,
        scope: Option<String>,
        after_tool: bool,
    },
    AppendText {
        handle: u64,
        text: String,
    },
    CloseMessage {
        handle: u64,
    },
    ShowInvocation {
        handle: u64,
        scope: Option<String>,
        id: String,
        name: String,
        collapsed: bool,
        delegation: Option<String>,
    },
    UpdateResult {
        handle: u64,
        is_error: bool,
        content: String,
    },
    Collapse {
        handle: u64,
    },
    OpenScope {
        scope: String,
        parent: Option<String>,
    },
    CloseScope {
        scope: String,
    },
    Notice(String),
}

/// A rendered message as seen by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub scope: Option<String>,
    pub after_tool: bool,
    pub text: String,
}

#[derive(Debug, Default)]
struct Recording {
    next: u64,
    calls: Vec<SinkCall>,
}

/// Render sink that records every call. Clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().calls.clone()
    }

    /// Messages in the order they were opened, with their appended text.
    pub fn messages(&self) -> Vec<RecordedMessage> {
        let recording = self.lock();
        let mut handles = Vec::new();
        let mut messages: Vec<RecordedMessage> = Vec::new();
        for call in &recording.calls {
            match call {
                SinkCall::OpenMessage {
                    handle,
                    scope,
                    after_tool,
                } => {
                    handles.push(*handle);
                    messages.push(RecordedMessage {
                        scope: scope.clone(),
                        after_tool: *after_tool,
                        text: String::new(),
                    });
                }
                SinkCall::AppendText { handle, text } => {
                    if let Some(i) = handles.iter().position(|h| h == handle) {
                        messages[i].text.push_str(text);
                    }
                }
                _ => {}
            }
        }
        messages
    }

    /// Handles of tool displays that were collapsed after being shown.
    pub fn collapsed(&self) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Collapse { handle } => Some(*handle),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Notice(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: impl FnOnce(u64) -> SinkCall) -> u64 {
        let mut recording = self.lock();
        recording.next += 1;
        let handle = recording.next;
        recording.calls.push(call(handle));
        handle
    }

    fn push(&self, call: SinkCall) {
        self.lock().calls.push(call);
    }
}

impl RenderSink for RecordingSink {
    fn open_message(&mut self, scope: Option<&str>, after_tool: bool) -> MessageHandle {
        MessageHandle(self.record(|handle| SinkCall::OpenMessage {
            handle,
            scope: scope.map(str::to_string),
            after_tool,
        }))
    }

    fn append_text(&mut self, handle: MessageHandle, text: &str) {
        self.push(SinkCall::AppendText {
            handle: handle.0,
            text: text.to_string(),
        });
    }

    fn close_message(&mut self, handle: MessageHandle) {
        self.push(SinkCall::CloseMessage { handle: handle.0 });
    }

    fn show_invocation(
        &mut self,
        scope: Option<&str>,
        record: &ToolInvocationRecord,
        hints: &ToolDisplayHints,
    ) -> ToolHandle {
        ToolHandle(self.record(|handle| SinkCall::ShowInvocation {
            handle,
            scope: scope.map(str::to_string),
            id: record.id.clone(),
            name: record.name.clone(),
            collapsed: hints.collapsed,
            delegation: hints.delegation.clone(),
        }))
    }

    fn update_invocation_result(&mut self, handle: ToolHandle, result: &ToolResultPayload) {
        self.push(SinkCall::UpdateResult {
            handle: handle.0,
            is_error: result.is_error,
            content: result.content.clone(),
        });
    }

    fn collapse_invocation(&mut self, handle: ToolHandle) {
        self.push(SinkCall::Collapse { handle: handle.0 });
    }

    fn open_scope(&mut self, scope: &str, parent: Option<&str>) {
        self.push(SinkCall::OpenScope {
            scope: scope.to_string(),
            parent: parent.map(str::to_string),
        });
    }

    fn close_scope(&mut self, scope: &str) {
        self.push(SinkCall::CloseScope {
            scope: scope.to_string(),
        });
    }

    fn show_notice(&mut self, text: &str) {
        self.push(SinkCall::Notice(text.to_string()));
    }
}

/// Prompt sink that logs `present <id>` / `dismiss <id>` lines.
#[derive(Debug, Default)]
pub struct RecordingPrompts {
    log: Mutex<Vec<String>>,
}

impl RecordingPrompts {
    pub fn log(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, line: String) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

impl ApprovalPromptSink for RecordingPrompts {
    fn present_request(&self, request: &Arc<PermissionRequest>) {
        self.push(format!("present {}", request.id()));
    }

    fn dismiss_request(&self, request: &PermissionRequest) {
        self.push(format!("dismiss {}", request.id()));
    }
}
