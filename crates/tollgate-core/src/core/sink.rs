//! Rendering sink.
//!
//! The router never formats anything itself; it drives a `RenderSink` through
//! opaque handles. Handles are only meaningful to the sink that issued them.

use crate::core::ledger::{ToolInvocationRecord, ToolResultPayload};

/// Handle to a rendered message unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub u64);

/// Handle to a rendered tool display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolHandle(pub u64);

/// How a tool display should be presented when it is first shown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolDisplayHints {
    /// Start collapsed.
    pub collapsed: bool,
    /// Label of the nested scope when the invocation is a delegation.
    pub delegation: Option<String>,
}

/// Presentation layer driven by the router.
pub trait RenderSink: Send {
    /// Opens a message unit. `after_tool` is set when the unit follows a tool call.
    fn open_message(&mut self, scope: Option<&str>, after_tool: bool) -> MessageHandle;

    fn append_text(&mut self, handle: MessageHandle, text: &str);

    /// Called when a unit will receive no more text.
    fn close_message(&mut self, _handle: MessageHandle) {}

    fn show_invocation(
        &mut self,
        scope: Option<&str>,
        record: &ToolInvocationRecord,
        hints: &ToolDisplayHints,
    ) -> ToolHandle;

    fn update_invocation_result(&mut self, handle: ToolHandle, result: &ToolResultPayload);

    /// Collapses a display. Never removes it.
    fn collapse_invocation(&mut self, handle: ToolHandle);

    /// A delegated scope opened under `parent` (`None` = root).
    fn open_scope(&mut self, _scope: &str, _parent: Option<&str>) {}

    /// A delegated scope was torn down. Its units are already closed.
    fn close_scope(&mut self, _scope: &str) {}

    /// Out-of-band status line (compaction, context usage, ...).
    fn show_notice(&mut self, _text: &str) {}
}

/// Sink that renders nothing.
#[derive(Debug, Default)]
pub struct NullSink {
    next: u64,
}

impl NullSink {
    fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

impl RenderSink for NullSink {
    fn open_message(&mut self, _scope: Option<&str>, _after_tool: bool) -> MessageHandle {
        MessageHandle(self.next())
    }

    fn append_text(&mut self, _handle: MessageHandle, _text: &str) {}

    fn show_invocation(
        &mut self,
        _scope: Option<&str>,
        _record: &ToolInvocationRecord,
        _hints: &ToolDisplayHints,
    ) -> ToolHandle {
        ToolHandle(self.next())
    }

    fn update_invocation_result(&mut self, _handle: ToolHandle, _result: &ToolResultPayload) {}

    fn collapse_invocation(&mut self, _handle: ToolHandle) {}
}
