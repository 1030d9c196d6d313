//! Terminal renderer for routed conversations.
//!
//! Output contract:
//! - Root-scope assistant text → stdout only
//! - Tool activity, delegated-scope text, notices → stderr only

use std::collections::HashMap;
use std::io::{Stderr, Stdout, Write, stderr, stdout};

use tollgate_core::core::ledger::{ToolInvocationRecord, ToolResultPayload};
use tollgate_core::core::permission::tool_header;
use tollgate_core::core::sink::{MessageHandle, RenderSink, ToolDisplayHints, ToolHandle};

const RESULT_PREVIEW_CHARS: usize = 80;

struct ToolLine {
    indent: usize,
    collapsed: bool,
}

pub struct TerminalRenderer {
    stdout: Stdout,
    stderr: Stderr,
    next: u64,
    /// Open messages and their scope depth (0 = root).
    messages: HashMap<u64, usize>,
    tools: HashMap<u64, ToolLine>,
    /// Depth of each open delegated scope.
    depths: HashMap<String, usize>,
}

impl Default for TerminalRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self {
            stdout: stdout(),
            stderr: stderr(),
            next: 0,
            messages: HashMap::new(),
            tools: HashMap::new(),
            depths: HashMap::new(),
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    fn depth(&self, scope: Option<&str>) -> usize {
        scope.map_or(0, |s| self.depths.get(s).copied().unwrap_or(1))
    }
}

impl RenderSink for TerminalRenderer {
    fn open_message(&mut self, scope: Option<&str>, _after_tool: bool) -> MessageHandle {
        let handle = self.next_handle();
        let depth = self.depth(scope);
        self.messages.insert(handle, depth);
        if depth > 0 {
            let _ = write!(self.stderr, "{}", "  ".repeat(depth));
        }
        MessageHandle(handle)
    }

    fn append_text(&mut self, handle: MessageHandle, text: &str) {
        match self.messages.get(&handle.0) {
            Some(0) => {
                let _ = write!(self.stdout, "{text}");
                let _ = self.stdout.flush();
            }
            Some(_) => {
                let _ = write!(self.stderr, "{text}");
            }
            None => {}
        }
    }

    fn close_message(&mut self, handle: MessageHandle) {
        match self.messages.remove(&handle.0) {
            Some(0) => {
                let _ = writeln!(self.stdout);
                let _ = self.stdout.flush();
            }
            Some(_) => {
                let _ = writeln!(self.stderr);
            }
            None => {}
        }
    }

    fn show_invocation(
        &mut self,
        scope: Option<&str>,
        record: &ToolInvocationRecord,
        hints: &ToolDisplayHints,
    ) -> ToolHandle {
        let handle = self.next_handle();
        let indent = self.depth(scope);
        let header = match &hints.delegation {
            Some(label) => label.clone(),
            None => tool_header(&record.name, &record.input),
        };
        let _ = writeln!(self.stderr, "{}⚙ {header}", "  ".repeat(indent));
        self.tools.insert(
            handle,
            ToolLine {
                indent,
                collapsed: hints.collapsed,
            },
        );
        ToolHandle(handle)
    }

    fn update_invocation_result(&mut self, handle: ToolHandle, result: &ToolResultPayload) {
        let Some(line) = self.tools.get(&handle.0) else {
            return;
        };
        let pad = "  ".repeat(line.indent + 1);
        let status = if result.is_error { "✗ Error" } else { "✓ Done" };
        if line.collapsed {
            let _ = writeln!(self.stderr, "{pad}{status}");
            return;
        }
        let preview: String = result
            .content
            .lines()
            .next()
            .unwrap_or_default()
            .chars()
            .take(RESULT_PREVIEW_CHARS)
            .collect();
        if preview.is_empty() {
            let _ = writeln!(self.stderr, "{pad}{status}");
        } else {
            let _ = writeln!(self.stderr, "{pad}{status}: {preview}");
        }
    }

    fn collapse_invocation(&mut self, handle: ToolHandle) {
        // Already printed lines stay; later results for it print status only.
        if let Some(line) = self.tools.get_mut(&handle.0) {
            line.collapsed = true;
        }
    }

    fn open_scope(&mut self, scope: &str, parent: Option<&str>) {
        let depth = self.depth(parent) + 1;
        self.depths.insert(scope.to_string(), depth);
    }

    fn close_scope(&mut self, scope: &str) {
        self.depths.remove(scope);
    }

    fn show_notice(&mut self, text: &str) {
        let _ = writeln!(self.stderr, "ℹ {text}");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tollgate_core::core::ledger::ToolOutcome;

    use super::*;

    fn record(id: &str, name: &str) -> ToolInvocationRecord {
        ToolInvocationRecord {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({"description": "Look around"}),
            scope: None,
            outcome: ToolOutcome::Pending,
        }
    }

    #[test]
    fn delegated_scope_text_is_indented_under_its_task() {
        let mut renderer = TerminalRenderer::new();
        renderer.show_invocation(
            None,
            &record("9", "Task"),
            &ToolDisplayHints {
                collapsed: false,
                delegation: Some("Task: Look around".to_string()),
            },
        );
        renderer.open_scope("9", None);

        assert_eq!(renderer.depth(Some("9")), 1);
        let handle = renderer.open_message(Some("9"), false);
        assert_eq!(renderer.messages.get(&handle.0), Some(&1));
        renderer.close_message(handle);
        assert!(renderer.messages.is_empty());
    }

    #[test]
    fn nested_scope_depth_follows_parent_and_is_pruned() {
        let mut renderer = TerminalRenderer::new();
        renderer.open_scope("outer", None);
        renderer.open_scope("inner", Some("outer"));
        assert_eq!(renderer.depth(Some("inner")), 2);

        renderer.close_scope("inner");
        renderer.close_scope("outer");
        assert!(renderer.depths.is_empty());
    }

    #[test]
    fn collapse_marks_tool_line() {
        let mut renderer = TerminalRenderer::new();
        let handle = renderer.show_invocation(
            None,
            &record("1", "Read"),
            &ToolDisplayHints::default(),
        );
        renderer.collapse_invocation(handle);
        assert!(renderer.tools.get(&handle.0).unwrap().collapsed);
    }
}
