//! Conversation router.
//!
//! Turns scope-addressed events into coalesced message units and tool displays.
//! Each event is routed to exactly one scope: the root for `scope: None`, else
//! the open delegated scope with that id. Events for a scope that is not open
//! are dropped and recorded as violations; they are never routed elsewhere.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::events::AgentEvent;
use crate::core::ledger::ToolResultPayload;
use crate::core::registry::TaskRegistry;
use crate::core::scope::{ConversationScope, DelegationDescriptor};
use crate::core::sink::{RenderSink, ToolDisplayHints};
use crate::core::violation::ProtocolViolation;

const MAX_RECORDED_VIOLATIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    /// Tool displays per scope that stay expanded.
    pub recent_limit: usize,
    pub delegation_tools: HashSet<String>,
    pub collapse_by_default: HashSet<String>,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recent_limit: config.transcript.recent_tools_expanded,
            delegation_tools: config.delegation.tools.iter().cloned().collect(),
            collapse_by_default: config
                .transcript
                .collapse_by_default
                .iter()
                .cloned()
                .collect(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ConversationRouter {
    sink: Box<dyn RenderSink>,
    settings: RouterSettings,
    root: ConversationScope,
    registry: TaskRegistry,
    violations: VecDeque<ProtocolViolation>,
}

impl ConversationRouter {
    pub fn new(settings: RouterSettings, sink: Box<dyn RenderSink>) -> Self {
        Self {
            root: ConversationScope::root(settings.recent_limit),
            registry: TaskRegistry::new(settings.recent_limit),
            sink,
            settings,
            violations: VecDeque::new(),
        }
    }

    /// Routes one event. Violations are logged and recorded, never returned.
    pub fn handle(&mut self, event: AgentEvent) {
        let kind = event.kind_name();
        if let Err(violation) = self.route(event) {
            self.record_violation(kind, violation);
        }
    }

    /// Routes one event, returning the violation if it was dropped.
    ///
    /// # Errors
    /// Any `ProtocolViolation` the event triggers; state is unchanged in that case.
    pub fn route(&mut self, event: AgentEvent) -> Result<(), ProtocolViolation> {
        let kind = event.kind_name();
        match event {
            AgentEvent::TextDelta { scope, text } => {
                let target = scope_mut(&mut self.root, &mut self.registry, scope.as_deref())?;
                target.push_text(self.sink.as_mut(), &text);
                Ok(())
            }
            AgentEvent::ToolInvocation {
                scope,
                id,
                name,
                input,
            } => self.on_invocation(scope.as_deref(), &id, &name, input),
            AgentEvent::ToolResult {
                scope,
                id,
                is_error,
                content,
            } => self.on_result(
                scope.as_deref(),
                &id,
                ToolResultPayload { is_error, content },
            ),
            AgentEvent::ScopeStart {
                scope,
                parent,
                descriptor,
            } => self.on_scope_start(&scope, parent.as_deref(), &descriptor),
            AgentEvent::ScopeEnd { scope } => {
                self.registry.close(self.sink.as_mut(), &scope)?;
                Ok(())
            }
            AgentEvent::SystemNotice { .. } | AgentEvent::ResponseComplete { .. } => {
                debug!(event = kind, "session-level event ignored by router");
                Ok(())
            }
        }
    }

    fn on_invocation(
        &mut self,
        scope: Option<&str>,
        id: &str,
        name: &str,
        input: Value,
    ) -> Result<(), ProtocolViolation> {
        let mut delegation = self
            .settings
            .delegation_tools
            .contains(name)
            .then(|| DelegationDescriptor::from_value(&input));

        // A scope announced by `ScopeStart` is adopted once, by an invocation
        // from the scope's own parent.
        let announced = match (delegation.take(), self.registry.get(id)) {
            (Some(descriptor), Some(existing)) => {
                if existing.parent() != scope || self.is_recorded(scope, id) {
                    return Err(ProtocolViolation::DuplicateScope {
                        scope: id.to_string(),
                    });
                }
                let known = existing.descriptor().cloned().unwrap_or_default();
                delegation = Some(known.merged(descriptor));
                true
            }
            (descriptor, _) => {
                delegation = descriptor;
                false
            }
        };

        let hints = ToolDisplayHints {
            collapsed: self.settings.collapse_by_default.contains(name),
            delegation: delegation.as_ref().map(DelegationDescriptor::label),
        };
        let target = scope_mut(&mut self.root, &mut self.registry, scope)?;
        target.record_invocation(self.sink.as_mut(), id, name, input, &hints)?;
        debug!(scope = ?scope, invocation = %id, tool = %name, "tool invocation recorded");

        match delegation {
            Some(descriptor) if announced => {
                self.registry.get_mut(id)?.set_descriptor(descriptor);
                debug!(scope = %id, "announced scope adopted by its invocation");
            }
            Some(descriptor) => {
                self.registry.open(scope, id, descriptor)?;
                self.sink.open_scope(id, scope);
            }
            None => {}
        }
        Ok(())
    }

    fn is_recorded(&self, scope: Option<&str>, id: &str) -> bool {
        match scope {
            None => self.root.ledger().contains(id),
            Some(scope) => self
                .registry
                .get(scope)
                .is_some_and(|target| target.ledger().contains(id)),
        }
    }

    fn on_result(
        &mut self,
        scope: Option<&str>,
        id: &str,
        result: ToolResultPayload,
    ) -> Result<(), ProtocolViolation> {
        let target = scope_mut(&mut self.root, &mut self.registry, scope)?;
        let nested = target.complete_invocation(self.sink.as_mut(), id, result)?;
        debug!(scope = ?scope, invocation = %id, "tool invocation completed");

        if let Some(nested) = nested
            && self.registry.contains(&nested)
        {
            self.registry.close(self.sink.as_mut(), &nested)?;
        }
        Ok(())
    }

    fn on_scope_start(
        &mut self,
        scope: &str,
        parent: Option<&str>,
        descriptor: &Value,
    ) -> Result<(), ProtocolViolation> {
        let descriptor = DelegationDescriptor::from_value(descriptor);
        if let Ok(existing) = self.registry.get_mut(scope) {
            if !descriptor.is_empty() {
                existing.set_descriptor(descriptor);
            }
            return Ok(());
        }
        self.registry.open(parent, scope, descriptor)?;
        self.sink.open_scope(scope, parent);
        Ok(())
    }

    /// Ends a top-level response: the root's open unit is closed and the next
    /// text starts a fresh unit.
    pub fn end_turn(&mut self) {
        self.root.finish(self.sink.as_mut());
    }

    /// Feed ended: closes every open unit as-is. Scopes stay registered.
    pub fn finish(&mut self) {
        self.root.finish(self.sink.as_mut());
        self.registry.flush_all(self.sink.as_mut());
    }

    pub fn show_notice(&mut self, text: &str) {
        self.sink.show_notice(text);
    }

    pub fn root(&self) -> &ConversationScope {
        &self.root
    }

    /// Open delegated scope `id`.
    pub fn scope(&self, id: &str) -> Option<&ConversationScope> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Most recent violations, oldest first.
    pub fn violations(&self) -> impl Iterator<Item = &ProtocolViolation> {
        self.violations.iter()
    }

    pub(crate) fn record_violation(&mut self, event: &str, violation: ProtocolViolation) {
        warn!(event, %violation, "protocol violation, event dropped");
        if self.violations.len() == MAX_RECORDED_VIOLATIONS {
            self.violations.pop_front();
        }
        self.violations.push_back(violation);
    }
}

impl std::fmt::Debug for ConversationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRouter")
            .field("root", &self.root)
            .field("registry", &self.registry)
            .field("violations", &self.violations)
            .finish_non_exhaustive()
    }
}

fn scope_mut<'a>(
    root: &'a mut ConversationScope,
    registry: &'a mut TaskRegistry,
    scope: Option<&str>,
) -> Result<&'a mut ConversationScope, ProtocolViolation> {
    match scope {
        None => Ok(root),
        Some(id) => registry.get_mut(id),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::sink::NullSink;
    use crate::test_support::{RecordingSink, SinkCall};

    fn router() -> ConversationRouter {
        ConversationRouter::new(RouterSettings::default(), Box::new(NullSink::default()))
    }

    fn text(scope: Option<&str>, text: &str) -> AgentEvent {
        AgentEvent::TextDelta {
            scope: scope.map(str::to_string),
            text: text.to_string(),
        }
    }

    fn invoke(scope: Option<&str>, id: &str, name: &str, input: Value) -> AgentEvent {
        AgentEvent::ToolInvocation {
            scope: scope.map(str::to_string),
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn result(scope: Option<&str>, id: &str) -> AgentEvent {
        AgentEvent::ToolResult {
            scope: scope.map(str::to_string),
            id: id.to_string(),
            is_error: false,
            content: "done".to_string(),
        }
    }

    #[test]
    fn delegation_opens_and_closes_nested_scope() {
        let mut router = router();
        router.handle(invoke(None, "9", "Task", json!({"description": "dig"})));
        assert!(router.scope("9").is_some());

        router.handle(text(Some("9"), "working"));
        assert_eq!(router.scope("9").unwrap().units()[0].content, "working");

        router.handle(result(None, "9"));
        assert!(router.scope("9").is_none());
        assert!(!router.root().record("9").unwrap().is_pending());
        assert!(router.root().units().is_empty());
        assert_eq!(router.violations().count(), 0);
    }

    #[test]
    fn event_for_unknown_scope_is_dropped() {
        let mut router = router();
        router.handle(text(Some("ghost"), "lost"));

        assert!(router.root().units().is_empty());
        assert_eq!(
            router.violations().collect::<Vec<_>>(),
            vec![&ProtocolViolation::UnknownScope {
                scope: "ghost".to_string()
            }]
        );
    }

    #[test]
    fn nested_tool_calls_stay_in_their_scope() {
        let mut router = router();
        router.handle(invoke(None, "9", "Task", json!({})));
        router.handle(invoke(Some("9"), "10", "Read", json!({})));
        router.handle(result(Some("9"), "10"));

        let nested = router.scope("9").unwrap();
        assert!(nested.record("10").is_some());
        assert!(router.root().record("10").is_none());
    }

    #[test]
    fn scope_end_tears_down_early_and_result_still_completes() {
        let mut router = router();
        router.handle(invoke(None, "9", "Task", json!({})));
        router.handle(AgentEvent::ScopeEnd {
            scope: "9".to_string(),
        });
        assert!(router.scope("9").is_none());

        router.handle(result(None, "9"));
        assert!(!router.root().record("9").unwrap().is_pending());
        assert_eq!(router.violations().count(), 0);
    }

    #[test]
    fn scope_start_replaces_descriptor() {
        let mut router = router();
        router.handle(invoke(None, "9", "Task", json!({})));
        router.handle(AgentEvent::ScopeStart {
            scope: "9".to_string(),
            parent: None,
            descriptor: json!({"description": "late label"}),
        });

        let descriptor = match router.scope("9").unwrap().kind() {
            crate::core::scope::ScopeKind::Delegated { descriptor, .. } => descriptor.clone(),
            crate::core::scope::ScopeKind::Root => unreachable!(),
        };
        assert_eq!(descriptor.description.as_deref(), Some("late label"));
    }

    #[test]
    fn explicit_scope_start_routes_events() {
        let mut router = router();
        router.handle(AgentEvent::ScopeStart {
            scope: "side".to_string(),
            parent: None,
            descriptor: Value::Null,
        });
        router.handle(text(Some("side"), "hi"));
        assert_eq!(router.scope("side").unwrap().units().len(), 1);
    }

    #[test]
    fn violations_are_bounded() {
        let mut router = router();
        for i in 0..100 {
            router.handle(result(None, &i.to_string()));
        }
        assert_eq!(router.violations().count(), MAX_RECORDED_VIOLATIONS);
    }

    #[test]
    fn invocation_adopts_scope_announced_before_it() {
        let sink = RecordingSink::new();
        let mut router = ConversationRouter::new(RouterSettings::default(), Box::new(sink.clone()));
        router.handle(AgentEvent::ScopeStart {
            scope: "9".to_string(),
            parent: None,
            descriptor: json!({"subagent_type": "explorer"}),
        });
        router.handle(invoke(None, "9", "Task", json!({"description": "dig"})));
        router.handle(text(Some("9"), "working"));

        assert_eq!(router.scope("9").unwrap().units()[0].content, "working");
        assert!(router.root().record("9").unwrap().is_pending());
        assert!(sink.calls().iter().any(|call| matches!(
            call,
            SinkCall::ShowInvocation { delegation: Some(label), .. }
                if label == "Task: dig (explorer)"
        )));

        router.handle(result(None, "9"));
        assert!(router.scope("9").is_none());
        assert!(!router.root().record("9").unwrap().is_pending());
        assert_eq!(router.violations().count(), 0);
        assert_eq!(
            sink.calls()
                .iter()
                .filter(|call| matches!(call, SinkCall::OpenScope { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn second_delegation_with_same_id_is_duplicate_scope() {
        let mut router = router();
        router.handle(invoke(None, "9", "Task", json!({})));
        router.handle(invoke(None, "9", "Task", json!({"description": "again"})));

        assert_eq!(router.root().ledger().len(), 1);
        assert_eq!(
            router.violations().collect::<Vec<_>>(),
            vec![&ProtocolViolation::DuplicateScope {
                scope: "9".to_string()
            }]
        );
    }

    #[test]
    fn announced_scope_is_not_adopted_from_another_parent() {
        let mut router = router();
        router.handle(invoke(None, "outer", "Task", json!({})));
        router.handle(AgentEvent::ScopeStart {
            scope: "9".to_string(),
            parent: None,
            descriptor: Value::Null,
        });
        router.handle(invoke(Some("outer"), "9", "Task", json!({})));

        assert!(router.scope("outer").unwrap().record("9").is_none());
        assert!(matches!(
            router.violations().last(),
            Some(ProtocolViolation::DuplicateScope { .. })
        ));
    }

    #[test]
    fn closing_a_scope_notifies_the_sink() {
        let sink = RecordingSink::new();
        let mut router = ConversationRouter::new(RouterSettings::default(), Box::new(sink.clone()));
        router.handle(invoke(None, "9", "Task", json!({})));
        router.handle(AgentEvent::ScopeEnd {
            scope: "9".to_string(),
        });

        assert!(sink.calls().contains(&SinkCall::OpenScope {
            scope: "9".to_string(),
            parent: None,
        }));
        assert_eq!(
            sink.calls().last(),
            Some(&SinkCall::CloseScope {
                scope: "9".to_string()
            })
        );
    }

    #[test]
    fn collapse_by_default_starts_collapsed() {
        let mut router = router();
        router.handle(invoke(None, "1", "WebFetch", json!({"url": "x"})));
        assert!(router.root().display("1").unwrap().is_collapsed());
    }
}
