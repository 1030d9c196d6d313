//! Task/subagent registry.
//!
//! Delegated scopes are keyed by the id of the invocation that opened them.
//! Closing a scope flushes its open unit and removes it; scopes nested inside it
//! are closed first.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::core::scope::{ConversationScope, DelegationDescriptor};
use crate::core::sink::RenderSink;
use crate::core::violation::ProtocolViolation;

#[derive(Debug)]
pub struct TaskRegistry {
    scopes: HashMap<String, ConversationScope>,
    recent_limit: usize,
}

impl TaskRegistry {
    pub fn new(recent_limit: usize) -> Self {
        Self {
            scopes: HashMap::new(),
            recent_limit,
        }
    }

    /// Opens a nested scope under `parent` (`None` = root).
    ///
    /// # Errors
    /// `DuplicateScope` if `id` is already open; `UnknownScope` if `parent` is not.
    pub fn open(
        &mut self,
        parent: Option<&str>,
        id: &str,
        descriptor: DelegationDescriptor,
    ) -> Result<&mut ConversationScope, ProtocolViolation> {
        if self.scopes.contains_key(id) {
            return Err(ProtocolViolation::DuplicateScope {
                scope: id.to_string(),
            });
        }
        if let Some(parent) = parent
            && !self.scopes.contains_key(parent)
        {
            return Err(ProtocolViolation::UnknownScope {
                scope: parent.to_string(),
            });
        }
        debug!(scope = %id, parent = ?parent, "scope opened");
        let scope = ConversationScope::delegated(id, parent, descriptor, self.recent_limit);
        Ok(self.scopes.entry(id.to_string()).or_insert(scope))
    }

    /// Flushes and removes scope `id`, closing its nested scopes first.
    ///
    /// # Errors
    /// `UnknownScope` if `id` is not open.
    pub fn close(
        &mut self,
        sink: &mut dyn RenderSink,
        id: &str,
    ) -> Result<ConversationScope, ProtocolViolation> {
        if !self.scopes.contains_key(id) {
            return Err(ProtocolViolation::UnknownScope {
                scope: id.to_string(),
            });
        }

        let children: Vec<String> = self
            .scopes
            .values()
            .filter(|s| s.parent() == Some(id))
            .filter_map(|s| s.id().map(str::to_string))
            .collect();
        for child in children {
            warn!(scope = %child, parent = %id, "closing nested scope left open by its parent");
            let _ = self.close(sink, &child);
        }

        let mut scope = self
            .scopes
            .remove(id)
            .ok_or_else(|| ProtocolViolation::UnknownScope {
                scope: id.to_string(),
            })?;
        scope.finish(sink);
        sink.close_scope(id);
        debug!(scope = %id, "scope closed");
        Ok(scope)
    }

    /// Flushes every open unit without removing any scope.
    pub fn flush_all(&mut self, sink: &mut dyn RenderSink) {
        for scope in self.scopes.values_mut() {
            scope.finish(sink);
        }
    }

    /// # Errors
    /// `UnknownScope` if `id` is not open.
    pub fn get_mut(&mut self, id: &str) -> Result<&mut ConversationScope, ProtocolViolation> {
        self.scopes
            .get_mut(id)
            .ok_or_else(|| ProtocolViolation::UnknownScope {
                scope: id.to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Option<&ConversationScope> {
        self.scopes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scopes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
