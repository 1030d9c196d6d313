//! Tool invocation ledger.
//!
//! Pure bookkeeping of in-flight tool calls for one scope. An invocation id
//! resolves at most once; duplicate registrations and results for unknown ids
//! are reported as `ProtocolViolation`s and leave the ledger unchanged.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::core::violation::ProtocolViolation;

/// Outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolOutcome {
    Pending,
    Completed(ToolResultPayload),
}

/// Result content delivered by a `ToolResult` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResultPayload {
    pub is_error: bool,
    pub content: String,
}

/// One tool invocation and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocationRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    /// Owning scope (`None` for the root conversation).
    pub scope: Option<String>,
    pub outcome: ToolOutcome,
}

impl ToolInvocationRecord {
    pub fn is_pending(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Pending)
    }

    pub fn result(&self) -> Option<&ToolResultPayload> {
        match &self.outcome {
            ToolOutcome::Pending => None,
            ToolOutcome::Completed(result) => Some(result),
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolLedger {
    records: HashMap<String, ToolInvocationRecord>,
    order: Vec<String>,
}

impl ToolLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new pending invocation.
    ///
    /// # Errors
    /// Returns `DuplicateInvocation` if `id` is already recorded; the ledger is unchanged.
    pub fn register(
        &mut self,
        scope: Option<&str>,
        id: &str,
        name: &str,
        input: Value,
    ) -> Result<&ToolInvocationRecord, ProtocolViolation> {
        if self.records.contains_key(id) {
            return Err(ProtocolViolation::DuplicateInvocation { id: id.to_string() });
        }
        self.order.push(id.to_string());
        let record = ToolInvocationRecord {
            id: id.to_string(),
            name: name.to_string(),
            input,
            scope: scope.map(str::to_string),
            outcome: ToolOutcome::Pending,
        };
        Ok(&*self.records.entry(id.to_string()).or_insert(record))
    }

    /// Marks a pending invocation as completed.
    ///
    /// # Errors
    /// Returns `UnknownInvocation` if `id` was never registered or already resolved.
    pub fn resolve(
        &mut self,
        id: &str,
        result: ToolResultPayload,
    ) -> Result<&ToolInvocationRecord, ProtocolViolation> {
        match self.records.get_mut(id) {
            Some(record) if record.is_pending() => {
                record.outcome = ToolOutcome::Completed(result);
                Ok(&*record)
            }
            _ => Err(ProtocolViolation::UnknownInvocation { id: id.to_string() }),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ToolInvocationRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Records in registration order.
    pub fn records(&self) -> impl Iterator<Item = &ToolInvocationRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn pending_count(&self) -> usize {
        self.records.values().filter(|r| r.is_pending()).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ok_result(content: &str) -> ToolResultPayload {
        ToolResultPayload {
            is_error: false,
            content: content.to_string(),
        }
    }

    #[test]
    fn register_then_resolve_completes_record() {
        let mut ledger = ToolLedger::new();
        ledger
            .register(None, "7", "Read", json!({"file_path": "a.rs"}))
            .unwrap();
        assert_eq!(ledger.pending_count(), 1);

        let record = ledger.resolve("7", ok_result("fn main() {}")).unwrap();
        assert_eq!(record.result(), Some(&ok_result("fn main() {}")));
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn duplicate_register_leaves_original_record() {
        let mut ledger = ToolLedger::new();
        ledger.register(None, "1", "Read", json!({})).unwrap();

        let err = ledger.register(None, "1", "Bash", json!({})).unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::DuplicateInvocation {
                id: "1".to_string()
            }
        );
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get("1").unwrap().name, "Read");
    }

    #[test]
    fn resolve_unknown_id_is_a_violation() {
        let mut ledger = ToolLedger::new();
        let err = ledger.resolve("missing", ok_result("")).unwrap_err();
        assert!(matches!(err, ProtocolViolation::UnknownInvocation { .. }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn second_resolve_keeps_first_result() {
        let mut ledger = ToolLedger::new();
        ledger.register(None, "1", "Read", json!({})).unwrap();
        ledger.resolve("1", ok_result("first")).unwrap();

        assert!(ledger.resolve("1", ok_result("second")).is_err());
        assert_eq!(ledger.get("1").unwrap().result(), Some(&ok_result("first")));
    }

    #[test]
    fn records_iterate_in_registration_order() {
        let mut ledger = ToolLedger::new();
        for id in ["c", "a", "b"] {
            ledger.register(Some("task"), id, "Read", json!({})).unwrap();
        }
        let ids: Vec<&str> = ledger.records().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(ledger.records().all(|r| r.scope.as_deref() == Some("task")));
    }
}
