//! Protocol violations detected while routing the inbound feed.
//!
//! A violation is always recovered locally: it is logged, the offending event is
//! dropped, and processing continues.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("malformed event: {reason}")]
    Malformed { reason: String },

    #[error("duplicate tool invocation id {id}")]
    DuplicateInvocation { id: String },

    #[error("tool result for unknown invocation id {id}")]
    UnknownInvocation { id: String },

    #[error("event for unknown scope {scope}")]
    UnknownScope { scope: String },

    #[error("scope {scope} is already open")]
    DuplicateScope { scope: String },
}
