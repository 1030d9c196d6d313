//! Core module: UI-agnostic routing and permission negotiation.
//!
//! This module contains:
//! - `events`: Inbound agent event types
//! - `violation`: Protocol violations recovered while routing
//! - `ledger`: Per-scope tool invocation bookkeeping
//! - `policy`: Tool categories and the auto-approval policy
//! - `permission`: Permission gate and write-once decisions
//! - `question`: Answers collected for the question tool
//! - `sink`: Rendering sink driven by the router
//! - `scope`: Conversation scopes, message units and tool displays
//! - `registry`: Delegated scope registry
//! - `router`: Scope-aware conversation router
//! - `queues`: Pending-request and completed-turn notifications
//! - `consumer`: Ordered event feed consumption
//! - `session`: Live connection state and the connection manager

pub mod consumer;
pub mod events;
pub mod ledger;
pub mod permission;
pub mod policy;
pub mod queues;
pub mod question;
pub mod registry;
pub mod router;
pub mod scope;
pub mod session;
pub mod sink;
pub mod violation;
