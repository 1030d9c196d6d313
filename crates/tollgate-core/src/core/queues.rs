//! Observability queues.
//!
//! Passive fan-out of pending-request and completed-turn notifications. Every
//! subscriber owns an unbounded receiver and drains it at its own pace; publishing
//! never awaits, so a slow or absent observer cannot stall the gate or the router.
//! Closed subscribers are dropped on the next publish.
//!
//! While nobody is subscribed, notices are held back and handed in order to the
//! next subscriber, so an observer that attaches late still sees them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::events::Usage;
use crate::core::permission::PermissionRequest;

/// Published once per transition into `AwaitingResolution`.
#[derive(Debug, Clone)]
pub struct PendingRequestNotice {
    pub connection_id: Uuid,
    pub request: Arc<PermissionRequest>,
}

/// Published once per finished top-level response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurnNotice {
    pub connection_id: Uuid,
    pub session_id: Option<String>,
    pub usage: Option<Usage>,
}

struct Subscribers<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    backlog: VecDeque<T>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            backlog: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct QueuesInner {
    pending: Mutex<Subscribers<PendingRequestNotice>>,
    completed: Mutex<Subscribers<CompletedTurnNotice>>,
}

/// Cloneable handle to the notification queues; clones share subscribers.
#[derive(Clone, Default)]
pub struct ObservabilityQueues {
    inner: Arc<QueuesInner>,
}

impl ObservabilityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to pending-request notifications.
    ///
    /// Notices published while nobody was subscribed are delivered first.
    pub fn subscribe_pending(&self) -> mpsc::UnboundedReceiver<PendingRequestNotice> {
        subscribe(&self.inner.pending)
    }

    /// Subscribes to completed-turn notifications.
    ///
    /// Notices published while nobody was subscribed are delivered first.
    pub fn subscribe_completed(&self) -> mpsc::UnboundedReceiver<CompletedTurnNotice> {
        subscribe(&self.inner.completed)
    }

    pub(crate) fn publish_pending(&self, notice: PendingRequestNotice) {
        fan_out(&self.inner.pending, notice);
    }

    pub(crate) fn publish_completed(&self, notice: CompletedTurnNotice) {
        fan_out(&self.inner.completed, notice);
    }
}

impl std::fmt::Debug for ObservabilityQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityQueues").finish_non_exhaustive()
    }
}

fn subscribe<T>(subscribers: &Mutex<Subscribers<T>>) -> mpsc::UnboundedReceiver<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    // `rx` is alive, so these sends cannot fail.
    for notice in subscribers.backlog.drain(..) {
        let _ = tx.send(notice);
    }
    subscribers.senders.push(tx);
    rx
}

fn fan_out<T: Clone>(subscribers: &Mutex<Subscribers<T>>, item: T) {
    let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subscribers.senders.retain(|tx| tx.send(item.clone()).is_ok());
    if subscribers.senders.is_empty() {
        subscribers.backlog.push_back(item);
    }
}
