//! Event stream consumer.
//!
//! The single ordered consumption path of a connection. Items are validated one
//! at a time and applied to the session in arrival order; anything malformed is
//! logged and dropped so the feed keeps flowing.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::events::{AgentEvent, FeedItem};
use crate::core::session::Session;

#[derive(Debug)]
pub struct EventStreamConsumer {
    session: Session,
    dropped: usize,
}

impl EventStreamConsumer {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            dropped: 0,
        }
    }

    /// Validates and applies one item.
    pub fn push(&mut self, item: impl Into<FeedItem>) {
        match item.into().into_event() {
            Ok(event) => self.session.apply(event),
            Err(violation) => {
                warn!(%violation, "dropping malformed event");
                self.dropped += 1;
                self.session.reject(violation);
            }
        }
    }

    /// Applies one JSONL line. Blank lines are skipped.
    pub fn push_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match AgentEvent::from_json_line(line) {
            Ok(event) => self.push(event),
            Err(violation) => {
                warn!(%violation, "dropping malformed event");
                self.dropped += 1;
                self.session.reject(violation);
            }
        }
    }

    /// Consumes the feed until every sender is dropped, then closes open units.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FeedItem>) -> Session {
        while let Some(item) = rx.recv().await {
            self.push(item);
        }
        if self.dropped > 0 {
            info!(dropped = self.dropped, "malformed events dropped from feed");
        }
        self.finish()
    }

    /// Ends consumption and returns the session.
    pub fn finish(mut self) -> Session {
        self.session.finish();
        self.session
    }

    /// Items dropped as malformed so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::Config;
    use crate::core::permission::NoopPrompts;
    use crate::core::queues::ObservabilityQueues;
    use crate::core::sink::NullSink;

    fn consumer() -> EventStreamConsumer {
        EventStreamConsumer::new(Session::new(
            &Config::default(),
            ObservabilityQueues::new(),
            Box::new(NullSink::default()),
            Arc::new(NoopPrompts),
        ))
    }

    #[test]
    fn malformed_items_are_dropped_and_feed_continues() {
        let mut consumer = consumer();
        consumer.push(json!({"type": "text_delta", "text": "a"}));
        consumer.push(json!({"type": "mystery"}));
        consumer.push_line("{broken");
        consumer.push_line("   ");
        consumer.push_line(r#"{"type":"text_delta","text":"b"}"#);

        assert_eq!(consumer.dropped(), 2);
        let root = consumer.session().router().root();
        assert_eq!(root.units()[0].content, "ab");
        assert_eq!(consumer.session().router().violations().count(), 2);
    }

    #[tokio::test]
    async fn run_closes_open_units_at_end_of_feed() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(FeedItem::from(json!({"type": "text_delta", "text": "partial"})))
            .unwrap();
        drop(tx);

        let session = consumer().run(rx).await;

        let root = session.router().root();
        assert!(root.open_unit().is_none());
        assert_eq!(root.units()[0].content, "partial");
    }
}
