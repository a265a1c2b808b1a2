//! Lifecycle hooks for observing publish and consume events.
//!
//! Hooks let callers tap the message lifecycle without touching the delivery
//! path: auditing, metrics bridges, and test instrumentation all register a
//! [`MessageHooks`] implementation. Hook failures are the subscriber's
//! problem; the default methods are infallible no-ops and implementations
//! should not panic.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;

use crate::message::Message;

/// Observer of message lifecycle events.
///
/// All methods default to no-ops so implementations only override the events
/// they care about.
#[async_trait]
pub trait MessageHooks: Send + Sync + fmt::Debug {
    /// Called before a message is written to storage by the publisher.
    async fn before_publish(&self, _message: &Message) {}

    /// Called after a message has been durably stored.
    async fn after_publish(&self, _message: &Message) {}

    /// Called after a worker claims a message, before the consumer runs.
    async fn before_consume(&self, _message: &Message) {}

    /// Called after a consume attempt reaches a post-dispatch state
    /// (success, retry scheduled, or failed). Not called when the worker is
    /// cancelled mid-consume.
    async fn after_consume(&self, _message: &Message) {}
}

/// Hooks implementation that ignores every event.
#[derive(Debug, Clone, Default)]
pub struct NoopHooks;

#[async_trait]
impl MessageHooks for NoopHooks {}

/// Fans every event out to a set of subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastHooks {
    subscribers: Vec<Arc<dyn MessageHooks>>,
}

impl MulticastHooks {
    /// Creates an empty multicast with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber. Events are delivered to subscribers concurrently,
    /// in no guaranteed order.
    pub fn add_subscriber(&mut self, subscriber: Arc<dyn MessageHooks>) {
        self.subscribers.push(subscriber);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl MessageHooks for MulticastHooks {
    async fn before_publish(&self, message: &Message) {
        join_all(self.subscribers.iter().map(|s| s.before_publish(message))).await;
    }

    async fn after_publish(&self, message: &Message) {
        join_all(self.subscribers.iter().map(|s| s.after_publish(message))).await;
    }

    async fn before_consume(&self, message: &Message) {
        join_all(self.subscribers.iter().map(|s| s.before_consume(message))).await;
    }

    async fn after_consume(&self, message: &Message) {
        join_all(self.subscribers.iter().map(|s| s.after_consume(message))).await;
    }
}
