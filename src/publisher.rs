//! Publisher: the write-side entry point.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::Result,
    hooks::{MessageHooks, NoopHooks},
    message::{Message, MessageId},
    storage::MessageStore,
    time::{to_chrono, Clock, SystemClock},
};

/// Writes new messages to storage, firing publish hooks around each write.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn MessageStore>,
    hooks: Arc<dyn MessageHooks>,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    /// Creates a publisher with no-op hooks on the system clock.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_hooks(store, Arc::new(NoopHooks), Arc::new(SystemClock))
    }

    /// Creates a publisher with explicit hooks and clock.
    pub fn with_hooks(
        store: Arc<dyn MessageStore>,
        hooks: Arc<dyn MessageHooks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            hooks,
            clock,
        }
    }

    /// Publishes a payload to `topic`, eligible immediately.
    pub async fn publish(&self, topic: &str, data: impl Into<String>) -> Result<MessageId> {
        let message = Message::new(topic, data, self.clock.now());
        self.publish_message(message).await
    }

    /// Publishes a payload into a named queue of `topic`.
    pub async fn publish_to_queue(
        &self,
        topic: &str,
        queue: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<MessageId> {
        let mut message = Message::new(topic, data, self.clock.now());
        message.queue = Some(queue.into());
        self.publish_message(message).await
    }

    /// Publishes a payload that becomes eligible only after `delay`.
    pub async fn publish_delayed(
        &self,
        topic: &str,
        data: impl Into<String>,
        delay: Duration,
    ) -> Result<MessageId> {
        let now = self.clock.now();
        let mut message = Message::new(topic, data, now);
        message.executable_time = now + to_chrono(delay);
        self.publish_message(message).await
    }

    /// Publishes a fully constructed message, for callers that set headers
    /// or combine queue and delay.
    pub async fn publish_message(&self, message: Message) -> Result<MessageId> {
        self.hooks.before_publish(&message).await;
        self.store.publish(&message).await?;
        self.hooks.after_publish(&message).await;
        debug!(
            message_id = %message.id,
            topic = %message.topic,
            "message published"
        );
        Ok(message.id)
    }

    /// Publishes a batch of payloads to `topic` in one storage round trip.
    pub async fn publish_batch<I, S>(&self, topic: &str, payloads: I) -> Result<Vec<MessageId>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now();
        let messages: Vec<Message> = payloads
            .into_iter()
            .map(|data| Message::new(topic, data, now))
            .collect();

        for message in &messages {
            self.hooks.before_publish(message).await;
        }
        self.store.publish_batch(&messages).await?;
        for message in &messages {
            self.hooks.after_publish(message).await;
        }
        debug!(topic, count = messages.len(), "message batch published");
        Ok(messages.iter().map(|m| m.id).collect())
    }
}
