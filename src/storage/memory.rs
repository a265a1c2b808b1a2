//! In-memory [`MessageStore`] for tests and embedded use.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::{MqError, Result},
    message::{Message, MessageId, MessageStatus},
    storage::{MessageStore, QueueFilter},
    time::{Clock, SystemClock},
};

/// Non-durable store backed by a `HashMap`.
///
/// Claim ordering follows `(create_time, id)` so behavior matches the
/// SQLite adapter's oldest-first claim. Intended for tests and prototyping;
/// nothing survives a restart.
#[derive(Debug)]
pub struct MemoryStore {
    messages: RwLock<HashMap<MessageId, Message>>,
    clock: Arc<dyn Clock>,
    fail_next_claim: Mutex<Option<String>>,
}

impl MemoryStore {
    /// Creates an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            clock,
            fail_next_claim: Mutex::new(None),
        }
    }

    /// Makes the next `claim` call fail with a storage error. Test helper.
    pub fn inject_claim_error(&self, message: impl Into<String>) {
        *lock_or_recover(&self.fail_next_claim) = Some(message.into());
    }

    /// Returns a snapshot of a message by ID. Test helper.
    pub async fn get(&self, id: MessageId) -> Option<Message> {
        self.messages.read().await.get(&id).cloned()
    }

    /// Inserts a message verbatim, bypassing publish. Test helper.
    pub async fn insert(&self, message: Message) {
        self.messages.write().await.insert(message.id, message);
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Whether the store holds no messages.
    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    async fn update<F>(&self, id: MessageId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Message),
    {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| MqError::storage(format!("message not found: {id}")))?;
        f(message);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        self.messages
            .write()
            .await
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn publish_batch(&self, messages: &[Message]) -> Result<()> {
        let mut guard = self.messages.write().await;
        for message in messages {
            guard.insert(message.id, message.clone());
        }
        Ok(())
    }

    async fn claim(&self, topic: &str, queue: QueueFilter<'_>) -> Result<Option<Message>> {
        if let Some(error) = lock_or_recover(&self.fail_next_claim).take() {
            return Err(MqError::storage(error));
        }

        let now = self.clock.now();
        let mut messages = self.messages.write().await;

        let candidate = messages
            .values()
            .filter(|m| {
                m.topic == topic
                    && m.status == MessageStatus::Waiting
                    && m.executable_time <= now
                    && queue.matches(m.queue.as_deref())
            })
            .min_by(|a, b| {
                (a.create_time, a.id.0).cmp(&(b.create_time, b.id.0))
            })
            .map(|m| m.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let message = messages.get_mut(&id).ok_or_else(|| {
            MqError::storage(format!("claim candidate vanished: {id}"))
        })?;
        message.status = MessageStatus::Processing;
        message.executable_time = now;
        Ok(Some(message.clone()))
    }

    async fn ack(&self, id: MessageId) -> Result<()> {
        self.update(id, |m| m.status = MessageStatus::Success).await
    }

    async fn nack(&self, id: MessageId) -> Result<()> {
        self.update(id, |m| m.status = MessageStatus::Failed).await
    }

    async fn retry_update(
        &self,
        id: MessageId,
        retry_count: u32,
        executable_time: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, |m| {
            m.status = MessageStatus::Waiting;
            m.retry_count = retry_count;
            m.executable_time = executable_time;
        })
        .await
    }

    async fn reset_to_waiting(&self, id: MessageId) -> Result<()> {
        self.update(id, |m| m.status = MessageStatus::Waiting).await
    }

    async fn list_queues(&self, topic: &str) -> Result<Vec<Option<String>>> {
        let now = self.clock.now();
        let messages = self.messages.read().await;
        let queues: BTreeSet<Option<String>> = messages
            .values()
            .filter(|m| {
                m.topic == topic
                    && m.status == MessageStatus::Waiting
                    && m.executable_time <= now
            })
            .map(|m| m.queue.clone())
            .collect();
        Ok(queues.into_iter().collect())
    }

    async fn reset_expired(&self, topic: &str, deadline: DateTime<Utc>) -> Result<u64> {
        let now = self.clock.now();
        let mut messages = self.messages.write().await;
        let mut reset = 0;
        for message in messages.values_mut() {
            if message.topic == topic
                && message.status == MessageStatus::Processing
                && message.executable_time <= deadline
            {
                message.status = MessageStatus::Waiting;
                message.executable_time = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut messages = self.messages.write().await;
        let initial = messages.len();
        messages.retain(|_, m| m.create_time > before);
        Ok((initial - messages.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::time::TestClock;

    fn store_at(clock: Arc<TestClock>) -> MemoryStore {
        MemoryStore::with_clock(clock)
    }

    #[tokio::test]
    async fn claim_moves_oldest_waiting_to_processing() {
        let clock = Arc::new(TestClock::new());
        let store = store_at(clock.clone());
        let now = clock.now();

        let mut older = Message::new("orders", "first", now - ChronoDuration::seconds(10));
        older.executable_time = older.create_time;
        let newer = Message::new("orders", "second", now);
        store.publish(&older).await.unwrap();
        store.publish(&newer).await.unwrap();

        let claimed = store.claim("orders", QueueFilter::Any).await.unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, MessageStatus::Processing);
        assert_eq!(claimed.executable_time, now);
    }

    #[tokio::test]
    async fn claim_skips_future_executable_time() {
        let clock = Arc::new(TestClock::new());
        let store = store_at(clock.clone());

        let mut delayed = Message::new("orders", "{}", clock.now());
        delayed.executable_time = clock.now() + ChronoDuration::seconds(60);
        store.publish(&delayed).await.unwrap();

        assert!(store.claim("orders", QueueFilter::Any).await.unwrap().is_none());

        clock.advance(std::time::Duration::from_secs(61));
        assert!(store.claim("orders", QueueFilter::Any).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_respects_queue_filter() {
        let clock = Arc::new(TestClock::new());
        let store = store_at(clock.clone());

        let mut tenant_a = Message::new("orders", "a", clock.now());
        tenant_a.queue = Some("tenant-a".to_string());
        let unpartitioned = Message::new("orders", "b", clock.now());
        store.publish(&tenant_a).await.unwrap();
        store.publish(&unpartitioned).await.unwrap();

        let claimed = store.claim("orders", QueueFilter::Exact(Some("tenant-a"))).await.unwrap().unwrap();
        assert_eq!(claimed.id, tenant_a.id);

        assert!(store.claim("orders", QueueFilter::Exact(Some("tenant-a"))).await.unwrap().is_none());

        // The unpartitioned queue is addressable on its own; a named-queue
        // message never satisfies it.
        let claimed = store.claim("orders", QueueFilter::Exact(None)).await.unwrap().unwrap();
        assert_eq!(claimed.id, unpartitioned.id);
        assert!(store.claim("orders", QueueFilter::Exact(None)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_queues_includes_null_partition() {
        let clock = Arc::new(TestClock::new());
        let store = store_at(clock.clone());

        let mut partitioned = Message::new("orders", "a", clock.now());
        partitioned.queue = Some("tenant-a".to_string());
        store.publish(&partitioned).await.unwrap();
        store
            .publish(&Message::new("orders", "b", clock.now()))
            .await
            .unwrap();
        store
            .publish(&Message::new("other", "c", clock.now()))
            .await
            .unwrap();

        let queues = store.list_queues("orders").await.unwrap();
        assert_eq!(queues.len(), 2);
        assert!(queues.contains(&None));
        assert!(queues.contains(&Some("tenant-a".to_string())));

        // Queues with no claimable work drop out of the listing.
        store.claim("orders", QueueFilter::Exact(Some("tenant-a"))).await.unwrap().unwrap();
        let queues = store.list_queues("orders").await.unwrap();
        assert_eq!(queues, vec![None]);
    }

    #[tokio::test]
    async fn reset_expired_refreshes_eligibility() {
        let clock = Arc::new(TestClock::new());
        let store = store_at(clock.clone());
        let start = clock.now();

        let message = Message::new("orders", "{}", start);
        store.publish(&message).await.unwrap();
        store.claim("orders", QueueFilter::Any).await.unwrap().unwrap();

        clock.advance(std::time::Duration::from_secs(120));
        let deadline = clock.now() - ChronoDuration::seconds(60);
        let reset = store.reset_expired("orders", deadline).await.unwrap();
        assert_eq!(reset, 1);

        let recovered = store.get(message.id).await.unwrap();
        assert_eq!(recovered.status, MessageStatus::Waiting);
        assert_eq!(recovered.executable_time, clock.now());
    }

    #[tokio::test]
    async fn purge_removes_old_rows_of_any_status() {
        let clock = Arc::new(TestClock::new());
        let store = store_at(clock.clone());

        let old = Message::new("orders", "{}", clock.now() - ChronoDuration::days(8));
        store.publish(&old).await.unwrap();
        store.ack(old.id).await.unwrap();
        store
            .publish(&Message::new("orders", "{}", clock.now()))
            .await
            .unwrap();

        let purged = store
            .purge(clock.now() - ChronoDuration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn injected_claim_error_fires_once() {
        let store = MemoryStore::new();
        store.inject_claim_error("database unavailable");

        assert!(store.claim("orders", QueueFilter::Any).await.is_err());
        assert!(store.claim("orders", QueueFilter::Any).await.unwrap().is_none());
    }
}
