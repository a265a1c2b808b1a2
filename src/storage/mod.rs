//! Storage abstraction for durable messages.
//!
//! All state transitions go through [`MessageStore`]; workers and reapers
//! never touch the backing database directly. The contract's load-bearing
//! guarantee is [`MessageStore::claim`]: under concurrent callers, each
//! Waiting message is handed to exactly one claimant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    message::{Message, MessageId},
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Queue constraint for [`MessageStore::claim`].
///
/// The unpartitioned (NULL) queue is addressable in its own right:
/// `Exact(None)` targets it exclusively, which the fairness selector relies
/// on so unpartitioned messages rotate like any named queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFilter<'a> {
    /// Any message of the topic, regardless of queue.
    Any,
    /// Only messages in exactly this queue; `None` means the unpartitioned
    /// queue.
    Exact(Option<&'a str>),
}

impl QueueFilter<'_> {
    /// Whether a message's queue satisfies this filter.
    pub fn matches(self, queue: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => queue == expected,
        }
    }
}

/// Storage backend for message persistence and state transitions.
///
/// Implementations must make `claim` atomic: two concurrent claims for the
/// same topic must never return the same message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Creates the message table and indexes if they do not already exist.
    /// Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Durably stores a new message.
    async fn publish(&self, message: &Message) -> Result<()>;

    /// Durably stores a batch of messages in a single round trip where the
    /// backend supports it.
    async fn publish_batch(&self, messages: &[Message]) -> Result<()>;

    /// Atomically claims the oldest eligible Waiting message for `topic`,
    /// moving it to Processing and stamping its `executable_time` to now.
    ///
    /// A message is eligible when its status is Waiting, its
    /// `executable_time` is not in the future, and its queue satisfies
    /// `queue`. Returns `Ok(None)` when nothing is eligible.
    async fn claim(&self, topic: &str, queue: QueueFilter<'_>) -> Result<Option<Message>>;

    /// Marks a message Success. Terminal.
    async fn ack(&self, id: MessageId) -> Result<()>;

    /// Marks a message Failed. Terminal.
    async fn nack(&self, id: MessageId) -> Result<()>;

    /// Schedules a retry: returns the message to Waiting with the given
    /// retry count and next eligibility time.
    async fn retry_update(
        &self,
        id: MessageId,
        retry_count: u32,
        executable_time: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns a Processing message to Waiting without touching its retry
    /// count. Used for cancellation recovery.
    async fn reset_to_waiting(&self, id: MessageId) -> Result<()>;

    /// Lists the distinct queue values that currently hold claimable work
    /// for `topic` (Waiting status, `executable_time` not in the future),
    /// including `None` when unpartitioned messages qualify.
    async fn list_queues(&self, topic: &str) -> Result<Vec<Option<String>>>;

    /// Returns every Processing message of `topic` whose `executable_time`
    /// is at or before `deadline` back to Waiting, refreshing its
    /// `executable_time` to now. Returns the number of rows reset.
    async fn reset_expired(&self, topic: &str, deadline: DateTime<Utc>) -> Result<u64>;

    /// Deletes every message created at or before `before`, regardless of
    /// status. Returns the number of rows deleted.
    async fn purge(&self, before: DateTime<Utc>) -> Result<u64>;
}
