//! Consumer trait, per-consumer options, and the registry workers are
//! spawned from.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;

/// Handles messages claimed from one topic.
///
/// `consume` receives the raw payload. Its return value drives the message's
/// next state:
///
/// - `Ok(true)` acknowledges the message (Success);
/// - `Ok(false)` or an error requests a retry, or Failed once retries are
///   exhausted;
/// - [`MqError::Cancelled`](crate::MqError::Cancelled) tells the worker the
///   consumer stopped because shutdown was requested, so the message is
///   returned to Waiting untouched.
///
/// The cancellation token is the shutdown signal; long-running consumers
/// should watch it and bail out with `MqError::Cancelled` when it fires.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Delivery options for this consumer.
    fn options(&self) -> ConsumerOptions;

    /// Processes one message payload.
    async fn consume(&self, payload: &str, cancel: CancellationToken) -> Result<bool>;
}

/// Per-consumer delivery tuning.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Topic this consumer claims messages from.
    pub topic: String,

    /// When `true`, each claim targets a randomly chosen queue of the topic,
    /// never the same queue twice in a row while more than one exists.
    pub enable_random_queue: bool,

    /// How long a worker sleeps after finding no eligible message.
    pub poll_interval: Duration,

    /// Maximum retry attempts before a message is marked Failed.
    /// Zero means any non-success outcome fails immediately.
    pub retry_count: u32,

    /// Delay before a retried message becomes eligible again.
    pub retry_interval: Duration,

    /// Number of parallel workers for this consumer.
    pub parallel_num: usize,

    /// When set, the stuck-message reaper returns Processing messages of
    /// this topic to Waiting once they have been held longer than this.
    /// `None` opts the topic out of stuck recovery.
    pub reset_interval: Option<Duration>,
}

impl ConsumerOptions {
    /// Options for `topic` with the default tuning: poll every 2 seconds,
    /// no retries, 5 second retry delay, one worker, no stuck recovery.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            enable_random_queue: false,
            poll_interval: Duration::from_secs(2),
            retry_count: 0,
            retry_interval: Duration::from_secs(5),
            parallel_num: 1,
            reset_interval: None,
        }
    }
}

/// Produces a consumer instance per dispatch, mirroring scoped-lifetime
/// dependency injection: returning `None` means the consumer could not be
/// constructed for this dispatch.
pub type ConsumerFactory = Arc<dyn Fn() -> Option<Arc<dyn Consumer>> + Send + Sync>;

/// A registered consumer: its name, resolved options, and factory.
#[derive(Clone)]
pub struct ConsumerInfo {
    /// Registration name, used in logs.
    pub name: String,

    /// Options captured at registration time.
    pub options: ConsumerOptions,

    factory: ConsumerFactory,
}

impl ConsumerInfo {
    /// Builds a fresh consumer instance for one dispatch.
    pub fn resolve(&self) -> Option<Arc<dyn Consumer>> {
        (self.factory)()
    }
}

impl fmt::Debug for ConsumerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerInfo")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Collects consumers before the dispatcher starts.
#[derive(Default)]
pub struct ConsumerRegistry {
    entries: Vec<(String, ConsumerFactory)>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer built fresh for every dispatch.
    pub fn register<F, C>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: Consumer + 'static,
    {
        let factory: ConsumerFactory = Arc::new(move || {
            let consumer: Arc<dyn Consumer> = Arc::new(factory());
            Some(consumer)
        });
        self.entries.push((name.into(), factory));
        self
    }

    /// Registers a single shared consumer instance, reused for every
    /// dispatch.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        consumer: Arc<dyn Consumer>,
    ) -> &mut Self {
        let factory: ConsumerFactory = Arc::new(move || Some(consumer.clone()));
        self.entries.push((name.into(), factory));
        self
    }

    /// Registers a raw factory that may fail to produce a consumer.
    pub fn register_factory(
        &mut self,
        name: impl Into<String>,
        factory: ConsumerFactory,
    ) -> &mut Self {
        self.entries.push((name.into(), factory));
        self
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no consumers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves each registration once to capture its options. Factories
    /// that produce nothing are skipped with a warning.
    pub fn scan(&self) -> Vec<ConsumerInfo> {
        let mut infos = Vec::with_capacity(self.entries.len());
        for (name, factory) in &self.entries {
            match factory() {
                Some(consumer) => infos.push(ConsumerInfo {
                    name: name.clone(),
                    options: consumer.options(),
                    factory: factory.clone(),
                }),
                None => {
                    warn!(consumer = %name, "consumer factory produced no instance, skipping");
                }
            }
        }
        infos
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("ConsumerRegistry")
            .field("consumers", &names)
            .finish()
    }
}
