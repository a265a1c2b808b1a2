//! Dispatcher: owns the worker fleet and the background reapers.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::MqConfig,
    consumer::ConsumerRegistry,
    error::Result,
    hooks::{MessageHooks, NoopHooks},
    reaper::{RetentionReaper, StuckMessageReaper},
    storage::MessageStore,
    time::{Clock, SystemClock},
    worker::PollWorker,
};

/// Spawns and supervises poll workers and reapers over one store.
///
/// `start` spawns `parallel_num` workers per registered consumer plus the
/// two reapers, all under a single cancellation token. `stop` cancels the
/// token and drains: workers finish their in-flight message, and after
/// `exit_timeout` any still-running task is forcibly aborted.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    hooks: Arc<dyn MessageHooks>,
    clock: Arc<dyn Clock>,
    config: MqConfig,
    registry: ConsumerRegistry,
    cancel: CancellationToken,
    workers: Vec<Arc<PollWorker>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no-op hooks on the system clock.
    pub fn new(store: Arc<dyn MessageStore>, registry: ConsumerRegistry, config: MqConfig) -> Self {
        Self::with_hooks(
            store,
            registry,
            config,
            Arc::new(NoopHooks),
            Arc::new(SystemClock),
        )
    }

    /// Creates a dispatcher with explicit hooks and clock.
    pub fn with_hooks(
        store: Arc<dyn MessageStore>,
        registry: ConsumerRegistry,
        config: MqConfig,
        hooks: Arc<dyn MessageHooks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            hooks,
            clock,
            config,
            registry,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Initializes storage and spawns workers and reapers.
    ///
    /// A schema initialization failure is logged but does not abort startup;
    /// workers surface storage errors on their own and recover once the
    /// database becomes reachable.
    pub async fn start(&mut self) -> Result<()> {
        if let Err(e) = self.store.init_schema().await {
            error!(error = %e, "schema initialization failed, continuing startup");
        }

        let infos = self.registry.scan();
        if infos.is_empty() {
            info!("no consumers registered");
        }

        let mut worker_id = 0;
        for info in &infos {
            let parallel = info.options.parallel_num.max(1);
            info!(
                consumer = %info.name,
                topic = %info.options.topic,
                workers = parallel,
                "starting consumer"
            );
            for _ in 0..parallel {
                let worker = Arc::new(PollWorker::new(
                    worker_id,
                    info.clone(),
                    self.store.clone(),
                    self.hooks.clone(),
                    self.clock.clone(),
                    self.cancel.clone(),
                ));
                worker_id += 1;
                let handle = {
                    let worker = worker.clone();
                    tokio::spawn(async move { worker.run().await })
                };
                self.workers.push(worker);
                self.tasks.push(handle);
            }
        }

        let stuck = StuckMessageReaper::new(
            self.store.clone(),
            &infos,
            self.clock.clone(),
            self.cancel.clone(),
        );
        self.tasks.push(tokio::spawn(async move { stuck.run().await }));

        let retention = RetentionReaper::new(
            self.store.clone(),
            &self.config,
            self.clock.clone(),
            self.cancel.clone(),
        );
        self.tasks
            .push(tokio::spawn(async move { retention.run().await }));

        info!(workers = self.workers.len(), "dispatcher started");
        Ok(())
    }

    /// Signals shutdown and waits for workers to drain.
    ///
    /// Waits up to `exit_timeout` for every worker to finish its in-flight
    /// message; whatever is still running after that is aborted, with a
    /// warning naming the topics that did not drain.
    pub async fn stop(&mut self) {
        info!("dispatcher shutdown requested");
        self.cancel.cancel();

        let drain = async {
            loop {
                let pending = self.pending_topics();
                if pending.is_empty() {
                    break;
                }
                warn!(topics = ?pending, "waiting for workers to drain");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        };

        if tokio::time::timeout(self.config.exit_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                topics = ?self.pending_topics(),
                timeout_secs = self.config.exit_timeout.as_secs(),
                "drain timed out, forcing exit"
            );
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.workers.clear();
        info!("dispatcher stopped");
    }

    /// Whether any worker loop is still executing.
    pub fn has_active_workers(&self) -> bool {
        self.workers.iter().any(|w| w.is_running())
    }

    /// Number of worker loops still executing.
    pub fn active_worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    fn pending_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.is_running())
            .map(|w| w.consumer_info().options.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .field("active", &self.active_worker_count())
            .finish_non_exhaustive()
    }
}
