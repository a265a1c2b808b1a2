//! Poll worker: claims messages for one consumer and drives each through
//! consume, ack, retry, or failure.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    consumer::ConsumerInfo,
    error::Result,
    hooks::MessageHooks,
    message::{Message, MessageStatus},
    storage::{MessageStore, QueueFilter},
    time::{to_chrono, Clock},
};

/// Outcome of dispatching one claimed message.
enum DispatchOutcome {
    /// The message reached a post-dispatch state (Success, retry, Failed).
    Completed,
    /// The consumer bailed out because shutdown was requested; the message
    /// is still Processing and must be returned to Waiting.
    Cancelled(Message),
}

/// One polling loop bound to a single consumer registration.
///
/// A worker alternates between claiming and dispatching until its
/// cancellation token fires. Claims are serialized within a worker; running
/// `parallel_num` workers gives a consumer that much claim concurrency.
pub struct PollWorker {
    id: usize,
    info: ConsumerInfo,
    store: Arc<dyn MessageStore>,
    hooks: Arc<dyn MessageHooks>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl PollWorker {
    /// Creates a worker. It does nothing until [`run`](Self::run) is called.
    pub fn new(
        id: usize,
        info: ConsumerInfo,
        store: Arc<dyn MessageStore>,
        hooks: Arc<dyn MessageHooks>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            info,
            store,
            hooks,
            clock,
            cancel,
            running: AtomicBool::new(false),
        }
    }

    /// Whether the worker's loop is still executing. Stays `true` while a
    /// consume call is in flight, which is what the dispatcher's drain loop
    /// watches during shutdown.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The consumer registration this worker serves.
    pub fn consumer_info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Runs the poll loop until cancellation.
    ///
    /// An in-flight consume call is awaited to completion (or until the
    /// consumer honors the token and returns `Cancelled`); only the
    /// between-poll sleep is aborted eagerly.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            worker_id = self.id,
            consumer = %self.info.name,
            topic = %self.info.options.topic,
            "poll worker started"
        );

        // Queue claimed by the previous successful claim, tracked only for
        // random-queue fairness. Outer None means no previous claim yet.
        let mut last_queue: Option<Option<String>> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let claimed = match self.claim_next(&mut last_queue).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(
                        worker_id = self.id,
                        topic = %self.info.options.topic,
                        error = %e,
                        "claim failed"
                    );
                    None
                }
            };

            match claimed {
                Some(message) => {
                    if let DispatchOutcome::Cancelled(message) = self.dispatch(message).await {
                        self.recover(&message).await;
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        () = self.clock.sleep(self.info.options.poll_interval) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
            }
        }

        info!(
            worker_id = self.id,
            consumer = %self.info.name,
            "poll worker stopped"
        );
        self.running.store(false, Ordering::SeqCst);
    }

    /// Claims the next eligible message, applying random-queue fairness
    /// when the consumer enabled it.
    async fn claim_next(
        &self,
        last_queue: &mut Option<Option<String>>,
    ) -> Result<Option<Message>> {
        let options = &self.info.options;
        if !options.enable_random_queue {
            return self.store.claim(&options.topic, QueueFilter::Any).await;
        }

        let queues = self.store.list_queues(&options.topic).await?;
        if queues.is_empty() {
            // Nothing claimable was listed; fall back to an unfiltered claim
            // in case a message became eligible since.
            return self.store.claim(&options.topic, QueueFilter::Any).await;
        }

        let candidates: Vec<&Option<String>> = match last_queue {
            // With more than one queue present, never pick the same queue
            // twice in a row. The unpartitioned queue rotates like any
            // named one.
            Some(last) if queues.len() > 1 => queues.iter().filter(|q| *q != last).collect(),
            _ => queues.iter().collect(),
        };
        let chosen = candidates[rand::rng().random_range(0..candidates.len())];

        let claimed = self
            .store
            .claim(&options.topic, QueueFilter::Exact(chosen.as_deref()))
            .await?;
        if let Some(claimed) = &claimed {
            *last_queue = Some(claimed.queue.clone());
        }
        Ok(claimed)
    }

    async fn dispatch(&self, mut message: Message) -> DispatchOutcome {
        message.status = MessageStatus::Processing;
        self.hooks.before_consume(&message).await;

        debug!(
            worker_id = self.id,
            message_id = %message.id,
            topic = %message.topic,
            "message claimed"
        );
        if message.retry_count > 0 {
            info!(
                worker_id = self.id,
                message_id = %message.id,
                attempt = message.retry_count,
                max_attempts = self.info.options.retry_count,
                "retrying message"
            );
        }

        let result = match self.info.resolve() {
            Some(consumer) => consumer.consume(&message.data, self.cancel.clone()).await,
            None => {
                error!(
                    worker_id = self.id,
                    consumer = %self.info.name,
                    "consumer factory produced no instance for dispatch"
                );
                Ok(false)
            }
        };

        match result {
            Ok(true) => {
                if let Err(e) = self.store.ack(message.id).await {
                    error!(
                        worker_id = self.id,
                        message_id = %message.id,
                        error = %e,
                        "failed to ack message"
                    );
                } else {
                    message.status = MessageStatus::Success;
                }
            }
            Err(e) if e.is_cancelled() => return DispatchOutcome::Cancelled(message),
            Ok(false) => self.retry_or_nack(&mut message).await,
            Err(e) => {
                warn!(
                    worker_id = self.id,
                    message_id = %message.id,
                    topic = %message.topic,
                    error = %e,
                    "consumer returned error"
                );
                self.retry_or_nack(&mut message).await;
            }
        }

        self.hooks.after_consume(&message).await;
        DispatchOutcome::Completed
    }

    /// Schedules a retry when attempts remain, otherwise marks the message
    /// Failed. Storage errors here are logged and left to the stuck-message
    /// reaper: the row stays Processing and will be reset once its topic's
    /// reset interval elapses.
    async fn retry_or_nack(&self, message: &mut Message) {
        let options = &self.info.options;
        if message.retry_count < options.retry_count {
            let retry_count = message.retry_count + 1;
            let executable_time = self.clock.now() + to_chrono(options.retry_interval);
            match self
                .store
                .retry_update(message.id, retry_count, executable_time)
                .await
            {
                Ok(()) => {
                    message.status = MessageStatus::Waiting;
                    message.retry_count = retry_count;
                    message.executable_time = executable_time;
                }
                Err(e) => error!(
                    worker_id = self.id,
                    message_id = %message.id,
                    error = %e,
                    "failed to schedule retry"
                ),
            }
        } else {
            warn!(
                worker_id = self.id,
                message_id = %message.id,
                retries = message.retry_count,
                "retries exhausted, marking message failed"
            );
            match self.store.nack(message.id).await {
                Ok(()) => message.status = MessageStatus::Failed,
                Err(e) => error!(
                    worker_id = self.id,
                    message_id = %message.id,
                    error = %e,
                    "failed to nack message"
                ),
            }
        }
    }

    /// Returns a message interrupted by shutdown to Waiting so another
    /// worker can deliver it after restart.
    async fn recover(&self, message: &Message) {
        info!(
            worker_id = self.id,
            message_id = %message.id,
            "consume cancelled, returning message to waiting"
        );
        if let Err(e) = self.store.reset_to_waiting(message.id).await {
            error!(
                worker_id = self.id,
                message_id = %message.id,
                error = %e,
                "failed to return cancelled message to waiting"
            );
        }
    }
}

impl std::fmt::Debug for PollWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollWorker")
            .field("id", &self.id)
            .field("consumer", &self.info.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
