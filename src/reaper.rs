//! Background reapers: stuck-message recovery and retention purge.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    config::MqConfig,
    consumer::ConsumerInfo,
    storage::MessageStore,
    time::{to_chrono, Clock},
};

/// Cadence at which stuck-message recovery checks every opted-in topic.
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Returns Processing messages that have been held too long to Waiting.
///
/// Catches messages orphaned by crashed or hung workers. Only topics whose
/// consumer set a `reset_interval` are scanned; the interval doubles as the
/// "held too long" threshold. A message legitimately being consumed for
/// longer than its topic's reset interval will be reset and delivered again,
/// which at-least-once delivery permits.
pub struct StuckMessageReaper {
    store: Arc<dyn MessageStore>,
    targets: Vec<(String, Duration)>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl StuckMessageReaper {
    /// Builds a reaper over the topics of `consumers` that opted into stuck
    /// recovery. Duplicate topics keep the shortest interval.
    pub fn new(
        store: Arc<dyn MessageStore>,
        consumers: &[ConsumerInfo],
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let mut targets: Vec<(String, Duration)> = Vec::new();
        for info in consumers {
            let Some(interval) = info.options.reset_interval else {
                continue;
            };
            match targets.iter_mut().find(|(t, _)| *t == info.options.topic) {
                Some((_, existing)) => *existing = (*existing).min(interval),
                None => targets.push((info.options.topic.clone(), interval)),
            }
        }
        Self {
            store,
            targets,
            clock,
            cancel,
        }
    }

    /// Runs until cancellation.
    pub async fn run(&self) {
        if self.targets.is_empty() {
            debug!("no topics opted into stuck-message recovery");
            self.cancel.cancelled().await;
            return;
        }
        info!(topics = self.targets.len(), "stuck-message reaper started");

        loop {
            self.sweep().await;
            tokio::select! {
                () = self.clock.sleep(STUCK_CHECK_INTERVAL) => {}
                () = self.cancel.cancelled() => break,
            }
        }
        info!("stuck-message reaper stopped");
    }

    async fn sweep(&self) {
        for (topic, interval) in &self.targets {
            let deadline = self.clock.now() - to_chrono(*interval);
            match self.store.reset_expired(topic, deadline).await {
                Ok(0) => {}
                Ok(reset) => info!(topic = %topic, reset, "reset stuck messages"),
                Err(e) => error!(topic = %topic, error = %e, "stuck-message sweep failed"),
            }
        }
    }
}

/// Deletes messages older than the retention window, regardless of status.
///
/// Runs one purge immediately on start, then once per retention window.
pub struct RetentionReaper {
    store: Arc<dyn MessageStore>,
    expire: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl RetentionReaper {
    /// Builds a reaper using the retention window from `config`.
    pub fn new(
        store: Arc<dyn MessageStore>,
        config: &MqConfig,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            expire: config.message_expire,
            clock,
            cancel,
        }
    }

    /// Runs until cancellation.
    pub async fn run(&self) {
        info!(expire_secs = self.expire.as_secs(), "retention reaper started");
        loop {
            let before = self.clock.now() - to_chrono(self.expire);
            match self.store.purge(before).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired messages"),
                Err(e) => error!(error = %e, "retention purge failed"),
            }

            tokio::select! {
                () = self.clock.sleep(self.expire) => {}
                () = self.cancel.cancelled() => break,
            }
        }
        info!("retention reaper stopped");
    }
}
