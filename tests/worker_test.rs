//! Poll worker behavior: storage-error resilience, cancellation recovery,
//! retry scheduling, and random-queue fairness.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tablemq::{
    Clock, Consumer, ConsumerInfo, ConsumerOptions, ConsumerRegistry, MemoryStore, Message,
    MessageHooks, MessageId, MessageStatus, MessageStore, MqError, PollWorker, Publisher, QueueFilter,
    Result, TestClock,
};
use tokio_util::sync::CancellationToken;

mod common;

/// Hook that snapshots every message it observes.
#[derive(Debug, Default)]
struct SnapshotHook {
    before_consume: Mutex<Vec<Message>>,
    after_consume: Mutex<Vec<Message>>,
}

impl SnapshotHook {
    fn claimed_queues(&self) -> Vec<Option<String>> {
        lock(&self.before_consume).iter().map(|m| m.queue.clone()).collect()
    }
}

#[async_trait]
impl MessageHooks for SnapshotHook {
    async fn before_consume(&self, message: &Message) {
        lock(&self.before_consume).push(message.clone());
    }

    async fn after_consume(&self, message: &Message) {
        lock(&self.after_consume).push(message.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

struct StubConsumer {
    options: ConsumerOptions,
    outcome: Result<bool>,
}

#[async_trait]
impl Consumer for StubConsumer {
    fn options(&self) -> ConsumerOptions {
        self.options.clone()
    }

    async fn consume(&self, _payload: &str, cancel: CancellationToken) -> Result<bool> {
        match &self.outcome {
            Ok(done) => Ok(*done),
            Err(MqError::Cancelled) => {
                // Hold the message until shutdown interrupts us.
                cancel.cancelled().await;
                Err(MqError::Cancelled)
            }
            Err(e) => Err(MqError::storage(e.to_string())),
        }
    }
}

fn info_for(options: ConsumerOptions, outcome: fn() -> Result<bool>) -> ConsumerInfo {
    let mut registry = ConsumerRegistry::new();
    registry.register("stub", move || StubConsumer {
        options: options.clone(),
        outcome: outcome(),
    });
    registry.scan().remove(0)
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

async fn wait_for_status(store: &MemoryStore, id: MessageId, status: MessageStatus) {
    for _ in 0..1000 {
        if store.get(id).await.map(|m| m.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("message {id} never reached {status}");
}

fn spawn_worker(
    info: ConsumerInfo,
    store: Arc<MemoryStore>,
    hooks: Arc<dyn MessageHooks>,
    clock: Arc<TestClock>,
    cancel: CancellationToken,
) -> (Arc<PollWorker>, tokio::task::JoinHandle<()>) {
    common::init_tracing();
    let worker = Arc::new(PollWorker::new(0, info, store, hooks, clock, cancel));
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };
    (worker, handle)
}

#[tokio::test(flavor = "multi_thread")]
async fn claim_error_does_not_kill_worker() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    store.inject_claim_error("database unavailable");

    let id = Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone())
        .publish("stub", "{}")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let info = info_for(ConsumerOptions::new("stub"), || Ok(true));
    let (_, handle) = spawn_worker(
        info,
        store.clone(),
        Arc::new(tablemq::NoopHooks),
        clock,
        cancel.clone(),
    );

    // First claim fails; the worker logs it and keeps polling.
    wait_for_status(&store, id, MessageStatus::Success).await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_consume_returns_message_to_waiting() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let hooks = Arc::new(SnapshotHook::default());

    let id = Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone())
        .publish("stub", "{}")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let info = info_for(ConsumerOptions::new("stub"), || Err(MqError::Cancelled));
    let (worker, handle) = spawn_worker(info, store.clone(), hooks.clone(), clock, cancel.clone());

    // Wait until the message is claimed and held by the consumer.
    wait_for_status(&store, id, MessageStatus::Processing).await;

    cancel.cancel();
    handle.await.unwrap();

    let message = store.get(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Waiting);
    assert_eq!(message.retry_count, 0);
    assert!(!worker.is_running());
    // Cancellation skips the post-dispatch hook.
    assert!(lock(&hooks.after_consume).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_are_spaced_and_capped() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let hooks = Arc::new(SnapshotHook::default());

    let id = Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone())
        .publish("stub", "{}")
        .await
        .unwrap();

    let mut options = ConsumerOptions::new("stub");
    options.retry_count = 3;
    options.retry_interval = Duration::from_secs(5);
    let info = info_for(options, || Ok(false));

    let cancel = CancellationToken::new();
    let (_, handle) = spawn_worker(info, store.clone(), hooks.clone(), clock, cancel.clone());

    wait_for_status(&store, id, MessageStatus::Failed).await;
    cancel.cancel();
    handle.await.unwrap();

    let message = store.get(id).await.unwrap();
    assert_eq!(message.retry_count, 3);

    // One initial attempt plus three retries, each scheduled further out
    // than the last.
    let snapshots = lock(&hooks.after_consume).clone();
    assert_eq!(snapshots.len(), 4);
    let retry_counts: Vec<u32> = snapshots.iter().map(|m| m.retry_count).collect();
    assert_eq!(retry_counts, [1, 2, 3, 3]);
    assert_eq!(snapshots.last().unwrap().status, MessageStatus::Failed);

    let schedule: Vec<DateTime<Utc>> = snapshots[..3].iter().map(|m| m.executable_time).collect();
    assert!(schedule.windows(2).all(|w| w[0] < w[1]));

    // Each reschedule lands exactly retry_interval after the claim that
    // preceded it, not merely "later".
    let claims = lock(&hooks.before_consume).clone();
    assert_eq!(claims.len(), 4);
    for (claimed, rescheduled) in claims.iter().zip(snapshots.iter()).take(3) {
        assert_eq!(
            rescheduled.executable_time - claimed.executable_time,
            ChronoDuration::seconds(5)
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn random_queue_never_repeats_while_others_have_work() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let hooks = Arc::new(SnapshotHook::default());
    let publisher =
        Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone());

    for i in 0..4 {
        publisher
            .publish_to_queue("stub", "tenant-a", format!("a{i}"))
            .await
            .unwrap();
        publisher
            .publish_to_queue("stub", "tenant-b", format!("b{i}"))
            .await
            .unwrap();
    }

    let mut options = ConsumerOptions::new("stub");
    options.enable_random_queue = true;
    let info = info_for(options, || Ok(true));

    let cancel = CancellationToken::new();
    let (_, handle) = spawn_worker(info, store.clone(), hooks.clone(), clock, cancel.clone());

    let hooks_ref = hooks.clone();
    wait_for(move || lock(&hooks_ref.before_consume).len() == 8).await;
    cancel.cancel();
    handle.await.unwrap();

    // Both queues still held waiting messages throughout, so consecutive
    // claims must alternate.
    let queues = hooks.claimed_queues();
    assert_eq!(queues.len(), 8);
    assert!(queues.windows(2).all(|w| w[0] != w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn random_queue_rotates_through_unpartitioned_messages() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let hooks = Arc::new(SnapshotHook::default());
    let publisher =
        Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone());

    // Older named-queue backlog alongside fresher unpartitioned messages.
    for i in 0..6 {
        publisher
            .publish_to_queue("stub", "tenant-a", format!("a{i}"))
            .await
            .unwrap();
    }
    clock.advance(Duration::from_secs(1));
    for i in 0..6 {
        publisher.publish("stub", format!("u{i}")).await.unwrap();
    }

    let mut options = ConsumerOptions::new("stub");
    options.enable_random_queue = true;
    let info = info_for(options, || Ok(true));

    let cancel = CancellationToken::new();
    let (_, handle) = spawn_worker(info, store.clone(), hooks.clone(), clock, cancel.clone());

    let hooks_ref = hooks.clone();
    wait_for(move || lock(&hooks_ref.before_consume).len() == 12).await;
    cancel.cancel();
    handle.await.unwrap();

    // The named backlog must not starve the unpartitioned queue: while both
    // hold work, claims alternate between them.
    let queues = hooks.claimed_queues();
    assert_eq!(queues.len(), 12);
    assert!(queues.windows(2).all(|w| w[0] != w[1]));
    assert_eq!(queues.iter().filter(|q| q.is_none()).count(), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn random_queue_degrades_to_single_queue() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let hooks = Arc::new(SnapshotHook::default());
    let publisher =
        Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone());

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            publisher
                .publish_to_queue("stub", "only", format!("m{i}"))
                .await
                .unwrap(),
        );
    }

    let mut options = ConsumerOptions::new("stub");
    options.enable_random_queue = true;
    let info = info_for(options, || Ok(true));

    let cancel = CancellationToken::new();
    let (_, handle) = spawn_worker(info, store.clone(), hooks.clone(), clock, cancel.clone());

    for id in &ids {
        wait_for_status(&store, *id, MessageStatus::Success).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(hooks.claimed_queues().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn claim_stamps_eligibility_to_claim_time() {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let published_at = clock.now();

    let id = Publisher::with_hooks(store.clone(), Arc::new(tablemq::NoopHooks), clock.clone())
        .publish("stub", "{}")
        .await
        .unwrap();

    clock.advance(Duration::from_secs(30));
    let claimed = store.claim("stub", QueueFilter::Any).await.unwrap().unwrap();

    assert_eq!(claimed.id, id);
    assert!(claimed.executable_time > published_at);
    assert_eq!(claimed.executable_time, clock.now());
}
