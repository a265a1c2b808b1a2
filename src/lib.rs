//! Database-backed message queue with at-least-once delivery.
//!
//! `tablemq` turns a single database table into a lightweight message
//! queue: producers insert rows, and a fleet of polling workers claims
//! them, one claimant per message, and drives each through its consumer.
//! It trades throughput for operational simplicity: no broker, no extra
//! infrastructure, transactions shared with application data.
//!
//! # Architecture
//!
//! - **Message lifecycle**: `Waiting -> Processing -> Success | Failed`,
//!   with retries and recovery returning messages to `Waiting`
//! - **Storage**: the [`MessageStore`] trait with an atomic claim
//!   operation; SQLite and in-memory adapters included
//! - **Delivery**: one [`PollWorker`] per unit of consumer parallelism,
//!   claiming oldest-first with optional random-queue fairness
//! - **Supervision**: the [`Dispatcher`] spawns workers and reapers under
//!   one cancellation token and drains them on shutdown
//! - **Reapers**: stuck-message recovery and retention purge run in the
//!   background
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tablemq::{
//!     Consumer, ConsumerOptions, ConsumerRegistry, Dispatcher, MemoryStore,
//!     MqConfig, Publisher, Result,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct OrderConsumer;
//!
//! #[async_trait]
//! impl Consumer for OrderConsumer {
//!     fn options(&self) -> ConsumerOptions {
//!         let mut options = ConsumerOptions::new("orders");
//!         options.retry_count = 3;
//!         options
//!     }
//!
//!     async fn consume(&self, payload: &str, _cancel: CancellationToken) -> Result<bool> {
//!         println!("got order: {payload}");
//!         Ok(true)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let mut registry = ConsumerRegistry::new();
//!     registry.register("orders", || OrderConsumer);
//!
//!     let mut dispatcher = Dispatcher::new(store.clone(), registry, MqConfig::default());
//!     dispatcher.start().await?;
//!
//!     Publisher::new(store).publish("orders", r#"{"id":42}"#).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     dispatcher.stop().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod message;
pub mod publisher;
pub mod reaper;
pub mod storage;
pub mod time;
pub mod worker;

pub use config::MqConfig;
pub use consumer::{Consumer, ConsumerFactory, ConsumerInfo, ConsumerOptions, ConsumerRegistry};
pub use dispatcher::Dispatcher;
pub use error::{MqError, Result};
pub use hooks::{MessageHooks, MulticastHooks, NoopHooks};
pub use message::{Message, MessageId, MessageStatus};
pub use publisher::Publisher;
pub use reaper::{RetentionReaper, StuckMessageReaper};
pub use storage::{MemoryStore, MessageStore, QueueFilter, SqliteStore};
pub use time::{Clock, SystemClock, TestClock};
pub use worker::PollWorker;
