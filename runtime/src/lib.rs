//! # Affiliate Consumer Runtime
//!
//! Runtime for the affiliate analytics consumer.
//!
//! This crate drives the broker-agnostic pieces in
//! [`affiliate_consumer_core`]: it owns the consumer's lifecycle, runs each
//! delivered message through decode and dispatch, and coordinates a single
//! graceful shutdown across every trigger source.
//!
//! ## Core Components
//!
//! - **`ConsumerService`**: connect, subscribe, consume, disconnect
//! - **`MessageHandler`**: per-message decode, dispatch, and fault isolation
//! - **`ShutdownCoordinator`**: one-shot teardown fed by signals, panics, and task failures
//! - **Metrics reporter**: periodic structured log of the consumer's counters
//!
//! ## Example
//!
//! ```ignore
//! use affiliate_consumer_runtime::service::{ConsumerService, ServiceConfig};
//! use affiliate_consumer_runtime::shutdown::{ShutdownCoordinator, trigger_channel};
//!
//! let service = Arc::new(ConsumerService::new(config, broker, processor));
//! service.connect().await?;
//! service.start_consuming().await?;
//!
//! let (triggers, receiver) = trigger_channel();
//! let mut coordinator = ShutdownCoordinator::new(None);
//! coordinator.register(service.clone());
//! let outcome = Arc::new(coordinator).run_until_shutdown(receiver).await;
//! ```

/// Per-message decode and dispatch
pub mod handler;

/// Periodic metrics reporting
pub mod reporter;

/// Retry logic with exponential backoff
pub mod retry;

/// Consumer lifecycle controller
pub mod service;

/// Graceful shutdown coordination
pub mod shutdown;

pub use handler::{HandleOutcome, MessageHandler};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use service::{ConsumerService, HealthStatus, LifecycleState, ServiceConfig};
pub use shutdown::{
    ShutdownCoordinator, ShutdownHandler, ShutdownOutcome, ShutdownTrigger, TriggerSender,
};
