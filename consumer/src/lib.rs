//! SalesHQ affiliate analytics consumer.
//!
//! Subscribes to `{prefix}-analytics-events`, logs and dispatches every pixel
//! event, reports counters periodically, and shuts down once on the first of
//! SIGINT, SIGTERM, SIGUSR2, a panic, or a failed background task.

pub mod app;
pub mod config;
pub mod telemetry;
