//! In-memory [`BrokerClient`] for tests.
//!
//! [`InMemoryBroker`] records every lifecycle call, can be scripted to fail at
//! each step, and pushes messages into the running sink on demand with
//! [`InMemoryBroker::deliver`].

use affiliate_consumer_core::broker::{
    BrokerClient, BrokerError, GroupDescription, GroupMember, MessageSink, SubscribeMode,
};
use affiliate_consumer_core::event::InboundMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct BrokerState {
    connected: bool,
    subscriptions: Vec<(Vec<String>, SubscribeMode)>,
    sink: Option<Arc<dyn MessageSink>>,
}

/// Scriptable in-memory broker.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    failing_connects: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_run: AtomicBool,
    fail_stop: AtomicBool,
    fail_disconnect: AtomicBool,
    fail_describe: AtomicBool,
    disconnect_delay: Option<Duration>,
    connect_calls: AtomicUsize,
    run_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl InMemoryBroker {
    /// Create a broker where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `attempts` connect calls.
    #[must_use]
    pub fn failing_connects(self, attempts: usize) -> Self {
        self.failing_connects.store(attempts, Ordering::SeqCst);
        self
    }

    /// Fail every subscribe call.
    #[must_use]
    pub fn failing_subscribe(self) -> Self {
        self.fail_subscribe.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every run call.
    #[must_use]
    pub fn failing_run(self) -> Self {
        self.fail_run.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every stop call.
    #[must_use]
    pub fn failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every disconnect call.
    #[must_use]
    pub fn failing_disconnect(self) -> Self {
        self.fail_disconnect.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every describe-group call.
    #[must_use]
    pub fn failing_describe(self) -> Self {
        self.fail_describe.store(true, Ordering::SeqCst);
        self
    }

    /// Sleep for `delay` inside every disconnect call.
    #[must_use]
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `message` to the running sink.
    ///
    /// Returns `false` if no consume loop is running.
    pub async fn deliver(&self, message: InboundMessage) -> bool {
        let sink = self.state().sink.clone();
        match sink {
            Some(sink) => {
                sink.on_message(message).await;
                true
            }
            None => false,
        }
    }

    /// Whether a session is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Whether a consume loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().sink.is_some()
    }

    /// Every successful subscribe call, in order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(Vec<String>, SubscribeMode)> {
        self.state().subscriptions.clone()
    }

    /// Number of connect calls, successful or not.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of run calls, successful or not.
    #[must_use]
    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    /// Number of stop calls, successful or not.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls, successful or not.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Connect("broker unreachable".to_string()));
        }

        self.state().connected = true;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], mode: SubscribeMode) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscribe("topic authorization failed".to_string()));
        }

        state.subscriptions.push((topics.to_vec(), mode));
        Ok(())
    }

    async fn run(&self, sink: Arc<dyn MessageSink>) -> Result<(), BrokerError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(BrokerError::Consume("consume loop failed to start".to_string()));
        }

        state.sink = Some(sink);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.state().sink = None;

        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(BrokerError::Consume("consume loop panicked".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.disconnect_delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state();
            state.sink = None;
            state.connected = false;
        }

        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BrokerError::Consume("leave group request timed out".to_string()));
        }
        Ok(())
    }

    async fn describe_group(&self, group_id: &str) -> Result<GroupDescription, BrokerError> {
        if self.fail_describe.load(Ordering::SeqCst) {
            return Err(BrokerError::Admin("coordinator not available".to_string()));
        }

        let members = if self.is_running() {
            vec![GroupMember {
                member_id: "member-1".to_string(),
                client_id: "test-client".to_string(),
                client_host: "/127.0.0.1".to_string(),
            }]
        } else {
            Vec::new()
        };

        Ok(GroupDescription {
            group_id: group_id.to_string(),
            state: if members.is_empty() { "Empty" } else { "Stable" }.to_string(),
            protocol: "range".to_string(),
            protocol_type: "consumer".to_string(),
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_consumed_in_order() {
        let broker = InMemoryBroker::new().failing_connects(2);

        tokio_test::block_on(async {
            assert!(broker.connect().await.is_err());
            assert!(broker.connect().await.is_err());
            assert!(broker.connect().await.is_ok());
        });

        assert_eq!(broker.connect_calls(), 3);
        assert!(broker.is_connected());
    }

    #[test]
    fn deliver_without_run_is_rejected() {
        let broker = InMemoryBroker::new();
        let delivered = tokio_test::block_on(
            broker.deliver(crate::fixtures::empty_message(0, 0)),
        );
        assert!(!delivered);
    }
}
