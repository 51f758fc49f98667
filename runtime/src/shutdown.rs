//! Graceful shutdown coordination.
//!
//! Every shutdown source (OS signals, panics, failed background tasks) is a
//! producer on one trigger channel. The [`ShutdownCoordinator`] consumes that
//! channel and runs its registered [`ShutdownHandler`]s exactly once; any trigger
//! that arrives while teardown is in flight is logged and ignored.
//!
//! ## Usage
//!
//! ```ignore
//! let (triggers, receiver) = trigger_channel();
//! install_panic_hook(triggers.clone());
//! spawn_signal_listener(triggers.clone());
//!
//! let mut coordinator = ShutdownCoordinator::new(None);
//! coordinator.register(service.clone());
//! let coordinator = Arc::new(coordinator);
//!
//! let outcome = coordinator.run_until_shutdown(receiver).await;
//! std::process::exit(outcome.exit_code().unwrap_or(1));
//! ```

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

/// Components that need cleanup before the process exits.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Release the component's resources.
    ///
    /// # Errors
    ///
    /// Returns a description of what could not be released.
    async fn shutdown(&self) -> Result<(), String>;
}

/// Why shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// OS signal, by name (`SIGINT`, `SIGTERM`, `SIGUSR2`)
    Signal(&'static str),
    /// A panic anywhere in the process
    Panic(String),
    /// A background task that should never end did
    TaskFailure(String),
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::Panic(message) => write!(f, "panic: {message}"),
            Self::TaskFailure(message) => write!(f, "task failure: {message}"),
        }
    }
}

/// Result of one shutdown request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every handler finished cleanly
    Completed,
    /// Another request is already tearing down
    AlreadyInProgress,
    /// At least one handler failed or timed out
    Failed(Vec<String>),
}

impl ShutdownOutcome {
    /// Process exit code for this outcome, or `None` if this request should not exit.
    #[must_use]
    pub const fn exit_code(&self) -> Option<u8> {
        match self {
            Self::Completed => Some(0),
            Self::AlreadyInProgress => None,
            Self::Failed(_) => Some(1),
        }
    }
}

/// Sending half of the trigger channel.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::UnboundedSender<ShutdownTrigger>,
}

impl TriggerSender {
    /// Request shutdown. Returns `false` once the coordinator has stopped listening.
    pub fn trigger(&self, trigger: ShutdownTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

/// Receiving half of the trigger channel, consumed by the coordinator.
pub type TriggerReceiver = mpsc::UnboundedReceiver<ShutdownTrigger>;

/// Create the trigger channel.
#[must_use]
pub fn trigger_channel() -> (TriggerSender, TriggerReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TriggerSender { tx }, rx)
}

/// Runs shutdown handlers once, with an optional per-handler timeout.
pub struct ShutdownCoordinator {
    handlers: Vec<Arc<dyn ShutdownHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    timeout: Option<Duration>,
    in_progress: AtomicBool,
}

impl ShutdownCoordinator {
    /// Create a coordinator. `None` waits for handlers indefinitely.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            handlers: Vec::new(),
            shutdown_tx,
            timeout,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Register a shutdown handler.
    ///
    /// Handlers are shut down in parallel, not in registration order.
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        info!(handler = handler.name(), "Registered shutdown handler");
        self.handlers.push(handler);
    }

    /// Receiver notified when teardown begins.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Whether teardown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Tear down every handler, at most once per coordinator.
    ///
    /// The first caller runs the handlers and gets `Completed` or `Failed`. Every
    /// later or concurrent caller gets `AlreadyInProgress` immediately.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> ShutdownOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(%trigger, "Shutdown already in progress, ignoring signal");
            return ShutdownOutcome::AlreadyInProgress;
        }

        info!(
            %trigger,
            handlers = self.handlers.len(),
            timeout = ?self.timeout,
            "Received shutdown signal, starting graceful shutdown"
        );

        if self.shutdown_tx.send(()).is_err() {
            warn!("No active shutdown signal receivers");
        }

        let results = futures::future::join_all(
            self.handlers.iter().map(|handler| self.shutdown_one(handler.as_ref())),
        )
        .await;
        let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();

        if errors.is_empty() {
            info!("Graceful shutdown completed");
            ShutdownOutcome::Completed
        } else {
            error!(errors = ?errors, "Error during graceful shutdown");
            ShutdownOutcome::Failed(errors)
        }
    }

    async fn shutdown_one(&self, handler: &dyn ShutdownHandler) -> Result<(), String> {
        let name = handler.name();
        info!(handler = name, "Shutting down component");

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.shutdown()).await {
                Ok(result) => result,
                Err(_) => Err(format!("timeout after {limit:?}")),
            },
            None => handler.shutdown().await,
        };

        match result {
            Ok(()) => {
                info!(handler = name, "Component shut down");
                Ok(())
            }
            Err(e) => {
                error!(handler = name, error = %e, "Component shutdown failed");
                Err(format!("{name}: {e}"))
            }
        }
    }

    /// Consume triggers until one shutdown request finishes, and return its outcome.
    ///
    /// Each trigger is handled on its own task, so triggers arriving mid-teardown
    /// are observed and reported as duplicates instead of queueing behind it.
    pub async fn run_until_shutdown(
        self: Arc<Self>,
        mut triggers: TriggerReceiver,
    ) -> ShutdownOutcome {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let listen = {
            let coordinator = Arc::clone(&self);
            async move {
                while let Some(trigger) = triggers.recv().await {
                    let coordinator = Arc::clone(&coordinator);
                    let done_tx = done_tx.clone();
                    let handle = async move {
                        let outcome = coordinator.shutdown(trigger).await;
                        if outcome.exit_code().is_some() {
                            let _ = done_tx.send(outcome);
                        }
                    };
                    tokio::spawn(handle.in_current_span());
                }
            }
        };
        let listener = tokio::spawn(listen.in_current_span());

        let outcome = done_rx.recv().await.unwrap_or_else(|| {
            ShutdownOutcome::Failed(vec!["trigger channel closed".to_string()])
        });
        listener.abort();
        outcome
    }
}

thread_local! {
    static PANIC_ISOLATED: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as polling an isolated future until dropped.
struct IsolationScope {
    previous: bool,
}

impl IsolationScope {
    fn enter() -> Self {
        Self {
            previous: PANIC_ISOLATED.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for IsolationScope {
    fn drop(&mut self) {
        PANIC_ISOLATED.with(|flag| flag.set(self.previous));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Drive `future` to completion, turning a panic inside it into `Err(message)`.
///
/// Panics caught here are contained: [`install_panic_hook`] does not forward
/// them as [`ShutdownTrigger::Panic`].
///
/// # Errors
///
/// Returns the panic message if `future` panicked while being polled.
pub async fn catch_isolated<F: Future>(future: F) -> Result<F::Output, String> {
    let mut future = std::pin::pin!(future);
    let scoped = futures::future::poll_fn(move |cx| {
        let _scope = IsolationScope::enter();
        future.as_mut().poll(cx)
    });

    AssertUnwindSafe(scoped)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// Forward panics to the trigger channel, after the previous hook has run.
///
/// Panics raised under [`catch_isolated`] are left to their caller.
pub fn install_panic_hook(triggers: TriggerSender) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        if PANIC_ISOLATED.with(Cell::get) {
            return;
        }

        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();

        error!(error = %message, location = %location, "Uncaught panic");
        triggers.trigger(ShutdownTrigger::Panic(message));
    }));
}

/// Wait for SIGINT, SIGTERM, or SIGUSR2 and return the signal's name.
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigusr2.recv() => "SIGUSR2",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}

/// Forward every OS signal to the trigger channel.
///
/// A failure to install handlers becomes a [`ShutdownTrigger::TaskFailure`].
#[must_use]
pub fn spawn_signal_listener(triggers: TriggerSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let trigger = match wait_for_signal().await {
                Ok(name) => ShutdownTrigger::Signal(name),
                Err(e) => {
                    error!(error = %e, "Failed to install signal handlers");
                    triggers.trigger(ShutdownTrigger::TaskFailure(format!(
                        "signal handlers unavailable: {e}"
                    )));
                    return;
                }
            };
            if !triggers.trigger(trigger) {
                return;
            }
        }
    })
}
