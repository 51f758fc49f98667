//! Tracing subscriber setup.

use crate::config::{AppConfig, LogFormat};
use tracing::Span;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Service name stamped on every record.
pub const SERVICE_NAME: &str = "affiliate-consumer";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(config: &AppConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (json, simple) = match config.log_format {
        LogFormat::Json => (
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            ),
            None,
        ),
        LogFormat::Simple => (None, Some(fmt::layer().compact().with_target(false))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(simple)
        .try_init()
}

/// Root span carrying the service identity for every record beneath it.
#[must_use]
pub fn root_span(config: &AppConfig) -> Span {
    tracing::info_span!(
        "service",
        service = SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
    )
}
