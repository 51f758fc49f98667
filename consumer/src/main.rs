//! Affiliate analytics consumer binary.

use affiliate_consumer::{app, config::Config, telemetry};
use std::process::ExitCode;
use tracing::{Instrument, error};

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let config = Config::from_env();

    if let Err(e) = telemetry::init(&config.app) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = dotenv {
        tracing::debug!(error = %e, "No .env file loaded");
    }

    let span = telemetry::root_span(&config.app);
    match app::run(config).instrument(span.clone()).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code().unwrap_or(1)),
        Err(e) => {
            span.in_scope(|| {
                error!(error = %format!("{e:#}"), "Failed to start affiliate consumer");
            });
            ExitCode::FAILURE
        }
    }
}
