use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::LoggingConfig;

/// Initialize structured logging
///
/// `RUST_LOG` wins over the configured level. The `json` format emits one
/// object per event with the current span attached; anything else is the
/// human-readable formatter.
pub fn init_telemetry(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()?;
    }

    tracing::debug!(format = %logging.format, "Telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one patch attempt
pub fn create_patch_span(description: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "patch",
        description = description,
        correlation.id = correlation_id,
        branch = tracing::field::Empty,
    )
}

/// Span covering the monitors of one review
pub fn create_monitor_span(review_id: u64, branch: &str, ticket: Option<u64>, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "review_monitor",
        review.id = review_id,
        branch = branch,
        ticket.number = ticket,
        correlation.id = correlation_id,
    )
}
