//! Observability infrastructure for Relay.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors for consistent observability
//! across all Relay components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `relay_queue=debug`)
///
/// # Example
///
/// ```rust
/// use relay_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for queue operations with standard fields.
///
/// # Example
///
/// ```rust
/// use relay_core::observability::queue_span;
///
/// let span = queue_span("claim", "course-jobs", "acme-academy");
/// let _guard = span.enter();
/// // ... do queue operation
/// ```
#[must_use]
pub fn queue_span(operation: &str, queue: &str, tenant: &str) -> Span {
    tracing::info_span!(
        "queue",
        op = operation,
        queue = queue,
        tenant = tenant,
    )
}

/// Creates a span for a single worker pass.
#[must_use]
pub fn worker_span(operation: &str, queue: &str, job_id: &str) -> Span {
    tracing::info_span!(
        "worker",
        op = operation,
        queue = queue,
        job_id = job_id,
    )
}
