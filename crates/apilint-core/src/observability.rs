//! Observability infrastructure for apilint workers.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every worker process
//! logs the same fields for the same operations.

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
/// Call once at worker startup. Safe to call multiple times; subsequent
/// calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `apilint_flow=debug`)
///
/// # Example
///
/// ```rust
/// use apilint_core::observability::{init_logging, LogFormat};
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

/// Creates a span for pipeline operations scoped to a package version.
///
/// # Example
///
/// ```rust
/// use apilint_core::observability::pipeline_span;
///
/// let span = pipeline_span("fan_out", "pkg-a", "1.0", 3);
/// let _guard = span.enter();
/// // ... do pipeline operation
/// ```
#[must_use]
pub fn pipeline_span(operation: &str, package_id: &str, version: &str, revision: i32) -> Span {
    tracing::info_span!(
        "pipeline",
        op = operation,
        package_id = package_id,
        version = version,
        revision = revision,
    )
}

/// Creates a span for one task execution owned by an executor.
#[must_use]
pub fn task_span(operation: &str, task_id: &str, executor_id: &str) -> Span {
    tracing::info_span!(
        "task",
        op = operation,
        task_id = task_id,
        executor_id = executor_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn pipeline_span_carries_fields() {
        let span = pipeline_span("fan_out", "pkg", "1.0", 1);
        let _guard = span.enter();
        tracing::info!("message in span");
    }

    #[test]
    fn task_span_carries_fields() {
        let span = task_span("lint", "task-1", "exec-1");
        let _guard = span.enter();
        tracing::info!("message in span");
    }
}
