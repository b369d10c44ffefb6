//! Observability infrastructure for depot.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across the broker's
//! periodic cycles and task executions.

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
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `depot_broker=debug`)
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

/// Creates a span for an operation against one order.
#[must_use]
pub fn order_span(operation: &str, order_sid: &str) -> Span {
    tracing::info_span!("order", op = operation, order = order_sid)
}

/// Creates a span for one task execution.
#[must_use]
pub fn task_span(task_name: &str, task_id: &str) -> Span {
    tracing::info_span!("task", name = task_name, task_id = task_id)
}

/// Creates a span for one periodic broker cycle (fulfillment, cleanup).
#[must_use]
pub fn cycle_span(cycle: &str) -> Span {
    tracing::info_span!("cycle", cycle = cycle)
}
