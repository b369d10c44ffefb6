//! Observability metrics for the broker.
//!
//! Metrics are exposed via the `metrics` crate facade; exporting them is a
//! deployment concern.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `depot_tasks_total` | Counter | `name`, `outcome` | Task executions by outcome taxonomy |
//! | `depot_task_duration_seconds` | Histogram | `name`, `outcome` | Task execution duration |
//! | `depot_fulfillment_cycle_duration_seconds` | Histogram | - | FulfillOpenOrders cycle time |
//! | `depot_cleanup_cycle_duration_seconds` | Histogram | - | ProcessItemsCleanup cycle time |
//! | `depot_orders_fulfilled_total` | Counter | - | Orders transitioned to FULFILLED |
//! | `depot_orders_closed_total` | Counter | `reason` | Orders closed, by cause |
//! | `depot_reservation_conflicts_total` | Counter | - | Optimistic-concurrency aborts |
//! | `depot_grow_tasks_total` | Counter | `kind` | Grow tasks enqueued |
//! | `depot_open_orders` | Gauge | - | Currently open orders |
//! | `depot_free_items` | Gauge | - | Currently free items |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: task executions by outcome.
    pub const TASKS_TOTAL: &str = "depot_tasks_total";
    /// Histogram: task execution duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "depot_task_duration_seconds";
    /// Histogram: fulfillment cycle duration in seconds.
    pub const FULFILLMENT_CYCLE_DURATION_SECONDS: &str =
        "depot_fulfillment_cycle_duration_seconds";
    /// Histogram: cleanup cycle duration in seconds.
    pub const CLEANUP_CYCLE_DURATION_SECONDS: &str = "depot_cleanup_cycle_duration_seconds";
    /// Counter: orders fulfilled.
    pub const ORDERS_FULFILLED_TOTAL: &str = "depot_orders_fulfilled_total";
    /// Counter: orders closed by cause.
    pub const ORDERS_CLOSED_TOTAL: &str = "depot_orders_closed_total";
    /// Counter: reservation aborts due to concurrent modification.
    pub const RESERVATION_CONFLICTS_TOTAL: &str = "depot_reservation_conflicts_total";
    /// Counter: grow tasks enqueued by kind.
    pub const GROW_TASKS_TOTAL: &str = "depot_grow_tasks_total";
    /// Gauge: currently open orders.
    pub const OPEN_ORDERS: &str = "depot_open_orders";
    /// Gauge: currently free items.
    pub const FREE_ITEMS: &str = "depot_free_items";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task name.
    pub const NAME: &str = "name";
    /// Execution outcome (success, failure, revoked, timeout, blocked).
    pub const OUTCOME: &str = "outcome";
    /// Close cause (expired, ejected, client).
    pub const REASON: &str = "reason";
    /// Item kind tag.
    pub const KIND: &str = "kind";
}

/// High-level interface for recording broker metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records one task execution with its outcome taxonomy and duration.
    pub fn record_task_execution(&self, name: &str, outcome: &str, duration: Duration) {
        counter!(
            names::TASKS_TOTAL,
            labels::NAME => name.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::NAME => name.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a fulfillment cycle's duration.
    pub fn observe_fulfillment_cycle(&self, duration: Duration) {
        histogram!(names::FULFILLMENT_CYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a cleanup cycle's duration.
    pub fn observe_cleanup_cycle(&self, duration: Duration) {
        histogram!(names::CLEANUP_CYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records one order fulfilled.
    pub fn record_order_fulfilled(&self) {
        counter!(names::ORDERS_FULFILLED_TOTAL).increment(1);
    }

    /// Records one order closed with a cause.
    pub fn record_order_closed(&self, reason: &str) {
        counter!(
            names::ORDERS_CLOSED_TOTAL,
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Records one aborted reservation.
    pub fn record_reservation_conflict(&self) {
        counter!(names::RESERVATION_CONFLICTS_TOTAL).increment(1);
    }

    /// Records one grow task enqueued for a kind.
    pub fn record_grow_task(&self, kind: &str) {
        counter!(
            names::GROW_TASKS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Sets the open-orders gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small.
    pub fn set_open_orders(&self, count: usize) {
        gauge!(names::OPEN_ORDERS).set(count as f64);
    }

    /// Sets the free-items gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small.
    pub fn set_free_items(&self, count: usize) {
        gauge!(names::FREE_ITEMS).set(count as f64);
    }
}

/// RAII guard for timing operations; records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard calling `on_drop` with the elapsed time.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_record_without_a_recorder_installed() {
        let metrics = BrokerMetrics::new();
        metrics.record_task_execution("FulfillOpenOrders", "success", Duration::from_millis(5));
        metrics.observe_fulfillment_cycle(Duration::from_millis(100));
        metrics.record_order_fulfilled();
        metrics.record_order_closed("expired");
        metrics.record_reservation_conflict();
        metrics.record_grow_task("ec2_instance");
        metrics.set_open_orders(3);
        metrics.set_free_items(12);
    }

    #[test]
    fn timing_guard_measures_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }
}
