//! Observability metrics for the linting pipeline.
//!
//! Exposed via the `metrics` crate facade; install an exporter (e.g.
//! `metrics_exporter_prometheus`) in the binary to publish them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `apilint_claims_total` | Counter | `kind`, `outcome` | Claim attempts by task kind |
//! | `apilint_tasks_total` | Counter | `kind`, `status` | Terminal task outcomes |
//! | `apilint_forced_failures_total` | Counter | `kind` | Restart-budget poisonings |
//! | `apilint_lint_duration_seconds` | Histogram | - | Wall-clock linter duration |
//! | `apilint_rollup_finalized_total` | Counter | `status` | Versions finalized by roll-up |

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: claim attempts by task kind and outcome.
    pub const CLAIMS_TOTAL: &str = "apilint_claims_total";
    /// Counter: terminal task outcomes by kind and status.
    pub const TASKS_TOTAL: &str = "apilint_tasks_total";
    /// Counter: tasks force-failed after exhausting the restart budget.
    pub const FORCED_FAILURES_TOTAL: &str = "apilint_forced_failures_total";
    /// Histogram: linter invocation duration in seconds.
    pub const LINT_DURATION_SECONDS: &str = "apilint_lint_duration_seconds";
    /// Counter: version tasks finalized by the roll-up loop.
    pub const ROLLUP_FINALIZED_TOTAL: &str = "apilint_rollup_finalized_total";
}

/// Handle for recording pipeline metrics.
///
/// Cheap to clone; the `metrics` facade holds the actual state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a claim attempt. `hit` is true when a task was dequeued.
    pub fn record_claim(&self, kind: &'static str, hit: bool) {
        let outcome = if hit { "hit" } else { "empty" };
        counter!(names::CLAIMS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
    }

    /// Records a task reaching a terminal status.
    pub fn record_task_terminal(&self, kind: &'static str, status: &'static str) {
        counter!(names::TASKS_TOTAL, "kind" => kind, "status" => status).increment(1);
    }

    /// Records a restart-budget poisoning.
    pub fn record_forced_failure(&self, kind: &'static str) {
        counter!(names::FORCED_FAILURES_TOTAL, "kind" => kind).increment(1);
    }

    /// Records one linter invocation's wall-clock duration.
    pub fn observe_lint_duration(&self, seconds: f64) {
        histogram!(names::LINT_DURATION_SECONDS).record(seconds);
    }

    /// Records a version finalized by the roll-up loop.
    pub fn record_rollup_finalized(&self, status: &'static str) {
        counter!(names::ROLLUP_FINALIZED_TOTAL, "status" => status).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_an_exporter_is_a_no_op() {
        let metrics = FlowMetrics::new();
        metrics.record_claim("doc", true);
        metrics.record_claim("version", false);
        metrics.record_task_terminal("doc", "complete");
        metrics.record_forced_failure("doc");
        metrics.observe_lint_duration(0.25);
        metrics.record_rollup_finalized("complete");
    }
}
