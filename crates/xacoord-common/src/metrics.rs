//! Metrics and observability for xacoord
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::types::{Decision, HeuristicOutcome};

/// Installed Prometheus recorder, if any
static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the process-wide Prometheus recorder
///
/// Calling this more than once returns the handle installed first.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    PROMETHEUS
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| Error::Internal(format!("Failed to install metrics recorder: {e}")))
        })
        .cloned()
}

/// Export metrics in Prometheus text format
#[must_use]
pub fn export_prometheus() -> String {
    PROMETHEUS
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

// ============================================================================
// Transaction Metrics
// ============================================================================

/// Record a transaction begin
pub fn record_begin() {
    counter!("xacoord_transactions_begun_total").increment(1);
    gauge!("xacoord_transactions_active").increment(1.0);
}

/// Record a transaction reaching its final outcome
pub fn record_completion(decision: Decision, heuristic: Option<HeuristicOutcome>) {
    gauge!("xacoord_transactions_active").decrement(1.0);
    record_outcome(decision, heuristic);
}

/// Record recovery completing a transaction begun before a restart
pub fn record_recovered_completion(decision: Decision, heuristic: Option<HeuristicOutcome>) {
    counter!("xacoord_recovery_completed_total").increment(1);
    record_outcome(decision, heuristic);
}

fn record_outcome(decision: Decision, heuristic: Option<HeuristicOutcome>) {
    match (decision, heuristic) {
        (_, Some(outcome)) => {
            counter!("xacoord_transactions_heuristic_total", "outcome" => outcome.to_string())
                .increment(1);
        }
        (Decision::Commit, None) => counter!("xacoord_transactions_committed_total").increment(1),
        (Decision::Rollback, None) => {
            counter!("xacoord_transactions_rolled_back_total").increment(1);
        }
    }
}

/// Record a transaction dropped by its callers before completing
pub fn record_abandoned() {
    counter!("xacoord_transactions_abandoned_total").increment(1);
    gauge!("xacoord_transactions_active").decrement(1.0);
}

/// Record a transaction timing out
pub fn record_timeout() {
    counter!("xacoord_transactions_timed_out_total").increment(1);
}

/// Record commit latency
pub fn record_commit_latency(latency_ms: f64) {
    histogram!("xacoord_commit_duration_ms").record(latency_ms);
}

/// Record a branch completion retry
pub fn record_branch_retry(resource: &str) {
    counter!("xacoord_branch_retries_total", "resource" => resource.to_string()).increment(1);
}

// ============================================================================
// Recovery Log Metrics
// ============================================================================

/// Record a record appended to the recovery log
pub fn record_log_append(kind: &'static str, bytes: u64) {
    counter!("xacoord_log_records_total", "kind" => kind).increment(1);
    counter!("xacoord_log_bytes_written_total").increment(bytes);
}

/// Record a log force and its latency
pub fn record_log_force(latency_us: f64) {
    counter!("xacoord_log_forces_total").increment(1);
    histogram!("xacoord_log_force_duration_us").record(latency_us);
}

/// Record what a replayed log holds
pub fn record_log_contents(partners: usize, pending: usize, heuristic: usize) {
    gauge!("xacoord_log_partners").set(partners as f64);
    gauge!("xacoord_log_pending_transactions").set(pending as f64);
    gauge!("xacoord_log_heuristic_transactions").set(heuristic as f64);
}

// ============================================================================
// Recovery Metrics
// ============================================================================

/// Record a recovery pass
pub fn record_recovery_pass(resolved: u64, outstanding: u64) {
    counter!("xacoord_recovery_passes_total").increment(1);
    counter!("xacoord_recovery_resolved_total").increment(resolved);
    gauge!("xacoord_recovery_outstanding").set(outstanding as f64);
}

/// Record an orphaned branch rolled back by presumed abort
pub fn record_presumed_abort() {
    counter!("xacoord_recovery_presumed_abort_total").increment(1);
}

/// Timer guard recording the elapsed time into a histogram on drop
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    #[must_use]
    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1_000_000.0
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(self.elapsed_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_without_recorder_is_empty() {
        // recording without a recorder is a no-op
        record_begin();
        record_completion(Decision::Commit, None);
        if PROMETHEUS.get().is_none() {
            assert!(export_prometheus().is_empty());
        }
    }

    #[test]
    fn test_recovered_completion_leaves_active_gauge_alone() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            record_recovered_completion(Decision::Commit, None);
        });

        let text = handle.render();
        assert!(text.contains("xacoord_recovery_completed_total"));
        assert!(text.contains("xacoord_transactions_committed_total"));
        assert!(!text.contains("xacoord_transactions_active"));
    }

    #[test]
    fn test_latency_timer_elapsed() {
        let timer = LatencyTimer::new("xacoord_test_duration_ms");
        assert!(timer.elapsed_us() >= 0.0);
    }
}
