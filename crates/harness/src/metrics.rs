//! Outcome aggregation: counters, latency percentiles, throughput, phase
//! breakdowns and the error histogram.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::arrivals::Phase;
use crate::error::{ErrorClass, FlowError};
use crate::executor::FlowResult;

/// Raw error messages retained per class for the report.
const ERROR_SAMPLES_PER_CLASS: usize = 5;

/// Classifies an opaque error description into the failure taxonomy.
///
/// First-match substring inspection in fixed order: sequence conflict,
/// underpriced, timeout, insufficient resource, network, other. Substring
/// matching is fragile by nature, which is why every caller goes through
/// this one function; swapping in structured error codes later touches
/// nothing else.
pub fn classify(message: &str) -> FlowError {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(&["nonce", "sequence"]) {
        FlowError::SequenceConflict(message.to_string())
    } else if matches(&["underpriced", "replacement", "fee too low"]) {
        FlowError::Underpriced(message.to_string())
    } else if matches(&["timeout", "timed out", "deadline"]) {
        FlowError::SubmissionTimeout(message.to_string())
    } else if matches(&["insufficient"]) {
        FlowError::InsufficientResource(message.to_string())
    } else if matches(&["network", "connection", "connect", "unreachable", "refused", "reset"]) {
        FlowError::Network(message.to_string())
    } else {
        FlowError::Unknown(message.to_string())
    }
}

/// Completion counts for one arrival phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub completed: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Histogram bucket for one error class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBucket {
    pub count: u64,
    /// Capped sample of raw error messages.
    pub samples: Vec<String>,
}

/// Latency summary over all completed flows, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Finalized run metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub completed: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub elapsed_secs: f64,
    /// Completed flows per second over the run window.
    pub throughput_per_sec: f64,
    pub latency: LatencySummary,
    pub per_phase: BTreeMap<Phase, PhaseCounts>,
    pub errors: BTreeMap<ErrorClass, ErrorBucket>,
}

#[derive(Debug, Default)]
struct Totals {
    completed: u64,
    successful: u64,
    failed: u64,
    durations_ms: Vec<u64>,
    per_phase: BTreeMap<Phase, PhaseCounts>,
    errors: BTreeMap<ErrorClass, ErrorBucket>,
}

/// Records flow results and produces the final snapshot.
#[derive(Debug)]
pub struct MetricsAggregator {
    started: Instant,
    totals: Mutex<Totals>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self { started: Instant::now(), totals: Mutex::new(Totals::default()) }
    }

    /// Records one flow result. Exactly one call per work item.
    pub fn record(&self, result: &FlowResult) {
        let mut totals = self.totals.lock().expect("metrics lock poisoned");
        totals.completed += 1;
        totals.durations_ms.push(result.duration.as_millis() as u64);

        let phase = totals.per_phase.entry(result.phase).or_default();
        phase.completed += 1;
        if result.success {
            phase.successful += 1;
            totals.successful += 1;
        } else {
            phase.failed += 1;
            totals.failed += 1;
            if let Some(error) = &result.error {
                let bucket = totals.errors.entry(error.class()).or_default();
                bucket.count += 1;
                if bucket.samples.len() < ERROR_SAMPLES_PER_CLASS {
                    bucket.samples.push(error.to_string());
                }
            }
        }
    }

    /// Flows recorded so far.
    pub fn completed(&self) -> u64 {
        self.totals.lock().expect("metrics lock poisoned").completed
    }

    /// Finalizes against the wall clock since construction.
    pub fn finalize(&self) -> MetricsSnapshot {
        self.finalize_with_elapsed(self.started.elapsed())
    }

    /// Finalizes against an explicit elapsed window. Samples are sorted
    /// once, here.
    pub fn finalize_with_elapsed(&self, elapsed: Duration) -> MetricsSnapshot {
        let mut totals = self.totals.lock().expect("metrics lock poisoned");
        totals.durations_ms.sort_unstable();

        let elapsed_secs = elapsed.as_secs_f64();
        let throughput_per_sec =
            if elapsed_secs > 0.0 { totals.completed as f64 / elapsed_secs } else { 0.0 };
        let success_rate = if totals.completed > 0 {
            totals.successful as f64 / totals.completed as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            completed: totals.completed,
            successful: totals.successful,
            failed: totals.failed,
            success_rate,
            elapsed_secs,
            throughput_per_sec,
            latency: LatencySummary {
                p50_ms: percentile(&totals.durations_ms, 0.50),
                p95_ms: percentile(&totals.durations_ms, 0.95),
                p99_ms: percentile(&totals.durations_ms, 0.99),
                min_ms: totals.durations_ms.first().copied().unwrap_or(0),
                max_ms: totals.durations_ms.last().copied().unwrap_or(0),
            },
            per_phase: totals.per_phase.clone(),
            errors: totals.errors.clone(),
        }
    }
}

/// `sorted[floor(n * q)]`, clamped to the last sample.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: u64, phase: Phase, success: bool, ms: u64, error: Option<FlowError>) -> FlowResult {
        FlowResult {
            item_id: id,
            phase,
            success,
            duration: Duration::from_millis(ms),
            error,
            reference: None,
        }
    }

    #[test]
    fn percentile_indexes_floor_of_n_q() {
        let aggregator = MetricsAggregator::new();
        for (i, ms) in [100, 200, 300, 400, 500].into_iter().enumerate() {
            aggregator.record(&result(i as u64, Phase::Sustain, true, ms, None));
        }
        let snapshot = aggregator.finalize();
        assert_eq!(snapshot.latency.p50_ms, 300);
        assert_eq!(snapshot.latency.p95_ms, 500);
        assert_eq!(snapshot.latency.p99_ms, 500);
        assert_eq!(snapshot.latency.min_ms, 100);
        assert_eq!(snapshot.latency.max_ms, 500);
    }

    #[test]
    fn throughput_is_completed_over_elapsed() {
        let aggregator = MetricsAggregator::new();
        for i in 0..5 {
            aggregator.record(&result(i, Phase::Sustain, true, 10, None));
        }
        let snapshot = aggregator.finalize_with_elapsed(Duration::from_secs(5));
        assert!((snapshot.throughput_per_sec - 1.0).abs() < 1e-9);
    }

    #[test]
    fn counters_balance() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(&result(0, Phase::RampUp, true, 5, None));
        aggregator.record(&result(1, Phase::Sustain, false, 7, Some(FlowError::PoolExhausted)));
        aggregator.record(&result(2, Phase::Sustain, true, 9, None));

        let snapshot = aggregator.finalize();
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.completed, snapshot.successful + snapshot.failed);
        assert_eq!(snapshot.per_phase[&Phase::Sustain].completed, 2);
        assert_eq!(snapshot.per_phase[&Phase::Sustain].failed, 1);
        assert_eq!(snapshot.errors[&ErrorClass::PoolExhausted].count, 1);
    }

    #[test]
    fn error_samples_are_capped() {
        let aggregator = MetricsAggregator::new();
        for i in 0..10 {
            aggregator.record(&result(
                i,
                Phase::Sustain,
                false,
                1,
                Some(FlowError::Network(format!("connection reset {i}"))),
            ));
        }
        let snapshot = aggregator.finalize();
        let bucket = &snapshot.errors[&ErrorClass::Network];
        assert_eq!(bucket.count, 10);
        assert_eq!(bucket.samples.len(), ERROR_SAMPLES_PER_CLASS);
    }

    #[test]
    fn classify_matches_in_fixed_order() {
        assert_eq!(
            classify("nonce too low").class(),
            ErrorClass::SequenceConflict
        );
        assert_eq!(
            classify("transaction underpriced").class(),
            ErrorClass::Underpriced
        );
        assert_eq!(classify("request timed out").class(), ErrorClass::Timeout);
        assert_eq!(
            classify("insufficient funds for transfer").class(),
            ErrorClass::InsufficientResource
        );
        assert_eq!(classify("connection refused").class(), ErrorClass::Network);
        assert_eq!(classify("something odd").class(), ErrorClass::Unknown);

        // first match wins when several classes would apply
        assert_eq!(
            classify("nonce too low: replacement underpriced").class(),
            ErrorClass::SequenceConflict
        );
        // matching is case-insensitive
        assert_eq!(classify("Connection RESET by peer").class(), ErrorClass::Network);
    }

    #[test]
    fn empty_aggregator_finalizes_to_zeros() {
        let snapshot = MetricsAggregator::new().finalize();
        assert_eq!(snapshot.completed, 0);
        assert_eq!(snapshot.latency.p50_ms, 0);
        assert_eq!(snapshot.success_rate, 0.0);
    }
}
