//! Final run report assembly and emission.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerSnapshot;
use crate::config::RunConfig;
use crate::metrics::MetricsSnapshot;
use crate::nonce::NonceStatus;
use crate::pool::PoolStats;

/// Batching/utilization statistics sampled through the optional
/// confirmation observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingStats {
    /// Successful flows whose confirmation was looked up.
    pub sampled: u64,
    /// Distinct batches those flows landed in.
    pub distinct_batches: u64,
    /// Mean `resource_used / resource_limit` across sampled batches.
    pub mean_utilization: f64,
}

/// Everything the run produced, in one serializable summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: RunConfig,
    pub release_policy: String,
    pub metrics: MetricsSnapshot,
    pub pool: PoolStats,
    pub breaker: BreakerSnapshot,
    /// Present when flows shared one signing authority.
    pub sequences: Option<NonceStatus>,
    /// Present when a confirmation observer was configured and returned data.
    pub batching: Option<BatchingStats>,
    /// Highest simultaneous in-flight flow count observed.
    pub peak_in_flight: u64,
    /// Flows force-completed as timed out at the drain deadline.
    pub forced_timeouts: u64,
    /// Whether the success rate met the configured pass threshold.
    pub passed: bool,
}

/// Emits the finalized report somewhere useful.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &RunReport) -> Result<()>;
}

/// Writes the report as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonReportSink {
    fn emit(&self, report: &RunReport) -> Result<()> {
        let file = File::create(&self.path)
            .wrap_err_with(|| format!("failed to create report file {}", self.path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), report)
            .wrap_err("failed to serialize report")?;
        Ok(())
    }
}
