//! CLI definitions for the load harness.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use surge_harness::{ReleasePolicyKind, RunConfig};
use tracing::Level;

/// Synthetic load-generation harness with a built-in simulated target.
#[derive(Debug, Clone, Parser)]
#[command(name = "surge", about = "Synthetic load-generation harness")]
pub struct Cli {
    /// Number of synthetic flows to run
    #[arg(long, env, default_value = "100")]
    pub population: u64,

    /// Extra funded credentials beyond the population
    #[arg(long, env, default_value = "10")]
    pub buffer: u64,

    /// Maximum concurrent in-flight flows
    #[arg(long, env, default_value = "10")]
    pub concurrency: usize,

    /// Target arrival rate during ramp-up (flows/sec)
    #[arg(long, env, default_value = "10.0")]
    pub ramp_up_rate: f64,

    /// Target arrival rate during sustain (flows/sec)
    #[arg(long, env, default_value = "20.0")]
    pub sustain_rate: f64,

    /// Target arrival rate during ramp-down (flows/sec)
    #[arg(long, env, default_value = "10.0")]
    pub ramp_down_rate: f64,

    /// Share of the population emitted during ramp-up
    #[arg(long, env, default_value = "0.3")]
    pub ramp_up_fraction: f64,

    /// Share of the population emitted during sustain
    #[arg(long, env, default_value = "0.6")]
    pub sustain_fraction: f64,

    /// Share of the population emitted during ramp-down
    #[arg(long, env, default_value = "0.1")]
    pub ramp_down_fraction: f64,

    /// Independent funding authorities used for pre-funding
    #[arg(long, env, default_value = "2")]
    pub funders: usize,

    /// Funding retries per still-unfunded batch
    #[arg(long, env, default_value = "2")]
    pub funding_retries: u32,

    /// Release the concurrency slot at submission ack instead of holding it
    /// through final confirmation
    #[arg(long, env, default_value = "false")]
    pub aggressive_release: bool,

    /// Cap on in-flight-but-unconfirmed flows under aggressive release
    #[arg(long, env)]
    pub unconfirmed_cap: Option<usize>,

    /// Consecutive failures that open the circuit breaker
    #[arg(long, env, default_value = "5")]
    pub failure_threshold: u32,

    /// Seconds of quiet before an open breaker probes for recovery
    #[arg(long, env, default_value = "10.0")]
    pub recovery_timeout_secs: f64,

    /// Per-flow deadline in seconds (0 disables it)
    #[arg(long, env, default_value = "30.0")]
    pub flow_timeout_secs: f64,

    /// Upper bound in seconds on waiting for in-flight flows at drain time
    #[arg(long, env, default_value = "30.0")]
    pub drain_timeout_secs: f64,

    /// Seconds before an unresolved sequence reservation counts as a gap
    #[arg(long, env, default_value = "5.0")]
    pub gap_window_secs: f64,

    /// Disable shared-authority sequence coordination
    #[arg(long, env, default_value = "false")]
    pub no_shared_authority: bool,

    /// Minimum success rate for a zero exit code
    #[arg(long, env, default_value = "0.95")]
    pub pass_threshold: f64,

    /// Mean simulated flow latency in milliseconds
    #[arg(long, env, default_value = "80")]
    pub sim_latency_ms: u64,

    /// Simulated latency jitter in milliseconds
    #[arg(long, env, default_value = "40")]
    pub sim_jitter_ms: u64,

    /// Probability that a simulated flow fails
    #[arg(long, env, default_value = "0.02")]
    pub sim_failure_rate: f64,

    /// Probability that a simulated funding call declines a credential
    #[arg(long, env, default_value = "0.0")]
    pub sim_funding_failure_rate: f64,

    /// Write the full JSON report to this path
    #[arg(long, env)]
    pub report_path: Option<PathBuf>,

    /// Log level
    #[arg(long, env, default_value = "info")]
    pub log_level: Level,

    /// Log format: text or json
    #[arg(long, env, default_value = "text")]
    pub log_format: String,
}

impl Cli {
    /// Assembles the harness run configuration.
    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::for_population(self.population);
        config.arrivals = config
            .arrivals
            .with_rates(self.ramp_up_rate, self.sustain_rate, self.ramp_down_rate)
            .with_fractions(self.ramp_up_fraction, self.sustain_fraction, self.ramp_down_fraction);
        config.pool.buffer_size = self.buffer;
        config.pool.funding_retries = self.funding_retries;
        config.executor.max_concurrency = self.concurrency;
        config.executor.flow_timeout = (self.flow_timeout_secs > 0.0)
            .then(|| Duration::from_secs_f64(self.flow_timeout_secs));
        config.executor.release = if self.aggressive_release {
            ReleasePolicyKind::Aggressive { unconfirmed_cap: self.unconfirmed_cap }
        } else {
            ReleasePolicyKind::Standard
        };
        config.breaker.failure_threshold = self.failure_threshold;
        config.breaker.recovery_timeout = Duration::from_secs_f64(self.recovery_timeout_secs);
        config.shared_authority = !self.no_shared_authority;
        config.gap_window = Duration::from_secs_f64(self.gap_window_secs);
        config.drain_timeout = Duration::from_secs_f64(self.drain_timeout_secs);
        config.pass_threshold = self.pass_threshold;
        config
    }
}
