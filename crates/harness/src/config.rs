//! Run configuration for the load harness.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arrivals::Phase;
use crate::error::ConfigError;

/// Tolerance applied when checking that phase fractions sum to 1.0.
const FRACTION_EPSILON: f64 = 1e-6;

/// Shape of the three-phase arrival curve.
///
/// Phase boundaries are counted in emitted events, not wall clock, so a slow
/// phase can never postpone the ones after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalConfig {
    /// Total number of work items to emit.
    pub total: u64,
    /// Share of the population emitted during ramp-up.
    pub ramp_up_fraction: f64,
    /// Share of the population emitted during sustain.
    pub sustain_fraction: f64,
    /// Share of the population emitted during ramp-down.
    pub ramp_down_fraction: f64,
    /// Target arrival rate (events/sec) during ramp-up.
    pub ramp_up_rate: f64,
    /// Target arrival rate (events/sec) during sustain.
    pub sustain_rate: f64,
    /// Target arrival rate (events/sec) during ramp-down.
    pub ramp_down_rate: f64,
}

impl Default for ArrivalConfig {
    fn default() -> Self {
        Self {
            total: 100,
            ramp_up_fraction: 0.30,
            sustain_fraction: 0.60,
            ramp_down_fraction: 0.10,
            ramp_up_rate: 10.0,
            sustain_rate: 20.0,
            ramp_down_rate: 10.0,
        }
    }
}

impl ArrivalConfig {
    /// Sets the total population.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }

    /// Sets one target rate for all three phases.
    pub fn with_uniform_rate(mut self, rate: f64) -> Self {
        self.ramp_up_rate = rate;
        self.sustain_rate = rate;
        self.ramp_down_rate = rate;
        self
    }

    /// Sets the per-phase target rates.
    pub fn with_rates(mut self, ramp_up: f64, sustain: f64, ramp_down: f64) -> Self {
        self.ramp_up_rate = ramp_up;
        self.sustain_rate = sustain;
        self.ramp_down_rate = ramp_down;
        self
    }

    /// Sets the per-phase population shares.
    pub fn with_fractions(mut self, ramp_up: f64, sustain: f64, ramp_down: f64) -> Self {
        self.ramp_up_fraction = ramp_up;
        self.sustain_fraction = sustain;
        self.ramp_down_fraction = ramp_down;
        self
    }

    /// Rejects non-positive rates and fractions that do not sum to 1.0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (phase, rate) in [
            ("ramp-up", self.ramp_up_rate),
            ("sustain", self.sustain_rate),
            ("ramp-down", self.ramp_down_rate),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::NonPositiveRate { phase, rate });
            }
        }
        let sum = self.ramp_up_fraction + self.sustain_fraction + self.ramp_down_fraction;
        if !sum.is_finite() || (sum - 1.0).abs() > FRACTION_EPSILON {
            return Err(ConfigError::BadPhaseFractions(sum));
        }
        Ok(())
    }

    /// Number of events emitted in each phase. Rounding remainders land in
    /// ramp-down so the three counts always sum to `total`.
    pub fn phase_counts(&self) -> [u64; 3] {
        let ramp_up = (self.total as f64 * self.ramp_up_fraction).round() as u64;
        let sustain = (self.total as f64 * self.sustain_fraction).round() as u64;
        let ramp_up = ramp_up.min(self.total);
        let sustain = sustain.min(self.total - ramp_up);
        [ramp_up, sustain, self.total - ramp_up - sustain]
    }

    /// Phase the `emitted`-th event (0-based) belongs to.
    pub fn phase_for(&self, emitted: u64) -> Phase {
        let [ramp_up, sustain, _] = self.phase_counts();
        if emitted < ramp_up {
            Phase::RampUp
        } else if emitted < ramp_up + sustain {
            Phase::Sustain
        } else {
            Phase::RampDown
        }
    }

    /// Target rate for a phase.
    pub fn rate_for(&self, phase: Phase) -> f64 {
        match phase {
            Phase::RampUp => self.ramp_up_rate,
            Phase::Sustain => self.sustain_rate,
            Phase::RampDown => self.ramp_down_rate,
        }
    }
}

/// Credential pool sizing and funding behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Credentials needed to cover the planned population.
    pub target_population: u64,
    /// Extra credentials funded beyond the target population.
    pub buffer_size: u64,
    /// Funding retries per still-unfunded batch.
    pub funding_retries: u32,
    /// Remaining-funded count below which a warning fires once.
    pub low_watermark: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { target_population: 100, buffer_size: 10, funding_retries: 2, low_watermark: 5 }
    }
}

impl PoolConfig {
    /// Sets the target population.
    pub fn with_target_population(mut self, n: u64) -> Self {
        self.target_population = n;
        self
    }

    /// Sets the funding buffer size.
    pub fn with_buffer_size(mut self, n: u64) -> Self {
        self.buffer_size = n;
        self
    }

    /// Sets the per-batch funding retry count.
    pub fn with_funding_retries(mut self, n: u32) -> Self {
        self.funding_retries = n;
        self
    }

    /// Total credentials generated at initialization.
    pub fn pool_size(&self) -> u64 {
        self.target_population + self.buffer_size
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Quiet period after the last failure before a half-open probe.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(10),
            half_open_max_attempts: 2,
        }
    }
}

impl BreakerConfig {
    /// Sets the consecutive-failure threshold.
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Sets the recovery timeout.
    pub fn with_recovery_timeout(mut self, d: Duration) -> Self {
        self.recovery_timeout = d;
        self
    }
}

/// Which slot-release strategy the executor runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ReleasePolicyKind {
    /// Slot held from dispatch through final resolution.
    Standard,
    /// Slot released at the first intermediate acknowledgment, with an
    /// optional cap on in-flight-but-unconfirmed flows.
    Aggressive { unconfirmed_cap: Option<usize> },
}

/// Executor bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum concurrently held slots.
    pub max_concurrency: usize,
    /// Optional per-flow deadline; elapsing it synthesizes a timeout failure.
    pub flow_timeout: Option<Duration>,
    /// Slot-release strategy.
    pub release: ReleasePolicyKind,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            flow_timeout: Some(Duration::from_secs(30)),
            release: ReleasePolicyKind::Standard,
        }
    }
}

impl ExecutorConfig {
    /// Sets the concurrency ceiling.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Sets the per-flow timeout.
    pub fn with_flow_timeout(mut self, d: Option<Duration>) -> Self {
        self.flow_timeout = d;
        self
    }

    /// Sets the release policy.
    pub fn with_release(mut self, release: ReleasePolicyKind) -> Self {
        self.release = release;
        self
    }
}

/// Full configuration for one harness run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub arrivals: ArrivalConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub executor: ExecutorConfig,
    /// Whether flows share one signing authority and therefore need
    /// coordinated sequence numbers.
    pub shared_authority: bool,
    /// Age past which an unresolved sequence reservation counts as a gap.
    pub gap_window: Duration,
    /// Upper bound on waiting for in-flight flows at drain time.
    pub drain_timeout: Duration,
    /// Minimum success rate for the run to pass.
    pub pass_threshold: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            arrivals: ArrivalConfig::default(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            executor: ExecutorConfig::default(),
            shared_authority: true,
            gap_window: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            pass_threshold: 0.95,
        }
    }
}

impl RunConfig {
    /// Convenience constructor sizing the pool to the arrival population.
    pub fn for_population(total: u64) -> Self {
        let mut config = Self::default();
        config.arrivals.total = total;
        config.pool.target_population = total;
        config.pool.buffer_size = total / 10;
        config
    }

    /// Sets the drain timeout.
    pub fn with_drain_timeout(mut self, d: Duration) -> Self {
        self.drain_timeout = d;
        self
    }

    /// Sets the pass threshold.
    pub fn with_pass_threshold(mut self, t: f64) -> Self {
        self.pass_threshold = t;
        self
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.arrivals.validate()?;
        if self.executor.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(ConfigError::BadPassThreshold(self.pass_threshold));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn non_positive_rate_rejected() {
        let config = ArrivalConfig::default().with_rates(0.0, 20.0, 10.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveRate { phase: "ramp-up", .. })
        ));

        let config = ArrivalConfig::default().with_rates(10.0, -3.0, 10.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveRate { phase: "sustain", .. })
        ));
    }

    #[test]
    fn bad_fractions_rejected() {
        let config = ArrivalConfig::default().with_fractions(0.5, 0.5, 0.5);
        assert!(matches!(config.validate(), Err(ConfigError::BadPhaseFractions(_))));
    }

    #[test]
    fn phase_counts_sum_to_total() {
        for total in [0, 1, 7, 10, 100, 1003] {
            let config = ArrivalConfig::default().with_total(total);
            let [a, b, c] = config.phase_counts();
            assert_eq!(a + b + c, total, "total {total}");
        }
    }

    #[test]
    fn phase_boundaries_follow_counts() {
        let config = ArrivalConfig::default().with_total(10);
        assert_eq!(config.phase_counts(), [3, 6, 1]);
        assert_eq!(config.phase_for(0), Phase::RampUp);
        assert_eq!(config.phase_for(2), Phase::RampUp);
        assert_eq!(config.phase_for(3), Phase::Sustain);
        assert_eq!(config.phase_for(8), Phase::Sustain);
        assert_eq!(config.phase_for(9), Phase::RampDown);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = RunConfig::default();
        config.executor.max_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroConcurrency)));
    }
}
