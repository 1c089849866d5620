//! Error types for the harness core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure attached to a [`FlowResult`](crate::executor::FlowResult).
///
/// `PoolExhausted` and `CircuitOpen` are decided locally before dispatch and
/// never reach the flow delegate. Everything else is produced at the executor
/// boundary, either passed through typed from the delegate or derived from an
/// opaque error description by [`classify`](crate::metrics::classify).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// No funded credential was available at dispatch time.
    #[error("credential pool exhausted")]
    PoolExhausted,
    /// The circuit breaker rejected the dispatch.
    #[error("circuit open, dispatch rejected")]
    CircuitOpen,
    /// The shared authority rejected the reserved sequence number.
    #[error("sequence conflict: {0}")]
    SequenceConflict(String),
    /// The submission was rejected for carrying too low a price.
    #[error("submission underpriced: {0}")]
    Underpriced(String),
    /// No terminal outcome arrived in time.
    #[error("submission timed out: {0}")]
    SubmissionTimeout(String),
    /// The target lacked the resource needed to accept the submission.
    #[error("insufficient resource: {0}")]
    InsufficientResource(String),
    /// Transport-level failure talking to the target.
    #[error("network error: {0}")]
    Network(String),
    /// The target rejected the submission on a business rule.
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
    /// Anything that matched no known class.
    #[error("{0}")]
    Unknown(String),
}

impl FlowError {
    /// Histogram bucket for this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PoolExhausted => ErrorClass::PoolExhausted,
            Self::CircuitOpen => ErrorClass::CircuitOpen,
            Self::SequenceConflict(_) => ErrorClass::SequenceConflict,
            Self::Underpriced(_) => ErrorClass::Underpriced,
            Self::SubmissionTimeout(_) => ErrorClass::Timeout,
            Self::InsufficientResource(_) => ErrorClass::InsufficientResource,
            Self::Network(_) => ErrorClass::Network,
            Self::SubmissionRejected(_) => ErrorClass::Rejected,
            Self::Unknown(_) => ErrorClass::Unknown,
        }
    }
}

/// Failure classes reported in the error histogram.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    SequenceConflict,
    Underpriced,
    Timeout,
    InsufficientResource,
    Network,
    CircuitOpen,
    PoolExhausted,
    Rejected,
    Unknown,
}

/// Rejected configuration, surfaced at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("arrival rate for {phase} must be positive, got {rate}")]
    NonPositiveRate { phase: &'static str, rate: f64 },
    #[error("phase fractions must sum to 1.0, got {0}")]
    BadPhaseFractions(f64),
    #[error("max concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("pass threshold must be within 0.0..=1.0, got {0}")]
    BadPassThreshold(f64),
}
