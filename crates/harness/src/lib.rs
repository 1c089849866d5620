//! Traffic-shaping and concurrency-coordination engine for synthetic load
//! generation.
//!
//! The harness models realistic traffic against a networked transactional
//! service: an arrival process follows a three-phase rate curve, each
//! arrival claims a pre-funded single-use credential and (optionally) a
//! sequence number from a shared signing authority, passes a circuit
//! breaker, and runs through a concurrency-bounded executor. Outcomes feed
//! a metrics aggregator that produces the final [`report::RunReport`].
//!
//! The business operation itself lives behind [`delegate::FlowDelegate`];
//! this crate only coordinates when and how many flows are in flight and
//! tracks what happened to them.

pub mod arrivals;
pub mod breaker;
pub mod config;
pub mod context;
pub mod delegate;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod nonce;
pub mod orchestrator;
pub mod pool;
pub mod report;

pub use arrivals::{ArrivalEvent, ArrivalGenerator, ArrivalProgress, Phase, WorkItem};
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use config::{
    ArrivalConfig, BreakerConfig, ExecutorConfig, PoolConfig, ReleasePolicyKind, RunConfig,
};
pub use context::RunContext;
pub use delegate::{
    ConfirmationInfo, ConfirmationObserver, FlowDelegate, FlowOutcome, FundingAuthority,
    FundingReceipt, SubmissionAck,
};
pub use error::{ConfigError, ErrorClass, FlowError};
pub use executor::{
    AggressiveRelease, FlowExecutor, FlowResult, ReleasePolicy, StandardRelease,
};
pub use metrics::{classify, MetricsAggregator, MetricsSnapshot};
pub use nonce::{NonceCoordinator, NonceStatus};
pub use orchestrator::{Orchestrator, RunState};
pub use pool::{Credential, CredentialId, CredentialPool, FundingState, PoolStats};
pub use report::{BatchingStats, JsonReportSink, ReportSink, RunReport};
