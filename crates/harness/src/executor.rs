//! Concurrency-limited flow executor with pluggable slot-release policies.
//!
//! In-flight work is bounded by a semaphore. When the slot is given back is
//! a strategy decision: the standard policy holds it for the full flow
//! duration, the aggressive policy trades tail-latency bookkeeping for
//! throughput by releasing at the first intermediate acknowledgment.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyre::eyre;
use futures_util::FutureExt;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use crate::arrivals::{Phase, WorkItem};
use crate::config::{ExecutorConfig, ReleasePolicyKind};
use crate::context::RunContext;
use crate::delegate::{FlowDelegate, SubmissionAck};
use crate::error::FlowError;
use crate::metrics::classify;
use crate::pool::Credential;

/// Terminal outcome of one work item. Produced exactly once, consumed by
/// the metrics aggregator.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub item_id: u64,
    pub phase: Phase,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<FlowError>,
    pub reference: Option<String>,
}

impl FlowResult {
    pub(crate) fn success(item: &WorkItem, duration: Duration, reference: Option<String>) -> Self {
        Self { item_id: item.id, phase: item.phase, success: true, duration, error: None, reference }
    }

    pub(crate) fn failure(item: &WorkItem, duration: Duration, error: FlowError) -> Self {
        Self {
            item_id: item.id,
            phase: item.phase,
            success: false,
            duration,
            error: Some(error),
            reference: None,
        }
    }

    pub(crate) fn rejected(item: &WorkItem, error: FlowError) -> Self {
        Self::failure(item, Duration::ZERO, error)
    }
}

/// Decides when a flow's concurrency slot is given back.
#[async_trait]
pub trait ReleasePolicy: Send + Sync + fmt::Debug {
    /// Policy name for logs and the report.
    fn name(&self) -> &'static str;

    /// Holds `permit` until the policy's release condition is met. `ack`
    /// fires when the delegate observes an intermediate acknowledgment,
    /// `done` when the flow fully resolves.
    async fn hold(
        &self,
        permit: OwnedSemaphorePermit,
        ack: oneshot::Receiver<()>,
        done: oneshot::Receiver<()>,
    );
}

/// Holds the slot from dispatch through final resolution.
#[derive(Debug, Default)]
pub struct StandardRelease;

#[async_trait]
impl ReleasePolicy for StandardRelease {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn hold(
        &self,
        permit: OwnedSemaphorePermit,
        _ack: oneshot::Receiver<()>,
        done: oneshot::Receiver<()>,
    ) {
        let _permit = permit;
        let _ = done.await;
    }
}

/// Releases the slot at the first intermediate acknowledgment, letting the
/// next flow start while this one still awaits final confirmation.
///
/// Without a cap the unconfirmed tail is unbounded; `with_unconfirmed_cap`
/// bounds it with a secondary semaphore that an acked flow must hold until
/// it resolves.
#[derive(Debug)]
pub struct AggressiveRelease {
    unconfirmed: Option<Arc<Semaphore>>,
}

impl AggressiveRelease {
    /// Uncapped variant.
    pub fn new() -> Self {
        Self { unconfirmed: None }
    }

    /// Caps in-flight-but-unconfirmed flows at `cap`.
    pub fn with_unconfirmed_cap(cap: usize) -> Self {
        Self { unconfirmed: Some(Arc::new(Semaphore::new(cap))) }
    }
}

impl Default for AggressiveRelease {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleasePolicy for AggressiveRelease {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    async fn hold(
        &self,
        permit: OwnedSemaphorePermit,
        mut ack: oneshot::Receiver<()>,
        mut done: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            _ = &mut done => drop(permit),
            acked = &mut ack => {
                if acked.is_ok() {
                    // take the unconfirmed-cap slot before freeing the main one
                    let background = match &self.unconfirmed {
                        Some(cap) => Arc::clone(cap).acquire_owned().await.ok(),
                        None => None,
                    };
                    drop(permit);
                    let _background = background;
                    let _ = done.await;
                } else {
                    // ack dropped unfired: hold for the full flow duration
                    let _permit = permit;
                    let _ = done.await;
                }
            }
        }
    }
}

/// Builds the policy object for a configured kind.
pub fn release_policy(kind: ReleasePolicyKind) -> Arc<dyn ReleasePolicy> {
    match kind {
        ReleasePolicyKind::Standard => Arc::new(StandardRelease),
        ReleasePolicyKind::Aggressive { unconfirmed_cap: Some(cap) } => {
            Arc::new(AggressiveRelease::with_unconfirmed_cap(cap))
        }
        ReleasePolicyKind::Aggressive { unconfirmed_cap: None } => {
            Arc::new(AggressiveRelease::new())
        }
    }
}

/// Dispatches flows to the delegate under the concurrency bound.
pub struct FlowExecutor {
    semaphore: Arc<Semaphore>,
    policy: Arc<dyn ReleasePolicy>,
    delegate: Arc<dyn FlowDelegate>,
    flow_timeout: Option<Duration>,
    context: Arc<RunContext>,
}

impl FlowExecutor {
    pub fn new(
        config: &ExecutorConfig,
        delegate: Arc<dyn FlowDelegate>,
        context: Arc<RunContext>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            policy: release_policy(config.release),
            delegate,
            flow_timeout: config.flow_timeout,
            context,
        }
    }

    /// Waits for a concurrency slot, then runs the flow in the background.
    /// The result is recorded on the run context; completions carry no
    /// ordering relative to arrivals.
    pub async fn dispatch(&self, item: WorkItem, credential: Credential, nonce: Option<u64>) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.context.complete_rejected(
                    &item,
                    FlowError::Unknown("executor shut down before dispatch".to_string()),
                );
                return;
            }
        };

        let (ack, ack_rx) = SubmissionAck::new();
        let (done_tx, done_rx) = oneshot::channel();

        let policy = Arc::clone(&self.policy);
        tokio::spawn(async move { policy.hold(permit, ack_rx, done_rx).await });

        self.context.tracker.insert(item.id, item.phase, nonce);
        debug!(item = item.id, credential = %credential.id, ?nonce, "flow dispatched");

        let delegate = Arc::clone(&self.delegate);
        let context = Arc::clone(&self.context);
        let flow_timeout = self.flow_timeout;
        tokio::spawn(async move {
            let started = Instant::now();
            let flow = async {
                let execute = delegate.execute(&item, &credential, nonce, ack);
                match flow_timeout {
                    Some(limit) => match timeout(limit, execute).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(FlowError::SubmissionTimeout(format!(
                            "no result within {limit:?}"
                        ))
                        .into()),
                    },
                    None => execute.await,
                }
            };
            let outcome = AssertUnwindSafe(flow)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(eyre!("flow delegate panicked")));
            let duration = started.elapsed();

            let result = match outcome {
                Ok(outcome) => FlowResult::success(&item, duration, outcome.reference),
                Err(report) => {
                    let error = match report.downcast::<FlowError>() {
                        Ok(flow_error) => flow_error,
                        Err(opaque) => classify(&format!("{opaque:#}")),
                    };
                    FlowResult::failure(&item, duration, error)
                }
            };
            context.complete(result, nonce);
            let _ = done_tx.send(());
        });
    }

    /// Name of the active release policy.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}
