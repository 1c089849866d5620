//! Run orchestration: wires the pool, sequence coordinator, breaker and
//! executor together and drives one run through its lifecycle.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use eyre::{Result, WrapErr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arrivals::{ArrivalEvent, ArrivalGenerator, WorkItem};
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::delegate::{ConfirmationObserver, FlowDelegate, FundingAuthority};
use crate::error::FlowError;
use crate::executor::FlowExecutor;
use crate::nonce::NonceCoordinator;
use crate::pool::CredentialPool;
use crate::report::{BatchingStats, RunReport};

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Funding,
    Streaming,
    Draining,
    Reporting,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Funding => "funding",
            RunState::Streaming => "streaming",
            RunState::Draining => "draining",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Drives a run: pre-funds the pool, streams arrivals through the gate and
/// executor, drains in-flight work and assembles the report.
pub struct Orchestrator {
    config: RunConfig,
    delegate: Arc<dyn FlowDelegate>,
    funders: Vec<Arc<dyn FundingAuthority>>,
    observer: Option<Arc<dyn ConfirmationObserver>>,
    state: Mutex<RunState>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        delegate: Arc<dyn FlowDelegate>,
        funders: Vec<Arc<dyn FundingAuthority>>,
    ) -> Self {
        Self { config, delegate, funders, observer: None, state: Mutex::new(RunState::Idle) }
    }

    /// Attaches the optional confirmation observer; without it the report
    /// simply omits the batching section.
    pub fn with_observer(mut self, observer: Arc<dyn ConfirmationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn transition(&self, to: RunState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        info!(from = %*state, to = %to, "run state transition");
        *state = to;
    }

    /// Runs to completion. Cancelling the token stops new arrivals and new
    /// dispatch immediately and moves the run into draining; flows already
    /// dispatched finish or are force-timed-out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        self.config.validate().wrap_err("invalid run configuration")?;
        let started_at = Utc::now();
        let run_started = Instant::now();

        self.transition(RunState::Funding);
        let pool = CredentialPool::initialize(&self.config.pool, &self.funders)
            .await
            .wrap_err("credential pre-funding failed")?;

        let nonces = self
            .config
            .shared_authority
            .then(|| NonceCoordinator::new(0, self.config.gap_window));
        let context = RunContext::new(self.config.breaker.clone(), nonces);
        let executor =
            FlowExecutor::new(&self.config.executor, Arc::clone(&self.delegate), Arc::clone(&context));

        if cancel.is_cancelled() {
            info!("cancelled before streaming");
        } else {
            self.transition(RunState::Streaming);
            self.stream_arrivals(&cancel, &pool, &context, &executor).await?;
        }

        self.transition(RunState::Draining);
        let forced = context.drain(self.config.drain_timeout).await;
        if forced > 0 {
            warn!(forced, "flows force-completed at drain deadline");
        }

        self.transition(RunState::Reporting);
        let batching = self.batching_stats(&context).await;
        let metrics = context.metrics.finalize_with_elapsed(run_started.elapsed());
        let passed = metrics.success_rate >= self.config.pass_threshold;
        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            config: self.config.clone(),
            release_policy: executor.policy_name().to_string(),
            metrics,
            pool: pool.stats(),
            breaker: context.breaker.snapshot(),
            sequences: context.nonces.as_ref().map(NonceCoordinator::status),
            batching,
            peak_in_flight: context.tracker.peak() as u64,
            forced_timeouts: forced as u64,
            passed,
        };

        self.transition(RunState::Done);
        Ok(report)
    }

    async fn stream_arrivals(
        &self,
        cancel: &CancellationToken,
        pool: &CredentialPool,
        context: &Arc<RunContext>,
        executor: &FlowExecutor,
    ) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let generator = ArrivalGenerator::new(self.config.arrivals.clone(), cancel.child_token())
            .wrap_err("invalid arrival configuration")?;
        let progress = generator.progress();
        let generator_task = tokio::spawn(generator.run(events_tx));

        while let Some(event) = events_rx.recv().await {
            match event {
                ArrivalEvent::Arrived(item) => {
                    if cancel.is_cancelled() {
                        debug!(item = item.id, "discarding arrival after cancellation");
                        continue;
                    }
                    self.handle_arrival(item, pool, context, executor).await;
                }
                ArrivalEvent::PhaseChange(phase) => {
                    info!(%phase, emitted = progress.emitted(), "arrival phase change");
                }
                ArrivalEvent::Complete => {
                    info!(emitted = progress.emitted(), "arrival stream complete");
                }
            }
        }

        let _ = generator_task.await;
        Ok(())
    }

    /// Gate order: breaker first, then credential, then sequence
    /// reservation. A breaker rejection must not consume a credential or a
    /// concurrency slot.
    async fn handle_arrival(
        &self,
        item: WorkItem,
        pool: &CredentialPool,
        context: &Arc<RunContext>,
        executor: &FlowExecutor,
    ) {
        if context.breaker.check() {
            context.complete_rejected(&item, FlowError::CircuitOpen);
            return;
        }
        let credential = match pool.get() {
            Ok(credential) => credential,
            Err(error) => {
                context.complete_rejected(&item, error);
                return;
            }
        };
        let nonce = context.nonces.as_ref().map(NonceCoordinator::reserve_next);
        executor.dispatch(item, credential, nonce).await;
    }

    async fn batching_stats(&self, context: &RunContext) -> Option<BatchingStats> {
        let observer = self.observer.as_ref()?;
        let references = context.reference_sample();
        if references.is_empty() {
            return None;
        }

        let mut batches = HashSet::new();
        let mut utilization_sum = 0.0;
        let mut sampled = 0u64;
        for reference in &references {
            match observer.confirmation(reference).await {
                Ok(info) => {
                    sampled += 1;
                    batches.insert(info.batch_id);
                    if info.resource_limit > 0 {
                        utilization_sum += info.resource_used as f64 / info.resource_limit as f64;
                    }
                }
                Err(error) => {
                    debug!(reference, error = %error, "confirmation lookup failed");
                }
            }
        }

        (sampled > 0).then(|| BatchingStats {
            sampled,
            distinct_batches: batches.len() as u64,
            mean_utilization: utilization_sum / sampled as f64,
        })
    }
}
