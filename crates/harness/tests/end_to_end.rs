//! End-to-end runs through the orchestrator with simulated collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyre::{eyre, Result};
use surge_harness::{
    CircuitState, ConfirmationInfo, ConfirmationObserver, Credential, CredentialId, ErrorClass,
    FlowDelegate, FlowOutcome, FundingAuthority, FundingReceipt, Orchestrator,
    ReleasePolicyKind, RunConfig, RunReport, SubmissionAck, WorkItem,
};
use tokio_util::sync::CancellationToken;

/// Funds every credential on the first attempt.
#[derive(Debug, Default)]
struct InstantFunder;

#[async_trait]
impl FundingAuthority for InstantFunder {
    async fn fund(&self, ids: &[CredentialId]) -> Result<Vec<FundingReceipt>> {
        Ok(ids.iter().map(|id| FundingReceipt::ok(*id)).collect())
    }
}

/// Succeeds after a fixed delay, counting invocations.
#[derive(Debug)]
struct SucceedingDelegate {
    delay: Duration,
    ack_early: bool,
    calls: AtomicU32,
}

impl SucceedingDelegate {
    fn new(delay: Duration) -> Self {
        Self { delay, ack_early: false, calls: AtomicU32::new(0) }
    }

    fn acking(delay: Duration) -> Self {
        Self { delay, ack_early: true, calls: AtomicU32::new(0) }
    }
}

#[async_trait]
impl FlowDelegate for SucceedingDelegate {
    async fn execute(
        &self,
        item: &WorkItem,
        _credential: &Credential,
        _nonce: Option<u64>,
        mut ack: SubmissionAck,
    ) -> Result<FlowOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.ack_early {
            ack.submitted();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(FlowOutcome::with_reference(format!("0xref{:04}", item.id)))
    }
}

/// Fails instantly, counting invocations.
#[derive(Debug, Default)]
struct FailingDelegate {
    calls: AtomicU32,
}

#[async_trait]
impl FlowDelegate for FailingDelegate {
    async fn execute(
        &self,
        _item: &WorkItem,
        _credential: &Credential,
        _nonce: Option<u64>,
        _ack: SubmissionAck,
    ) -> Result<FlowOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(eyre!("connection reset by peer"))
    }
}

fn funders() -> Vec<Arc<dyn FundingAuthority>> {
    vec![Arc::new(InstantFunder)]
}

fn base_config(population: u64, rate: f64) -> RunConfig {
    let mut config = RunConfig::for_population(population);
    config.arrivals = config.arrivals.with_uniform_rate(rate);
    config.drain_timeout = Duration::from_secs(10);
    config
}

async fn run(config: RunConfig, delegate: Arc<dyn FlowDelegate>) -> RunReport {
    Orchestrator::new(config, delegate, funders())
        .run(CancellationToken::new())
        .await
        .expect("run failed")
}

#[tokio::test]
async fn all_successes_complete_within_the_concurrency_bound() {
    let mut config = base_config(10, 200.0);
    config.executor.max_concurrency = 3;

    let delegate = Arc::new(SucceedingDelegate::new(Duration::from_millis(50)));
    let report = run(config, delegate.clone()).await;

    assert_eq!(report.metrics.successful, 10);
    assert_eq!(report.metrics.failed, 0);
    assert_eq!(report.metrics.completed, report.metrics.successful + report.metrics.failed);
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 10);
    assert!(report.peak_in_flight <= 3, "peak {} exceeds bound", report.peak_in_flight);
    assert!(report.passed);
    assert!(report.metrics.latency.p50_ms >= 50);
}

#[tokio::test]
async fn breaker_opens_and_fails_the_tail_fast() {
    let mut config = base_config(5, 50.0);
    config.breaker = config
        .breaker
        .with_failure_threshold(3)
        .with_recovery_timeout(Duration::from_secs(60));

    let delegate = Arc::new(FailingDelegate::default());
    let report = run(config, delegate.clone()).await;

    // the third failure opens the circuit; the remaining two never reach
    // the delegate
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.metrics.failed, 5);
    assert_eq!(report.metrics.completed, 5);
    assert_eq!(report.breaker.state, CircuitState::Open);
    assert_eq!(report.breaker.times_opened, 1);
    assert_eq!(report.metrics.errors[&ErrorClass::CircuitOpen].count, 2);
    assert_eq!(report.metrics.errors[&ErrorClass::Network].count, 3);
    assert!(!report.passed);
}

#[tokio::test]
async fn pool_exhaustion_rejects_the_overflow_without_dispatch() {
    let mut config = base_config(10, 300.0);
    config.pool.target_population = 3;
    config.pool.buffer_size = 0;

    let delegate = Arc::new(SucceedingDelegate::new(Duration::from_millis(5)));
    let report = run(config, delegate.clone()).await;

    assert_eq!(report.metrics.successful, 3);
    assert_eq!(report.metrics.failed, 7);
    assert_eq!(report.metrics.errors[&ErrorClass::PoolExhausted].count, 7);
    assert_eq!(delegate.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.pool.dispensed, 3);
    assert_eq!(report.breaker.state, CircuitState::Closed);
}

#[tokio::test]
async fn drain_deadline_force_completes_stragglers() {
    let mut config = base_config(2, 500.0);
    config.executor.flow_timeout = None;
    config.drain_timeout = Duration::from_millis(100);

    let delegate = Arc::new(SucceedingDelegate::new(Duration::from_secs(30)));
    let report = run(config, delegate).await;

    assert_eq!(report.forced_timeouts, 2);
    assert_eq!(report.metrics.failed, 2);
    assert_eq!(report.metrics.errors[&ErrorClass::Timeout].count, 2);

    // the burned sequence numbers are accounted, none left pending
    let sequences = report.sequences.expect("shared authority enabled");
    assert_eq!(sequences.failed, 2);
    assert_eq!(sequences.pending, 0);
}

#[tokio::test]
async fn cancellation_truncates_the_run_cleanly() {
    let config = base_config(100_000, 100.0);
    let delegate = Arc::new(SucceedingDelegate::new(Duration::from_millis(5)));
    let cancel = CancellationToken::new();

    let orchestrator = Orchestrator::new(config, delegate, funders());
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let report = orchestrator.run(cancel).await.expect("run failed");
    assert!(report.metrics.completed < 100_000);
    assert_eq!(report.metrics.completed, report.metrics.successful + report.metrics.failed);
}

#[tokio::test]
async fn aggressive_release_overlaps_flows_past_the_slot_bound() {
    let mut config = base_config(6, 1000.0);
    config.executor.max_concurrency = 1;
    config.executor.release = ReleasePolicyKind::Aggressive { unconfirmed_cap: None };

    let delegate = Arc::new(SucceedingDelegate::acking(Duration::from_millis(50)));
    let started = Instant::now();
    let report = run(config, delegate).await;

    // serialized execution would need ~300ms of flow time
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(report.metrics.successful, 6);
    assert!(report.peak_in_flight > 1);
    assert_eq!(report.release_policy, "aggressive");
}

#[tokio::test]
async fn shared_authority_sequences_are_fully_accounted() {
    let config = base_config(8, 300.0);
    let report = run(config, Arc::new(SucceedingDelegate::new(Duration::from_millis(5)))).await;

    let sequences = report.sequences.expect("shared authority enabled");
    assert_eq!(sequences.next, 8);
    assert_eq!(sequences.confirmed, 8);
    assert_eq!(sequences.pending, 0);
    assert!(sequences.gaps.is_empty());
}

#[tokio::test]
async fn confirmation_observer_adds_batching_stats() {
    /// Buckets references into batches of four.
    #[derive(Debug)]
    struct BatchObserver;

    #[async_trait]
    impl ConfirmationObserver for BatchObserver {
        async fn confirmation(&self, reference: &str) -> Result<ConfirmationInfo> {
            let id: u64 = reference.trim_start_matches("0xref").parse()?;
            Ok(ConfirmationInfo {
                batch_id: id / 4,
                resource_used: 500_000,
                resource_limit: 1_000_000,
            })
        }
    }

    let config = base_config(8, 300.0);
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(SucceedingDelegate::new(Duration::from_millis(5))),
        funders(),
    )
    .with_observer(Arc::new(BatchObserver));

    let report = orchestrator.run(CancellationToken::new()).await.expect("run failed");
    let batching = report.batching.expect("observer configured");
    assert_eq!(batching.sampled, 8);
    assert_eq!(batching.distinct_batches, 2);
    assert!((batching.mean_utilization - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn independent_runs_coexist_in_one_process() {
    let first = Orchestrator::new(
        base_config(5, 300.0),
        Arc::new(SucceedingDelegate::new(Duration::from_millis(5))),
        funders(),
    );
    let second = Orchestrator::new(
        base_config(5, 300.0),
        Arc::new(FailingDelegate::default()),
        funders(),
    );

    let (a, b) = tokio::join!(
        first.run(CancellationToken::new()),
        second.run(CancellationToken::new())
    );
    let (a, b) = (a.expect("first run failed"), b.expect("second run failed"));

    assert_eq!(a.metrics.successful, 5);
    assert_eq!(b.metrics.successful, 0);
    assert_eq!(b.metrics.completed, 5);
    // the failing run's breaker state never leaks into the succeeding run
    assert_eq!(a.breaker.state, CircuitState::Closed);
}
