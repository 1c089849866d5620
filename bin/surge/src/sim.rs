//! Simulated target for self-contained runs.
//!
//! Stands in for the system under test: flows take a sampled latency, fail
//! with a configurable probability using realistic error messages, and
//! acknowledge submission partway through so the aggressive release policy
//! has something to react to. Confirmations are grouped into fixed-size
//! batches for the report's utilization section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result};
use rand::Rng;
use surge_harness::{
    ConfirmationInfo, ConfirmationObserver, Credential, CredentialId, FlowDelegate, FlowOutcome,
    FundingAuthority, FundingReceipt, SubmissionAck, WorkItem,
};
use tokio::time::sleep;
use tracing::trace;

/// Flows per simulated batch.
const BATCH_SIZE: u64 = 25;
/// Resource ceiling of a simulated batch.
const BATCH_RESOURCE_LIMIT: u64 = 30_000_000;
/// Resource one flow consumes in its batch.
const FLOW_RESOURCE: u64 = 150_000;

/// Error messages drawn on injected failures, shaped like the ones a real
/// transactional endpoint returns.
const FAILURE_MESSAGES: &[&str] = &[
    "nonce too low: next expected differs from submitted",
    "replacement transaction underpriced",
    "request timed out awaiting confirmation",
    "insufficient funds for intrinsic cost",
    "connection reset by peer",
    "rejected by admission policy",
];

/// Simulated flow behavior knobs.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Mean end-to-end flow latency.
    pub latency: Duration,
    /// Uniform jitter added on top of the mean.
    pub jitter: Duration,
    /// Probability that a flow fails.
    pub failure_rate: f64,
}

/// Simulated transactional service.
#[derive(Debug)]
pub struct SimTarget {
    config: SimConfig,
    confirmed: AtomicU64,
}

impl SimTarget {
    pub fn new(config: SimConfig) -> Self {
        Self { config, confirmed: AtomicU64::new(0) }
    }

    fn sample_latency(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 { rand::rng().random_range(0..=jitter_ms) } else { 0 };
        self.config.latency + Duration::from_millis(extra)
    }
}

#[async_trait]
impl FlowDelegate for SimTarget {
    async fn execute(
        &self,
        item: &WorkItem,
        credential: &Credential,
        nonce: Option<u64>,
        mut ack: SubmissionAck,
    ) -> Result<FlowOutcome> {
        let latency = self.sample_latency();
        trace!(item = item.id, credential = %credential.id, ?nonce, ?latency, "sim flow start");

        // submission leg, then the acknowledgment the release policy watches
        sleep(latency / 4).await;
        let failed = rand::rng().random::<f64>() < self.config.failure_rate;
        if failed {
            let index = rand::rng().random_range(0..FAILURE_MESSAGES.len());
            return Err(eyre!("{}", FAILURE_MESSAGES[index]));
        }
        ack.submitted();

        // confirmation leg
        sleep(latency - latency / 4).await;
        self.confirmed.fetch_add(1, Ordering::Relaxed);

        let receipt: [u8; 32] = rand::rng().random();
        Ok(FlowOutcome::with_reference(format!("0x{}", hex::encode(receipt))))
    }
}

/// Groups confirmed references into fixed-size batches, assigned in lookup
/// order.
#[derive(Debug, Default)]
pub struct SimConfirmations {
    assigned: Mutex<HashMap<String, u64>>,
    next: AtomicU64,
}

#[async_trait]
impl ConfirmationObserver for SimConfirmations {
    async fn confirmation(&self, reference: &str) -> Result<ConfirmationInfo> {
        let mut assigned = self.assigned.lock().expect("sim confirmations lock poisoned");
        let slot = *assigned
            .entry(reference.to_string())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed));
        let batch_id = slot / BATCH_SIZE;
        let in_batch = (slot % BATCH_SIZE) + 1;
        Ok(ConfirmationInfo {
            batch_id,
            resource_used: in_batch * FLOW_RESOURCE,
            resource_limit: BATCH_RESOURCE_LIMIT,
        })
    }
}

/// Simulated funding authority.
#[derive(Debug)]
pub struct SimFunder {
    /// Which of the N configured authorities this one is, for logging only.
    slot: usize,
    failure_rate: f64,
}

impl SimFunder {
    pub fn new(slot: usize, failure_rate: f64) -> Self {
        Self { slot, failure_rate }
    }
}

#[async_trait]
impl FundingAuthority for SimFunder {
    async fn fund(&self, ids: &[CredentialId]) -> Result<Vec<FundingReceipt>> {
        // one round-trip per batch regardless of size
        sleep(Duration::from_millis(20)).await;
        let receipts = ids
            .iter()
            .map(|id| {
                if rand::rng().random::<f64>() < self.failure_rate {
                    FundingReceipt::failed(*id, "faucet declined")
                } else {
                    FundingReceipt::ok(*id)
                }
            })
            .collect();
        trace!(slot = self.slot, count = ids.len(), "sim funding batch complete");
        Ok(receipts)
    }
}
