//! Per-run shared state handed to the executor.
//!
//! One [`RunContext`] exists per run and is injected everywhere shared
//! mutable state is needed; there are no process-wide singletons, so
//! independent runs can coexist in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::arrivals::{Phase, WorkItem};
use crate::breaker::CircuitBreaker;
use crate::config::BreakerConfig;
use crate::error::FlowError;
use crate::executor::FlowResult;
use crate::metrics::MetricsAggregator;
use crate::nonce::NonceCoordinator;

/// External references retained for confirmation sampling.
const REFERENCE_SAMPLE_CAP: usize = 128;

#[derive(Debug, Clone, Copy)]
pub(crate) struct InFlightFlow {
    pub phase: Phase,
    pub nonce: Option<u64>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    in_flight: HashMap<u64, InFlightFlow>,
    peak: usize,
}

/// Tracks dispatched-but-unresolved flows so the drain phase can wait for
/// them and force-complete stragglers.
#[derive(Debug, Default)]
pub struct FlowTracker {
    inner: Mutex<TrackerInner>,
    notify: Notify,
}

impl FlowTracker {
    pub(crate) fn insert(&self, item_id: u64, phase: Phase, nonce: Option<u64>) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.in_flight.insert(item_id, InFlightFlow { phase, nonce });
        inner.peak = inner.peak.max(inner.in_flight.len());
    }

    pub(crate) fn take(&self, item_id: u64) -> Option<InFlightFlow> {
        self.inner.lock().expect("tracker lock poisoned").in_flight.remove(&item_id)
    }

    fn take_all(&self) -> Vec<(u64, InFlightFlow)> {
        self.inner.lock().expect("tracker lock poisoned").in_flight.drain().collect()
    }

    /// Dispatched flows still awaiting resolution.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").in_flight.len()
    }

    /// Highest simultaneous in-flight count observed.
    pub fn peak(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").peak
    }

    fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// Shared mutable state for one run.
#[derive(Debug)]
pub struct RunContext {
    pub metrics: MetricsAggregator,
    pub breaker: CircuitBreaker,
    /// Present when flows share one signing authority.
    pub nonces: Option<NonceCoordinator>,
    pub tracker: FlowTracker,
    references: Mutex<Vec<String>>,
}

impl RunContext {
    pub fn new(breaker: BreakerConfig, nonces: Option<NonceCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            metrics: MetricsAggregator::new(),
            breaker: CircuitBreaker::new(breaker),
            nonces,
            tracker: FlowTracker::default(),
            references: Mutex::new(Vec::new()),
        })
    }

    /// Records the terminal result of a dispatched flow: exactly once per
    /// work item. A result arriving after the flow was force-completed at
    /// drain time is dropped here.
    pub(crate) fn complete(&self, result: FlowResult, nonce: Option<u64>) {
        if self.tracker.take(result.item_id).is_none() {
            debug!(item = result.item_id, "late result for force-completed flow, dropping");
            return;
        }

        if result.success {
            self.breaker.record_success();
            if let (Some(nonce), Some(coordinator)) = (nonce, &self.nonces) {
                coordinator.confirm(nonce);
            }
            if let Some(reference) = &result.reference {
                let mut references = self.references.lock().expect("references lock poisoned");
                if references.len() < REFERENCE_SAMPLE_CAP {
                    references.push(reference.clone());
                }
            }
        } else {
            self.breaker.record_failure();
            if let (Some(nonce), Some(coordinator)) = (nonce, &self.nonces) {
                coordinator.fail(nonce);
            }
        }

        self.metrics.record(&result);
        self.tracker.notify.notify_waiters();
    }

    /// Records a pre-dispatch rejection (`PoolExhausted`, `CircuitOpen`).
    /// These never consumed a slot or invoked the delegate, so they bypass
    /// the breaker feedback.
    pub(crate) fn complete_rejected(&self, item: &WorkItem, error: FlowError) {
        debug!(item = item.id, %error, "rejected before dispatch");
        self.metrics.record(&FlowResult::rejected(item, error));
    }

    /// Waits for in-flight flows up to `limit`, then force-completes
    /// whatever is left as timed-out failures. Returns the number of
    /// force-completed flows.
    pub async fn drain(&self, limit: Duration) -> usize {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.tracker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.tracker.in_flight() == 0 {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }

        let stragglers = self.tracker.take_all();
        let forced = stragglers.len();
        for (item_id, flow) in stragglers {
            warn!(item = item_id, "force-completing flow at drain deadline");
            if let (Some(nonce), Some(coordinator)) = (flow.nonce, &self.nonces) {
                coordinator.fail(nonce);
            }
            self.metrics.record(&FlowResult {
                item_id,
                phase: flow.phase,
                success: false,
                duration: limit,
                error: Some(FlowError::SubmissionTimeout(
                    "unresolved at drain deadline".to_string(),
                )),
                reference: None,
            });
        }
        forced
    }

    /// Sampled external references from successful flows.
    pub fn reference_sample(&self) -> Vec<String> {
        self.references.lock().expect("references lock poisoned").clone()
    }
}
