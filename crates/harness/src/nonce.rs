//! Sequence (nonce) coordination for a shared signing authority.
//!
//! Many concurrent flows submit through one authority, so reservation must
//! be serialized even though the submission work itself proceeds
//! concurrently. Reservation is a single atomic increment; confirmation and
//! failure bookkeeping live behind a mutex touched only in non-await
//! sections.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Snapshot of the coordinator, included in the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceStatus {
    /// Highest sequence number issued so far, if any.
    pub current: Option<u64>,
    /// Next sequence number to be issued.
    pub next: u64,
    /// Reservations without a terminal outcome.
    pub pending: u64,
    /// Reservations confirmed.
    pub confirmed: u64,
    /// Reservations failed.
    pub failed: u64,
    /// Reservations unresolved past the observation window. A gap blocks
    /// every higher number downstream, so gaps are surfaced, never recycled.
    pub gaps: Vec<u64>,
}

#[derive(Debug)]
struct Ledger {
    pending: BTreeMap<u64, Instant>,
    confirmed: u64,
    failed: u64,
}

/// Issues strictly increasing sequence numbers and tracks their resolution.
#[derive(Debug)]
pub struct NonceCoordinator {
    next: AtomicU64,
    start: u64,
    gap_window: Duration,
    ledger: Mutex<Ledger>,
}

impl NonceCoordinator {
    /// Creates a coordinator issuing from `start`.
    pub fn new(start: u64, gap_window: Duration) -> Self {
        Self {
            next: AtomicU64::new(start),
            start,
            gap_window,
            ledger: Mutex::new(Ledger { pending: BTreeMap::new(), confirmed: 0, failed: 0 }),
        }
    }

    /// Reserves the next sequence number. Concurrent callers never receive
    /// the same number; the reservation point is O(1) and never does I/O.
    pub fn reserve_next(&self) -> u64 {
        let nonce = self.next.fetch_add(1, Ordering::SeqCst);
        self.ledger.lock().expect("nonce ledger poisoned").pending.insert(nonce, Instant::now());
        nonce
    }

    /// Records a confirmed submission for `nonce`.
    pub fn confirm(&self, nonce: u64) {
        let mut ledger = self.ledger.lock().expect("nonce ledger poisoned");
        if ledger.pending.remove(&nonce).is_some() {
            ledger.confirmed += 1;
        } else {
            warn!(nonce, "confirm for unknown or already-resolved nonce");
        }
    }

    /// Records a failed submission for `nonce`. The number stays burned;
    /// it is never reissued.
    pub fn fail(&self, nonce: u64) {
        let mut ledger = self.ledger.lock().expect("nonce ledger poisoned");
        if ledger.pending.remove(&nonce).is_some() {
            ledger.failed += 1;
            debug!(nonce, "nonce burned");
        } else {
            warn!(nonce, "fail for unknown or already-resolved nonce");
        }
    }

    /// Current coordinator state, with gap detection against the
    /// observation window.
    pub fn status(&self) -> NonceStatus {
        let next = self.next.load(Ordering::SeqCst);
        let ledger = self.ledger.lock().expect("nonce ledger poisoned");
        let now = Instant::now();
        let gaps = ledger
            .pending
            .iter()
            .filter(|(_, reserved_at)| now.duration_since(**reserved_at) > self.gap_window)
            .map(|(nonce, _)| *nonce)
            .collect();
        NonceStatus {
            current: (next > self.start).then(|| next - 1),
            next,
            pending: ledger.pending.len() as u64,
            confirmed: ledger.confirmed,
            failed: ledger.failed,
            gaps,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn concurrent_reservations_are_contiguous_and_unique() {
        let coordinator = Arc::new(NonceCoordinator::new(100, Duration::from_secs(1)));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move { coordinator.reserve_next() }));
        }

        let mut reserved = HashSet::new();
        for handle in handles {
            assert!(reserved.insert(handle.await.unwrap()), "duplicate nonce issued");
        }
        let expected: HashSet<u64> = (100..150).collect();
        assert_eq!(reserved, expected);
    }

    #[test]
    fn status_tracks_terminal_outcomes() {
        let coordinator = NonceCoordinator::new(0, Duration::from_secs(1));
        let a = coordinator.reserve_next();
        let b = coordinator.reserve_next();
        let c = coordinator.reserve_next();
        coordinator.confirm(a);
        coordinator.fail(b);

        let status = coordinator.status();
        assert_eq!(status.current, Some(c));
        assert_eq!(status.next, 3);
        assert_eq!(status.pending, 1);
        assert_eq!(status.confirmed, 1);
        assert_eq!(status.failed, 1);
        assert!(status.gaps.is_empty());
    }

    #[test]
    fn fresh_coordinator_has_no_current() {
        let coordinator = NonceCoordinator::new(7, Duration::from_secs(1));
        let status = coordinator.status();
        assert_eq!(status.current, None);
        assert_eq!(status.next, 7);
    }

    #[tokio::test]
    async fn stuck_reservation_becomes_a_gap() {
        let coordinator = NonceCoordinator::new(0, Duration::from_millis(20));
        let a = coordinator.reserve_next();
        let b = coordinator.reserve_next();
        let c = coordinator.reserve_next();
        coordinator.confirm(a);
        coordinator.confirm(c);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let status = coordinator.status();
        assert_eq!(status.gaps, vec![b]);

        // resolving the straggler clears the gap
        coordinator.fail(b);
        assert!(coordinator.status().gaps.is_empty());
    }

    #[test]
    fn failed_nonce_is_not_reissued() {
        let coordinator = NonceCoordinator::new(0, Duration::from_secs(1));
        let a = coordinator.reserve_next();
        coordinator.fail(a);
        assert_eq!(coordinator.reserve_next(), a + 1);
    }
}
