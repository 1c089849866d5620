//! Arrival process generator for the three-phase load curve.
//!
//! Emits one [`WorkItem`] per arrival with exponentially sampled
//! inter-arrival delays. Phase membership is decided by cumulative emitted
//! count so a phase running behind its target rate cannot postpone the
//! phases after it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ArrivalConfig;
use crate::error::ConfigError;

/// Rate multiplier at the start of ramp-up.
const RAMP_UP_START_FACTOR: f64 = 0.5;
/// Rate multiplier at the end of ramp-down.
const RAMP_DOWN_END_FACTOR: f64 = 0.3;

/// Segment of the arrival-rate curve.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RampUp,
    Sustain,
    RampDown,
}

impl Phase {
    /// All phases in curve order.
    pub const ALL: [Phase; 3] = [Phase::RampUp, Phase::Sustain, Phase::RampDown];

    fn index(self) -> u8 {
        match self {
            Phase::RampUp => 0,
            Phase::Sustain => 1,
            Phase::RampDown => 2,
        }
    }

    fn from_index(index: u8) -> Phase {
        match index {
            0 => Phase::RampUp,
            1 => Phase::Sustain,
            _ => Phase::RampDown,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::RampUp => write!(f, "ramp-up"),
            Phase::Sustain => write!(f, "sustain"),
            Phase::RampDown => write!(f, "ramp-down"),
        }
    }
}

/// One synthetic unit of work.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Zero-based emission index, unique within a run.
    pub id: u64,
    /// When the generator emitted this item.
    pub arrival: Instant,
    /// Curve phase the item was emitted in.
    pub phase: Phase,
}

/// Typed notifications emitted by [`ArrivalGenerator::run`].
#[derive(Debug)]
pub enum ArrivalEvent {
    /// A work item arrived.
    Arrived(WorkItem),
    /// The curve moved into a new phase.
    PhaseChange(Phase),
    /// Every item has been emitted.
    Complete,
}

/// Progress counters shared with observers while the generator runs.
#[derive(Debug)]
pub struct ArrivalProgress {
    emitted: AtomicU64,
    total: u64,
    phase: AtomicU8,
}

impl ArrivalProgress {
    /// Items emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Total items this run will emit.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Phase currently being emitted.
    pub fn phase(&self) -> Phase {
        Phase::from_index(self.phase.load(Ordering::Relaxed))
    }
}

/// Emits timed arrival events following the configured three-phase curve.
#[derive(Debug)]
pub struct ArrivalGenerator {
    config: ArrivalConfig,
    progress: Arc<ArrivalProgress>,
    cancel: CancellationToken,
}

impl ArrivalGenerator {
    /// Creates a generator, rejecting invalid curve configuration.
    pub fn new(config: ArrivalConfig, cancel: CancellationToken) -> Result<Self, ConfigError> {
        config.validate()?;
        let progress = Arc::new(ArrivalProgress {
            emitted: AtomicU64::new(0),
            total: config.total,
            phase: AtomicU8::new(config.phase_for(0).index()),
        });
        Ok(Self { config, progress, cancel })
    }

    /// Shared handle to the progress counters.
    pub fn progress(&self) -> Arc<ArrivalProgress> {
        Arc::clone(&self.progress)
    }

    /// Emits events until the population is exhausted or the token is
    /// cancelled. A cancelled token wins the race against the pending
    /// inter-arrival timer, so no scheduled-but-unfired arrival slips out.
    pub async fn run(self, events: mpsc::Sender<ArrivalEvent>) {
        if self.config.total == 0 {
            let _ = events.send(ArrivalEvent::Complete).await;
            return;
        }

        let mut emitted = 0u64;
        let mut phase = self.config.phase_for(0);
        let mut phase_started = Instant::now();

        info!(total = self.config.total, ?phase, "arrival generator started");

        loop {
            let current = self.config.phase_for(emitted);
            if current != phase {
                phase = current;
                phase_started = Instant::now();
                self.progress.phase.store(phase.index(), Ordering::Relaxed);
                debug!(%phase, emitted, "phase transition");
                if events.send(ArrivalEvent::PhaseChange(phase)).await.is_err() {
                    return;
                }
            }

            let rate = self.current_rate(phase, phase_started.elapsed());
            let delay = exponential_delay(rate);

            // biased so a cancelled token always beats an elapsed timer
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(emitted, "arrival generator stopped");
                    return;
                }
                _ = sleep(delay) => {}
            }

            let item = WorkItem { id: emitted, arrival: Instant::now(), phase };
            emitted += 1;
            self.progress.emitted.store(emitted, Ordering::Relaxed);
            if events.send(ArrivalEvent::Arrived(item)).await.is_err() {
                return;
            }

            if emitted == self.config.total {
                info!(emitted, "arrival generator complete");
                let _ = events.send(ArrivalEvent::Complete).await;
                return;
            }
        }
    }

    /// Effective rate for a phase given how long it has been running.
    ///
    /// Ramp-up scales linearly from 0.5x to 1.0x of the phase target over the
    /// phase's expected duration; ramp-down from 1.0x down to 0.3x; sustain
    /// holds the target.
    fn current_rate(&self, phase: Phase, phase_elapsed: Duration) -> f64 {
        let target = self.config.rate_for(phase);
        let counts = self.config.phase_counts();
        let expected_secs = counts[phase.index() as usize] as f64 / target;
        let fraction = if expected_secs > 0.0 {
            (phase_elapsed.as_secs_f64() / expected_secs).min(1.0)
        } else {
            1.0
        };
        match phase {
            Phase::RampUp => target * (RAMP_UP_START_FACTOR + (1.0 - RAMP_UP_START_FACTOR) * fraction),
            Phase::Sustain => target,
            Phase::RampDown => target * (1.0 - (1.0 - RAMP_DOWN_END_FACTOR) * fraction),
        }
    }
}

/// Samples the next inter-arrival delay from an exponential distribution
/// with the given rate: `-ln(U) / rate` for uniform `U` in `(0, 1]`.
fn exponential_delay(rate: f64) -> Duration {
    let u: f64 = 1.0 - rand::rng().random::<f64>();
    Duration::from_secs_f64(-u.ln() / rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArrivalConfig;

    fn fast_config(total: u64) -> ArrivalConfig {
        ArrivalConfig::default().with_total(total).with_uniform_rate(2000.0)
    }

    async fn collect(config: ArrivalConfig) -> Vec<ArrivalEvent> {
        let cancel = CancellationToken::new();
        let generator = ArrivalGenerator::new(config, cancel).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(generator.run(tx));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        handle.await.unwrap();
        events
    }

    #[tokio::test]
    async fn zero_total_completes_immediately() {
        let events = collect(fast_config(0)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ArrivalEvent::Complete));
    }

    #[test]
    fn non_positive_rate_rejected_at_construction() {
        let config = ArrivalConfig::default().with_uniform_rate(0.0);
        assert!(ArrivalGenerator::new(config, CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn emits_total_items_with_two_phase_changes() {
        let events = collect(fast_config(10)).await;
        let arrived: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ArrivalEvent::Arrived(item) => Some(item.clone()),
                _ => None,
            })
            .collect();
        let changes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ArrivalEvent::PhaseChange(p) => Some(*p),
                _ => None,
            })
            .collect();

        assert_eq!(arrived.len(), 10);
        assert_eq!(changes, vec![Phase::Sustain, Phase::RampDown]);
        assert!(matches!(events.last(), Some(ArrivalEvent::Complete)));

        // ids follow emission order, phases follow the 3/6/1 split
        for (i, item) in arrived.iter().enumerate() {
            assert_eq!(item.id, i as u64);
        }
        assert!(arrived[..3].iter().all(|i| i.phase == Phase::RampUp));
        assert!(arrived[3..9].iter().all(|i| i.phase == Phase::Sustain));
        assert_eq!(arrived[9].phase, Phase::RampDown);
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let cancel = CancellationToken::new();
        let config = ArrivalConfig::default().with_total(100_000).with_uniform_rate(50.0);
        let generator = ArrivalGenerator::new(config, cancel.clone()).unwrap();
        let progress = generator.progress();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(generator.run(tx));

        // let a few items through, then stop
        let mut seen = 0;
        while seen < 2 {
            if let Some(ArrivalEvent::Arrived(_)) = rx.recv().await {
                seen += 1;
            }
        }
        cancel.cancel();
        handle.await.unwrap();

        while rx.recv().await.is_some() {}
        assert!(progress.emitted() < progress.total());
    }

    #[tokio::test]
    async fn progress_tracks_emission() {
        let cancel = CancellationToken::new();
        let generator = ArrivalGenerator::new(fast_config(20), cancel).unwrap();
        let progress = generator.progress();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = tokio::spawn(generator.run(tx));
        while rx.recv().await.is_some() {}
        handle.await.unwrap();
        assert_eq!(progress.emitted(), 20);
        assert_eq!(progress.total(), 20);
    }

    #[test]
    fn ramp_factors_scale_the_target() {
        let config = ArrivalConfig::default().with_total(100).with_uniform_rate(10.0);
        let generator = ArrivalGenerator::new(config, CancellationToken::new()).unwrap();

        // ramp-up: 30 items at 10/s -> 3s expected duration
        let at_start = generator.current_rate(Phase::RampUp, Duration::ZERO);
        let at_end = generator.current_rate(Phase::RampUp, Duration::from_secs(3));
        assert!((at_start - 5.0).abs() < 1e-9);
        assert!((at_end - 10.0).abs() < 1e-9);

        let sustain = generator.current_rate(Phase::Sustain, Duration::from_secs(1));
        assert!((sustain - 10.0).abs() < 1e-9);

        // ramp-down: 10 items at 10/s -> 1s expected duration
        let down_start = generator.current_rate(Phase::RampDown, Duration::ZERO);
        let down_end = generator.current_rate(Phase::RampDown, Duration::from_secs(1));
        assert!((down_start - 10.0).abs() < 1e-9);
        assert!((down_end - 3.0).abs() < 1e-9);
    }
}
