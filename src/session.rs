//! Per-client session: one window, one detector committee, one status flag.
//!
//! The status is an atomic activation counter, so deactivation never waits
//! behind an in-flight evaluation. Odd values mean active; every
//! deactivation and reactivation bumps it, so each activation period has its
//! own lease value. Window and detectors live behind the session's own mutex;
//! nothing outside [`Session::process`] mutates them.

use crate::aggregator::aggregate;
use crate::config::EnsembleConfig;
use crate::detector::DetectorSet;
use crate::error::Result;
use crate::signal::{DataPoint, DetectionResult};
use crate::window::Window;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lifecycle phase derived from status and window fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Registered, no points yet
    Init,
    /// Some detectors still abstain for lack of samples
    Warming,
    /// Every configured detector can participate
    Active,
    /// Disconnected; new points are refused
    Inactive,
}

/// Serializable view of a session for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub phase: Phase,
    pub window_len: usize,
    pub window_capacity: usize,
    pub processed: u64,
    pub anomalies: u64,
    pub detectors: Vec<DetectorSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSummary {
    pub name: String,
    pub anomalous_votes: u64,
    pub stats: String,
}

struct SessionState {
    window: Window,
    detectors: DetectorSet,
    processed: u64,
    anomalies: u64,
}

pub struct Session {
    client_id: String,
    config: EnsembleConfig,
    warmup: usize,
    /// Activation counter, odd while active
    status: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    /// Builds an active session. Fails with `Configuration` on a zero window
    /// or invalid ensemble parameters.
    pub fn new(
        client_id: impl Into<String>,
        window_size: usize,
        config: EnsembleConfig,
    ) -> Result<Self> {
        config.validate()?;
        let client_id = client_id.into();
        let window = Window::new(window_size)?;

        let seed = config
            .isolation_forest
            .seed
            .unwrap_or_else(|| xxhash_rust::xxh3::xxh3_64(client_id.as_bytes()));
        let detectors = DetectorSet::new(&config, seed);

        Ok(Self {
            warmup: config.warmup_samples(),
            client_id,
            config,
            status: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                window,
                detectors,
                processed: 0,
                anomalies: 0,
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.status.load(Ordering::Acquire) % 2 == 1
    }

    /// Token for the current activation period, `None` while inactive.
    pub(crate) fn lease(&self) -> Option<u64> {
        let status = self.status.load(Ordering::Acquire);
        (status % 2 == 1).then_some(status)
    }

    /// Whether the activation period `lease` was taken in is still running.
    pub(crate) fn holds(&self, lease: u64) -> bool {
        self.status.load(Ordering::Acquire) == lease
    }

    /// Flips INACTIVE -> ACTIVE. Returns false if the session was already active.
    pub(crate) fn reactivate(&self) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s % 2 == 0).then_some(s + 1)
            })
            .is_ok()
    }

    /// Marks the session inactive. Returns whether it was active before.
    pub(crate) fn deactivate(&self) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s % 2 == 1).then_some(s + 1)
            })
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Judges `point` against the current window, then appends it.
    ///
    /// Detectors see the window as it stood before `point` arrived. The
    /// caller is responsible for refusing points on inactive sessions; an
    /// evaluation already under way when the session is deactivated still
    /// completes.
    pub fn process(&self, point: DataPoint) -> DetectionResult {
        let mut guard = self.lock();
        let state = &mut *guard;

        let votes = state.detectors.evaluate(state.window.snapshot(), &point);
        let (anomaly, tally) = aggregate(&votes, &self.config.quorum);

        state.window.push(point);
        state.processed += 1;
        if anomaly {
            state.anomalies += 1;
        }

        DetectionResult {
            sequence: state.processed,
            timestamp: point.timestamp,
            anomaly,
            tally,
            votes,
        }
    }

    pub fn phase(&self) -> Phase {
        if !self.is_active() {
            return Phase::Inactive;
        }
        let state = self.lock();
        self.phase_of(&state.window)
    }

    fn phase_of(&self, window: &Window) -> Phase {
        if window.is_empty() {
            Phase::Init
        } else if window.is_full() || window.len() >= self.warmup {
            Phase::Active
        } else {
            Phase::Warming
        }
    }

    /// Current window values in arrival order.
    pub fn window_values(&self) -> Vec<f64> {
        self.lock().window.snapshot().to_values()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        let phase = if self.is_active() {
            self.phase_of(&state.window)
        } else {
            Phase::Inactive
        };

        SessionSnapshot {
            client_id: self.client_id.clone(),
            phase,
            window_len: state.window.len(),
            window_capacity: state.window.capacity(),
            processed: state.processed,
            anomalies: state.anomalies,
            detectors: state
                .detectors
                .get_detector_stats()
                .into_iter()
                .map(|(name, anomalous_votes, stats)| DetectorSummary {
                    name,
                    anomalous_votes,
                    stats,
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
