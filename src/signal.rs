//! Points in, verdicts out.
//!
//! This module defines the data that crosses the engine boundary: the raw
//! [`DataPoint`], the per-detector [`Vote`], and the [`DetectionResult`] handed
//! to transport and persistence. The `*Payload` types mirror the JSON
//! contracts spoken by the transport collaborator.

use crate::aggregator::Tally;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Number of detectors in the full committee.
pub const NUM_DETECTORS: usize = 5;

/// A single timestamped reading. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: f64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Detector identifiers, in committee order.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    ZScore = 0,
    Iqr = 1,
    Ewma = 2,
    MovingAverage = 3,
    IsolationForest = 4,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; NUM_DETECTORS] = [
        Self::ZScore,
        Self::Iqr,
        Self::Ewma,
        Self::MovingAverage,
        Self::IsolationForest,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ZScore),
            1 => Some(Self::Iqr),
            2 => Some(Self::Ewma),
            3 => Some(Self::MovingAverage),
            4 => Some(Self::IsolationForest),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ZScore => "z_score",
            Self::Iqr => "iqr",
            Self::Ewma => "ewma",
            Self::MovingAverage => "moving_average",
            Self::IsolationForest => "isolation_forest",
        }
    }
}

/// Why a detector declined to vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstainReason {
    /// Fewer samples than the detector's `min_samples`.
    InsufficientSamples,
    /// The window has no spread and the new point sits on its centre.
    ZeroSpread,
    /// A statistic came out NaN or infinite.
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Anomalous,
    Normal,
    Abstain(AbstainReason),
}

/// One detector's judgment on one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub detector: DetectorKind,
    pub outcome: VoteOutcome,
}

impl Vote {
    pub fn anomalous(detector: DetectorKind) -> Self {
        Self {
            detector,
            outcome: VoteOutcome::Anomalous,
        }
    }

    pub fn normal(detector: DetectorKind) -> Self {
        Self {
            detector,
            outcome: VoteOutcome::Normal,
        }
    }

    pub fn abstain(detector: DetectorKind, reason: AbstainReason) -> Self {
        Self {
            detector,
            outcome: VoteOutcome::Abstain(reason),
        }
    }

    /// Vote `Anomalous` when `flag` is set, `Normal` otherwise.
    pub fn flag(detector: DetectorKind, flag: bool) -> Self {
        if flag {
            Self::anomalous(detector)
        } else {
            Self::normal(detector)
        }
    }

    pub fn is_abstain(&self) -> bool {
        matches!(self.outcome, VoteOutcome::Abstain(_))
    }
}

/// The committee's verdict for one point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// 1-based position of the point within its session.
    pub sequence: u64,
    pub timestamp: f64,
    pub anomaly: bool,
    pub tally: Tally,
    pub votes: Vec<Vote>,
}

impl DetectionResult {
    pub fn vote_of(&self, detector: DetectorKind) -> Option<&Vote> {
        self.votes.iter().find(|v| v.detector == detector)
    }

    /// Human-readable summary of the votes that fired.
    pub fn reason(&self) -> String {
        let fired: Vec<&str> = self
            .votes
            .iter()
            .filter(|v| v.outcome == VoteOutcome::Anomalous)
            .map(|v| v.detector.name())
            .collect();
        if fired.is_empty() {
            "no detector fired".to_string()
        } else {
            format!(
                "{} of {} voting detectors fired: {}",
                self.tally.anomalous,
                self.tally.voting(),
                fired.join(", ")
            )
        }
    }
}

// ============================================================================
// WIRE CONTRACTS
// ============================================================================

/// Session initiation request: `{client_id, window}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionInit {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub window: Option<i64>,
}

impl SessionInit {
    pub fn new(client_id: impl Into<String>, window: i64) -> Self {
        Self {
            client_id: Some(client_id.into()),
            window: Some(window),
        }
    }

    /// Returns the validated `(client_id, window)` pair.
    pub fn validate(&self) -> Result<(String, usize), EngineError> {
        let client_id = match self.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(EngineError::Validation("client_id is required".into())),
        };
        let window = match self.window {
            Some(w) if w > 0 => w as usize,
            Some(w) => {
                return Err(EngineError::Validation(format!(
                    "window must be positive, got {}",
                    w
                )));
            }
            None => return Err(EngineError::Validation("window is required".into())),
        };
        Ok((client_id, window))
    }
}

/// Point ingestion request: `{timestamp, value}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PointPayload {
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub value: Option<f64>,
}

impl TryFrom<PointPayload> for DataPoint {
    type Error = EngineError;

    fn try_from(payload: PointPayload) -> Result<Self, Self::Error> {
        match (payload.timestamp, payload.value) {
            (Some(t), Some(v)) if t.is_finite() && v.is_finite() => Ok(DataPoint::new(t, v)),
            (Some(_), Some(_)) => Err(EngineError::Validation(
                "timestamp and value must be finite numbers".into(),
            )),
            _ => Err(EngineError::Validation("Invalid data point".into())),
        }
    }
}

/// Per-point response: `{timestamp, anomaly}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointVerdict {
    pub timestamp: f64,
    pub anomaly: bool,
}

impl From<&DetectionResult> for PointVerdict {
    fn from(result: &DetectionResult) -> Self {
        Self {
            timestamp: result.timestamp,
            anomaly: result.anomaly,
        }
    }
}
