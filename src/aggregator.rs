//! Quorum voting over detector votes.
//!
//! Abstentions never count toward the denominator. When every detector
//! abstains (cold start) there is no evidence and the verdict is NORMAL, under
//! every rule. Under the default strict majority a tie is also NORMAL.

use crate::error::EngineError;
use crate::signal::{Vote, VoteOutcome};
use serde::{Deserialize, Serialize};

/// Policy turning a tally into one boolean verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum QuorumRule {
    /// Anomalous iff anomalous votes outnumber normal votes.
    #[default]
    StrictMajority,
    /// Anomalous iff the anomalous share of non-abstaining votes reaches
    /// `threshold`.
    Fraction { threshold: f64 },
    /// Anomalous iff at least `votes` detectors flag the point.
    AtLeast { votes: usize },
    /// Anomalous iff every non-abstaining detector flags the point.
    Unanimous,
}

impl QuorumRule {
    pub fn validate(&self) -> Result<(), EngineError> {
        match *self {
            Self::Fraction { threshold } if !(threshold > 0.0 && threshold <= 1.0) => {
                Err(EngineError::Configuration(format!(
                    "quorum fraction must be in (0, 1], got {}",
                    threshold
                )))
            }
            Self::AtLeast { votes: 0 } => Err(EngineError::Configuration(
                "quorum at_least must require one or more votes".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn decide(&self, tally: &Tally) -> bool {
        let (a, n) = (tally.anomalous, tally.normal);
        if a + n == 0 {
            return false;
        }
        match *self {
            Self::StrictMajority => a > n,
            Self::Fraction { threshold } => a as f64 / (a + n) as f64 >= threshold,
            Self::AtLeast { votes } => a >= votes,
            Self::Unanimous => a > 0 && n == 0,
        }
    }
}

/// Vote counts for one point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub anomalous: usize,
    pub normal: usize,
    pub abstained: usize,
}

impl Tally {
    pub fn count(votes: &[Vote]) -> Self {
        votes.iter().fold(Self::default(), |mut t, v| {
            match v.outcome {
                VoteOutcome::Anomalous => t.anomalous += 1,
                VoteOutcome::Normal => t.normal += 1,
                VoteOutcome::Abstain(_) => t.abstained += 1,
            }
            t
        })
    }

    /// Non-abstaining votes.
    pub fn voting(&self) -> usize {
        self.anomalous + self.normal
    }
}

/// Counts `votes` and applies `rule`.
pub fn aggregate(votes: &[Vote], rule: &QuorumRule) -> (bool, Tally) {
    let tally = Tally::count(votes);
    (rule.decide(&tally), tally)
}
