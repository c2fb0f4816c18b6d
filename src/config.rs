//! Engine and ensemble configuration.
//!
//! Every struct has a `Default` matching the documented detector defaults and
//! deserializes from partial JSON (missing fields fall back to defaults).
//! Invalid parameters are rejected by `validate()` at session creation time,
//! never mid-stream.

use crate::aggregator::QuorumRule;
use crate::error::EngineError;
use crate::signal::DetectorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Z-Score: sample standard deviation over the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZScoreConfig {
    pub min_samples: usize,
    pub threshold: f64,
}

impl Default for ZScoreConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IqrConfig {
    pub min_samples: usize,
    /// Fence distance in IQRs beyond Q1/Q3
    pub multiplier: f64,
}

impl Default for IqrConfig {
    fn default() -> Self {
        Self {
            min_samples: 4,
            multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EwmaConfig {
    pub min_samples: usize,
    /// Smoothing factor in (0, 1]
    pub alpha: f64,
    /// Allowed deviation in running standard deviations
    pub k: f64,
}

impl Default for EwmaConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            alpha: 0.3,
            k: 3.0,
        }
    }
}

/// Moving-Average: population standard deviation over a trailing span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovingAverageConfig {
    pub min_samples: usize,
    pub threshold: f64,
    /// Trailing points to average over; `None` uses the whole window
    pub span: Option<usize>,
}

impl Default for MovingAverageConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            threshold: 3.0,
            span: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    /// Window points plus the new point required before fitting
    pub min_samples: usize,
    /// Expected anomaly fraction in (0, 0.5]
    pub contamination: f64,
    pub num_trees: usize,
    pub sample_size: usize,
    /// Fixed RNG seed. `None` derives one from the client id.
    pub seed: Option<u64>,
    /// Refit every K points and score against the cached forest in between
    pub refit_interval: usize,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            contamination: 0.1,
            num_trees: 100,
            sample_size: 256,
            seed: None,
            refit_interval: 1,
        }
    }
}

/// Which detectors sit on the committee and how their votes are combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub detectors: BTreeSet<DetectorKind>,
    pub zscore: ZScoreConfig,
    pub iqr: IqrConfig,
    pub ewma: EwmaConfig,
    pub moving_average: MovingAverageConfig,
    pub isolation_forest: IsolationForestConfig,
    pub quorum: QuorumRule,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            detectors: DetectorKind::ALL.into_iter().collect(),
            zscore: ZScoreConfig::default(),
            iqr: IqrConfig::default(),
            ewma: EwmaConfig::default(),
            moving_average: MovingAverageConfig::default(),
            isolation_forest: IsolationForestConfig::default(),
            quorum: QuorumRule::default(),
        }
    }
}

impl EnsembleConfig {
    /// Committee restricted to `detectors`, other settings default.
    pub fn with_detectors(detectors: impl IntoIterator<Item = DetectorKind>) -> Self {
        Self {
            detectors: detectors.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Largest `min_samples` among configured detectors, i.e. the window
    /// fill at which every detector can participate.
    pub fn warmup_samples(&self) -> usize {
        self.detectors
            .iter()
            .map(|kind| self.min_samples(*kind))
            .max()
            .unwrap_or(0)
    }

    pub fn min_samples(&self, kind: DetectorKind) -> usize {
        match kind {
            DetectorKind::ZScore => self.zscore.min_samples,
            DetectorKind::Iqr => self.iqr.min_samples,
            DetectorKind::Ewma => self.ewma.min_samples,
            DetectorKind::MovingAverage => self.moving_average.min_samples,
            // The forest counts the new point as a sample
            DetectorKind::IsolationForest => {
                self.isolation_forest.min_samples.saturating_sub(1)
            }
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.detectors.is_empty() {
            return Err(config_err("at least one detector must be configured"));
        }
        for kind in &self.detectors {
            if self.min_samples(*kind) == 0 && *kind != DetectorKind::IsolationForest {
                return Err(config_err(format!(
                    "{}: min_samples must be positive",
                    kind.name()
                )));
            }
        }
        positive("z_score.threshold", self.zscore.threshold)?;
        positive("iqr.multiplier", self.iqr.multiplier)?;
        positive("ewma.k", self.ewma.k)?;
        positive("moving_average.threshold", self.moving_average.threshold)?;

        if !(self.ewma.alpha > 0.0 && self.ewma.alpha <= 1.0) {
            return Err(config_err(format!(
                "ewma.alpha must be in (0, 1], got {}",
                self.ewma.alpha
            )));
        }
        if self.moving_average.span == Some(0) {
            return Err(config_err("moving_average.span must be positive"));
        }

        let forest = &self.isolation_forest;
        if forest.min_samples < 2 {
            return Err(config_err("isolation_forest.min_samples must be at least 2"));
        }
        if !(forest.contamination > 0.0 && forest.contamination <= 0.5) {
            return Err(config_err(format!(
                "isolation_forest.contamination must be in (0, 0.5], got {}",
                forest.contamination
            )));
        }
        if forest.num_trees == 0 {
            return Err(config_err("isolation_forest.num_trees must be positive"));
        }
        if forest.sample_size < 2 {
            return Err(config_err("isolation_forest.sample_size must be at least 2"));
        }
        if forest.refit_interval == 0 {
            return Err(config_err("isolation_forest.refit_interval must be positive"));
        }

        self.quorum.validate()
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-session queue bound before the oldest unprocessed point is dropped
    pub queue_capacity: usize,
    /// Detector worker threads
    pub worker_threads: usize,
    /// Registry lock shards
    pub registry_shards: usize,
    /// Upper bound on how long ingest may wait on the persistence queue
    pub persistence_timeout_ms: u64,
    pub persistence_capacity: usize,
    pub ensemble: EnsembleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            registry_shards: 16,
            persistence_timeout_ms: 50,
            persistence_capacity: 65_536,
            ensemble: EnsembleConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.queue_capacity == 0 {
            return Err(config_err("queue_capacity must be positive"));
        }
        if self.worker_threads == 0 {
            return Err(config_err("worker_threads must be positive"));
        }
        if self.registry_shards == 0 {
            return Err(config_err("registry_shards must be positive"));
        }
        self.ensemble.validate()
    }

    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            config_err(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| config_err(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

fn positive(name: &str, value: f64) -> Result<(), EngineError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(config_err(format!("{} must be a positive number, got {}", name, value)))
    }
}

fn config_err(msg: impl Into<String>) -> EngineError {
    EngineError::Configuration(msg.into())
}
