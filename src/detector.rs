//! The detector committee.
//!
//! Each detector sees the window as it stood *before* the new point arrived,
//! plus the new point, and returns a single [`Vote`]. Numerical edge cases
//! (too few samples, no spread, non-finite statistics) become abstentions.
//!
//! Zero spread is handled the same way everywhere: a new point sitting on the
//! window's centre abstains, a point anywhere else has an unbounded deviation
//! and is flagged.

use crate::algo::{EWMA, IsolationForest, stats};
use crate::config::{
    EnsembleConfig, EwmaConfig, IqrConfig, IsolationForestConfig, MovingAverageConfig,
    ZScoreConfig,
};
use crate::signal::{AbstainReason, DataPoint, DetectorKind, NUM_DETECTORS, Vote, VoteOutcome};
use crate::window::Snapshot;
use rand::SeedableRng;
use rand::rngs::StdRng;

// ============================================================================
// CORE ABSTRACTION
// ============================================================================

/// Trait for all committee members.
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    fn name(&self) -> &str {
        self.kind().name()
    }

    /// Judge `point` against `window`. Must not assume `point` is in `window`.
    fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vote;

    fn get_stats(&self) -> String {
        String::new()
    }
}

/// Vote on `|value - centre| / spread > limit`.
fn deviation_vote(kind: DetectorKind, value: f64, centre: f64, spread: f64, limit: f64) -> Vote {
    if !centre.is_finite() || !spread.is_finite() {
        return Vote::abstain(kind, AbstainReason::NonFinite);
    }
    if spread == 0.0 {
        return if stats::is_on_centre(value, centre) {
            Vote::abstain(kind, AbstainReason::ZeroSpread)
        } else {
            Vote::anomalous(kind)
        };
    }
    Vote::flag(kind, (value - centre).abs() / spread > limit)
}

// ============================================================================
// DETECTORS
// ============================================================================

/// Z-Score over the window using the sample (n-1) standard deviation.
pub struct ZScoreDetector {
    config: ZScoreConfig,
}

impl ZScoreDetector {
    pub fn new(config: ZScoreConfig) -> Self {
        Self { config }
    }
}

impl Detector for ZScoreDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::ZScore
    }

    fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vote {
        let values = window.to_values();
        if values.len() < self.config.min_samples {
            return Vote::abstain(self.kind(), AbstainReason::InsufficientSamples);
        }
        match stats::mean_std(&values, 1) {
            Some((mu, sigma)) => {
                deviation_vote(self.kind(), point.value, mu, sigma, self.config.threshold)
            }
            None => Vote::abstain(self.kind(), AbstainReason::InsufficientSamples),
        }
    }

    fn get_stats(&self) -> String {
        format!(
            "ZScore: min_samples={}, threshold={:.2}",
            self.config.min_samples, self.config.threshold
        )
    }
}

/// Tukey fences around the window's interquartile range.
pub struct IqrDetector {
    config: IqrConfig,
}

impl IqrDetector {
    pub fn new(config: IqrConfig) -> Self {
        Self { config }
    }
}

impl Detector for IqrDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Iqr
    }

    fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vote {
        let mut values = window.to_values();
        if values.len() < self.config.min_samples {
            return Vote::abstain(self.kind(), AbstainReason::InsufficientSamples);
        }
        values.sort_by(f64::total_cmp);

        let (Some(q1), Some(q3)) = (
            stats::percentile_sorted(&values, 0.25),
            stats::percentile_sorted(&values, 0.75),
        ) else {
            return Vote::abstain(self.kind(), AbstainReason::InsufficientSamples);
        };
        let iqr = q3 - q1;
        if !iqr.is_finite() {
            return Vote::abstain(self.kind(), AbstainReason::NonFinite);
        }

        let value = point.value;
        if iqr == 0.0 {
            return if stats::is_on_centre(value, q1) {
                Vote::abstain(self.kind(), AbstainReason::ZeroSpread)
            } else {
                Vote::anomalous(self.kind())
            };
        }

        let lower = q1 - self.config.multiplier * iqr;
        let upper = q3 + self.config.multiplier * iqr;
        Vote::flag(self.kind(), value < lower || value > upper)
    }

    fn get_stats(&self) -> String {
        format!(
            "IQR: min_samples={}, multiplier={:.2}",
            self.config.min_samples, self.config.multiplier
        )
    }
}

/// EWMA mean/variance replayed over the window on every call.
pub struct EwmaDetector {
    config: EwmaConfig,
}

impl EwmaDetector {
    pub fn new(config: EwmaConfig) -> Self {
        Self { config }
    }
}

impl Detector for EwmaDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Ewma
    }

    fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vote {
        if window.len() < self.config.min_samples {
            return Vote::abstain(self.kind(), AbstainReason::InsufficientSamples);
        }

        let mut ewma = EWMA::with_alpha(self.config.alpha);
        for value in window.values() {
            ewma.update(value);
        }

        deviation_vote(
            self.kind(),
            point.value,
            ewma.value(),
            ewma.std_dev(),
            self.config.k,
        )
    }

    fn get_stats(&self) -> String {
        format!("EWMA: alpha={:.2}, k={:.2}", self.config.alpha, self.config.k)
    }
}

/// Trailing arithmetic mean with a population standard deviation.
pub struct MovingAverageDetector {
    config: MovingAverageConfig,
}

impl MovingAverageDetector {
    pub fn new(config: MovingAverageConfig) -> Self {
        Self { config }
    }
}

impl Detector for MovingAverageDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::MovingAverage
    }

    fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vote {
        let span = self.config.span.unwrap_or(window.len());
        let values: Vec<f64> = window.values().rev().take(span).collect();
        if values.len() < self.config.min_samples {
            return Vote::abstain(self.kind(), AbstainReason::InsufficientSamples);
        }
        match stats::mean_std(&values, 0) {
            Some((mu, sigma)) => {
                deviation_vote(self.kind(), point.value, mu, sigma, self.config.threshold)
            }
            None => Vote::abstain(self.kind(), AbstainReason::InsufficientSamples),
        }
    }

    fn get_stats(&self) -> String {
        match self.config.span {
            Some(span) => format!("MovingAverage: span={}", span),
            None => "MovingAverage: span=window".to_string(),
        }
    }
}

struct FittedForest {
    forest: IsolationForest,
    /// (1 - contamination) quantile of the training scores
    threshold: f64,
}

/// Isolation Forest fitted on the window plus the new point.
///
/// The RNG is seeded once per session and advanced by every fit, so replaying
/// the same points with the same seed reproduces the same votes. With
/// `refit_interval > 1` the forest is refit every K points and the points in
/// between are scored against the cached forest and threshold.
pub struct IsolationForestDetector {
    config: IsolationForestConfig,
    rng: StdRng,
    model: Option<FittedForest>,
    since_fit: usize,
    fits: u64,
}

impl IsolationForestDetector {
    pub fn new(config: IsolationForestConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            model: None,
            since_fit: 0,
            fits: 0,
        }
    }

    fn refit(&mut self, data: &[f64]) {
        self.model = IsolationForest::fit(
            data,
            self.config.num_trees,
            self.config.sample_size,
            &mut self.rng,
        )
        .and_then(|forest| {
            let scores: Vec<f64> = data.iter().map(|v| forest.score(*v)).collect();
            let threshold = stats::percentile(&scores, 1.0 - self.config.contamination)?;
            Some(FittedForest { forest, threshold })
        });
        self.since_fit = 0;
        self.fits += 1;
    }
}

impl Detector for IsolationForestDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::IsolationForest
    }

    fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vote {
        if window.len() + 1 < self.config.min_samples {
            return Vote::abstain(self.kind(), AbstainReason::InsufficientSamples);
        }

        if self.model.is_none() || self.since_fit >= self.config.refit_interval {
            let mut data = window.to_values();
            data.push(point.value);
            self.refit(&data);
        }
        self.since_fit += 1;

        match &self.model {
            Some(fitted) => {
                let score = fitted.forest.score(point.value);
                if score.is_finite() {
                    Vote::flag(self.kind(), score > fitted.threshold)
                } else {
                    Vote::abstain(self.kind(), AbstainReason::NonFinite)
                }
            }
            None => Vote::abstain(self.kind(), AbstainReason::InsufficientSamples),
        }
    }

    fn get_stats(&self) -> String {
        let threshold = self.model.as_ref().map(|m| m.threshold).unwrap_or(f64::NAN);
        format!(
            "IsolationForest: fits={}, threshold={:.3}, refit_every={}",
            self.fits, threshold, self.config.refit_interval
        )
    }
}

// ============================================================================
// DETECTOR SET
// ============================================================================

/// Per-session committee built from an [`EnsembleConfig`].
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
    /// Anomalous votes cast per detector
    detector_hits: [u64; NUM_DETECTORS],
}

impl DetectorSet {
    /// `seed` feeds the Isolation Forest; the other detectors are deterministic.
    pub fn new(config: &EnsembleConfig, seed: u64) -> Self {
        let detectors = config
            .detectors
            .iter()
            .map(|kind| -> Box<dyn Detector> {
                match kind {
                    DetectorKind::ZScore => Box::new(ZScoreDetector::new(config.zscore.clone())),
                    DetectorKind::Iqr => Box::new(IqrDetector::new(config.iqr.clone())),
                    DetectorKind::Ewma => Box::new(EwmaDetector::new(config.ewma.clone())),
                    DetectorKind::MovingAverage => Box::new(MovingAverageDetector::new(
                        config.moving_average.clone(),
                    )),
                    DetectorKind::IsolationForest => Box::new(IsolationForestDetector::new(
                        config.isolation_forest.clone(),
                        seed,
                    )),
                }
            })
            .collect();

        Self {
            detectors,
            detector_hits: [0; NUM_DETECTORS],
        }
    }

    /// Runs every detector, in committee order.
    pub fn evaluate(&mut self, window: Snapshot<'_>, point: &DataPoint) -> Vec<Vote> {
        self.detectors
            .iter_mut()
            .map(|detector| {
                let vote = detector.evaluate(window, point);
                if vote.outcome == VoteOutcome::Anomalous {
                    self.detector_hits[vote.detector as usize] += 1;
                }
                vote
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// `(name, anomalous votes, stats)` per detector.
    pub fn get_detector_stats(&self) -> Vec<(String, u64, String)> {
        self.detectors
            .iter()
            .map(|det| {
                (
                    det.name().to_string(),
                    self.detector_hits[det.kind() as usize],
                    det.get_stats(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(values: &[f64]) -> Vec<DataPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| DataPoint::new(i as f64, *v))
            .collect()
    }

    fn eval(detector: &mut dyn Detector, window: &[f64], value: f64) -> VoteOutcome {
        let pts = points(window);
        let point = DataPoint::new(window.len() as f64, value);
        detector
            .evaluate(Snapshot::from_slice(&pts), &point)
            .outcome
    }

    const NOISY: [f64; 10] = [10.0, 11.0, 9.0, 10.5, 9.5, 10.2, 9.8, 10.1, 9.9, 10.0];

    #[test]
    fn test_zscore() {
        let mut det = ZScoreDetector::new(ZScoreConfig::default());
        assert_eq!(
            eval(&mut det, &[5.0], 6.0),
            VoteOutcome::Abstain(AbstainReason::InsufficientSamples)
        );
        assert_eq!(eval(&mut det, &NOISY, 10.3), VoteOutcome::Normal);
        assert_eq!(eval(&mut det, &NOISY, 40.0), VoteOutcome::Anomalous);
    }

    #[test]
    fn test_zero_spread_abstains_on_centre_and_flags_off_centre() {
        let flat = [10.0; 5];
        let mut detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(ZScoreDetector::new(ZScoreConfig::default())),
            Box::new(IqrDetector::new(IqrConfig::default())),
            Box::new(EwmaDetector::new(EwmaConfig::default())),
            Box::new(MovingAverageDetector::new(MovingAverageConfig::default())),
        ];
        for det in detectors.iter_mut() {
            assert_eq!(
                eval(det.as_mut(), &flat, 10.0),
                VoteOutcome::Abstain(AbstainReason::ZeroSpread),
                "{} on centre",
                det.name()
            );
            assert_eq!(
                eval(det.as_mut(), &flat, 100.0),
                VoteOutcome::Anomalous,
                "{} off centre",
                det.name()
            );
        }
    }

    #[test]
    fn test_iqr_fences() {
        let mut det = IqrDetector::new(IqrConfig::default());
        let window = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        // Q1 = 2.75, Q3 = 6.25, IQR = 3.5 -> fences [-2.5, 11.5]
        assert_eq!(eval(&mut det, &window, 11.0), VoteOutcome::Normal);
        assert_eq!(eval(&mut det, &window, 12.0), VoteOutcome::Anomalous);
        assert_eq!(eval(&mut det, &window, -3.0), VoteOutcome::Anomalous);
        assert_eq!(
            eval(&mut det, &window[..3], 100.0),
            VoteOutcome::Abstain(AbstainReason::InsufficientSamples)
        );
    }

    #[test]
    fn test_ewma_tracks_recent_level() {
        let mut det = EwmaDetector::new(EwmaConfig::default());
        assert_eq!(
            eval(&mut det, &[1.0], 1.0),
            VoteOutcome::Abstain(AbstainReason::InsufficientSamples)
        );
        assert_eq!(eval(&mut det, &NOISY, 10.4), VoteOutcome::Normal);
        assert_eq!(eval(&mut det, &NOISY, 25.0), VoteOutcome::Anomalous);
    }

    #[test]
    fn test_moving_average_span_uses_trailing_points() {
        let config = MovingAverageConfig {
            span: Some(4),
            ..MovingAverageConfig::default()
        };
        let mut det = MovingAverageDetector::new(config);
        // Trailing four points are flat at 50; the early values are ignored
        let window = [0.0, 100.0, 50.0, 50.0, 50.0, 50.0];
        assert_eq!(
            eval(&mut det, &window, 50.0),
            VoteOutcome::Abstain(AbstainReason::ZeroSpread)
        );

        let mut whole = MovingAverageDetector::new(MovingAverageConfig::default());
        assert_eq!(eval(&mut whole, &window, 50.0), VoteOutcome::Normal);
    }

    #[test]
    fn test_isolation_forest_warmup_and_spike() {
        let mut det = IsolationForestDetector::new(IsolationForestConfig::default(), 11);
        assert_eq!(
            eval(&mut det, &NOISY[..5], 10.0),
            VoteOutcome::Abstain(AbstainReason::InsufficientSamples)
        );

        let window: Vec<f64> = (0..40).map(|i| 10.0 + (i % 5) as f64 * 0.5).collect();
        assert_eq!(eval(&mut det, &window, 500.0), VoteOutcome::Anomalous);
    }

    #[test]
    fn test_isolation_forest_refit_interval_caches_model() {
        let config = IsolationForestConfig {
            refit_interval: 3,
            ..IsolationForestConfig::default()
        };
        let mut det = IsolationForestDetector::new(config, 5);
        let window: Vec<f64> = (0..20).map(|i| (i % 4) as f64).collect();
        for _ in 0..7 {
            eval(&mut det, &window, 1.5);
        }
        // Fits happen on evaluations 1, 4 and 7
        assert_eq!(det.fits, 3);
    }

    #[test]
    fn test_detector_set_follows_config_order_and_counts_hits() {
        let config = EnsembleConfig::with_detectors([DetectorKind::Iqr, DetectorKind::ZScore]);
        let mut set = DetectorSet::new(&config, 0);
        assert_eq!(set.len(), 2);

        let pts = points(&NOISY);
        let votes = set.evaluate(Snapshot::from_slice(&pts), &DataPoint::new(11.0, 99.0));
        assert_eq!(votes[0].detector, DetectorKind::ZScore);
        assert_eq!(votes[1].detector, DetectorKind::Iqr);

        let stats = set.get_detector_stats();
        assert_eq!(stats[0].0, "z_score");
        assert_eq!(stats[0].1, 1);
    }
}
