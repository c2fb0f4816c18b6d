use serde::{Deserialize, Serialize};

/// Exponentially weighted mean and variance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EWMA {
    alpha: f64,
    mean: f64,
    variance: f64,
    observed: u64,
}

impl EWMA {
    /// Smoothing factor derived from a half-life measured in samples.
    pub fn new(half_life: f64) -> Self {
        Self::with_alpha(1.0 - (-std::f64::consts::LN_2 / half_life).exp())
    }

    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            alpha,
            mean: 0.0,
            variance: 0.0,
            observed: 0,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if self.observed == 0 {
            self.mean = sample;
            self.variance = 0.0;
        } else {
            let diff = sample - self.mean;
            let incr = self.alpha * diff;
            self.mean += incr;
            // Standard EWMVar update
            self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * diff * diff);
        }
        self.observed += 1;
        self.mean
    }

    pub fn value(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }
}
