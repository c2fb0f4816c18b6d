//! Isolation Forest for univariate windows
//!
//! Anomalies are few and different, so random axis-aligned cuts isolate them
//! in fewer steps than ordinary points. The anomaly score of a value is
//! `2^(-E[h(x)] / c(psi))`, where `h` is the path length through one tree and
//! `c` is the average path length of an unsuccessful BST search over `psi`
//! samples. Scores near 1 are anomalous, scores well below 0.5 are normal.
//!
//! All randomness comes from the caller's RNG, so a seeded RNG replays the
//! same forest for the same data.
//!
//! Reference: "Isolation Forest" (Liu, Ting, Zhou, ICDM 2008)

use rand::Rng;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful search in a BST of `n` nodes.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum IsolationNode {
    Internal {
        split: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

/// A single isolation tree over scalar values.
#[derive(Debug, Clone)]
pub struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    fn build<R: Rng>(samples: &[f64], max_depth: usize, rng: &mut R) -> Self {
        Self {
            root: build_node(samples, 0, max_depth, rng),
        }
    }

    fn path_length(&self, value: f64) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                IsolationNode::Leaf { size } => return depth + average_path_length(*size),
                IsolationNode::Internal { split, left, right } => {
                    node = if value < *split { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

fn build_node<R: Rng>(
    samples: &[f64],
    depth: usize,
    max_depth: usize,
    rng: &mut R,
) -> IsolationNode {
    if depth >= max_depth || samples.len() <= 1 {
        return IsolationNode::Leaf {
            size: samples.len(),
        };
    }

    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    // Identical values cannot be separated further
    if !(max > min) {
        return IsolationNode::Leaf {
            size: samples.len(),
        };
    }

    let split = if (max - min).is_finite() {
        rng.random_range(min..max)
    } else {
        // The range overflows f64; interpolate between the ends instead
        let t: f64 = rng.random();
        (min * (1.0 - t) + max * t).clamp(min, max)
    };
    let (left, right): (Vec<f64>, Vec<f64>) = samples.iter().partition(|&&v| v < split);

    IsolationNode::Internal {
        split,
        left: Box::new(build_node(&left, depth + 1, max_depth, &mut *rng)),
        right: Box::new(build_node(&right, depth + 1, max_depth, &mut *rng)),
    }
}

/// A fitted forest of isolation trees.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Subsample size each tree was grown on (psi)
    sample_size: usize,
    /// c(psi), the score normaliser
    normaliser: f64,
}

impl IsolationForest {
    /// Grow `num_trees` trees, each on a subsample of `sample_size` values
    /// drawn without replacement.
    ///
    /// Returns `None` when there are fewer than two values to learn from.
    pub fn fit<R: Rng>(
        data: &[f64],
        num_trees: usize,
        sample_size: usize,
        rng: &mut R,
    ) -> Option<Self> {
        if data.len() < 2 || num_trees == 0 {
            return None;
        }

        let psi = sample_size.clamp(2, data.len());
        let max_depth = (psi as f64).log2().ceil() as usize;

        let trees = (0..num_trees)
            .map(|_| {
                let subsample: Vec<f64> = rand::seq::index::sample(&mut *rng, data.len(), psi)
                    .into_iter()
                    .map(|i| data[i])
                    .collect();
                IsolationTree::build(&subsample, max_depth, &mut *rng)
            })
            .collect();

        Some(Self {
            trees,
            sample_size: psi,
            normaliser: average_path_length(psi),
        })
    }

    /// Anomaly score in `(0, 1]`.
    pub fn score(&self, value: f64) -> f64 {
        if self.trees.is_empty() || self.normaliser == 0.0 {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|t| t.path_length(value)).sum();
        let avg_path = total / self.trees.len() as f64;
        2.0_f64.powf(-avg_path / self.normaliser)
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }
}
