//! Isolation forest anomaly detector.
//!
//! Each tree isolates a random subsample by recursive random axis-aligned
//! splits. Anomalies are isolated in fewer splits, so the anomaly score
//! `s(x) = 2^(-E[h(x)] / c(ψ))` is close to 1 for outliers and below 0.5 for
//! inliers. The decision function is `0.5 - s(x)`: negative means anomalous.
//!
//! [`IsolationForestClassifier`] turns the decision `d` into the two-way
//! distribution `softmax([d, -d])` over (normal, anomalous) and places it on
//! the configured normal and anomaly class ids.

use candle_core::Tensor;
use mvids_core::config::{FallbackConfig, IsolationConfig};
use mvids_core::{FeatureMatrix, MvidsError, Result};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{ClassifierKind, ProbabilisticClassifier};
use crate::tensor::{check_input_width, matrix_to_tensor, tensor_to_matrix};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful search in a binary search tree of
/// `n` points.
fn average_path_length(n: usize) -> f64 {
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
enum INode {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<INode>,
}

impl IsolationTree {
    fn build(x: &FeatureMatrix, rows: Vec<usize>, height_limit: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(x, &rows, 0, height_limit, rng);
        tree
    }

    fn grow(
        &mut self,
        x: &FeatureMatrix,
        rows: &[usize],
        depth: usize,
        height_limit: usize,
        rng: &mut ChaCha8Rng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(INode::Leaf { size: rows.len() });
        if depth >= height_limit || rows.len() <= 1 {
            return id;
        }

        // Only features that vary within this node can split it.
        let candidates: Vec<(usize, f32, f32)> = (0..x.cols())
            .filter_map(|c| {
                let (lo, hi) = rows.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &r| {
                    let v = x.get(r, c);
                    (lo.min(v), hi.max(v))
                });
                (hi > lo).then_some((c, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            return id;
        }
        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&r| x.get(r, feature) < threshold);
        let left = self.grow(x, &left_rows, depth + 1, height_limit, rng);
        let right = self.grow(x, &right_rows, depth + 1, height_limit, rng);
        self.nodes[id] = INode::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, row: &[f32]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[idx] {
                INode::Leaf { size } => return depth + average_path_length(*size),
                INode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

/// An unsupervised isolation forest.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    input_dim: usize,
}

impl IsolationForest {
    /// Fit on `x` (labels are not used).
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if `x` has fewer than two rows.
    pub fn fit(x: &FeatureMatrix, config: &IsolationConfig, seed: u64) -> Result<Self> {
        if x.rows() < 2 {
            return Err(MvidsError::Data(format!(
                "isolation forest needs at least 2 samples, got {}",
                x.rows()
            )));
        }
        let sample_size = config.sample_size.min(x.rows());
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let trees = (0..config.n_trees)
            .map(|_| {
                let rows = sample(&mut rng, x.rows(), sample_size).into_vec();
                IsolationTree::build(x, rows, height_limit, &mut rng)
            })
            .collect();

        tracing::info!(
            trees = config.n_trees,
            sample_size,
            "Isolation forest trained"
        );
        Ok(Self {
            trees,
            sample_size,
            input_dim: x.cols(),
        })
    }

    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Anomaly score `s(x)` in `(0, 1]` per row.
    pub fn score(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        x.expect_cols("isolation forest", self.input_dim)?;
        let norm = average_path_length(self.sample_size).max(f64::EPSILON);
        Ok(x.iter_rows()
            .map(|row| {
                let mean = self.trees.iter().map(|t| t.path_length(row)).sum::<f64>()
                    / self.trees.len() as f64;
                2f64.powf(-mean / norm)
            })
            .collect())
    }

    /// Decision function `0.5 - s(x)` per row; negative means anomalous.
    pub fn decision_function(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        Ok(self.score(x)?.into_iter().map(|s| 0.5 - s).collect())
    }
}

// ---------------------------------------------------------------------------
// Classifier adapter
// ---------------------------------------------------------------------------

/// The forest as a bank member over `num_classes` classes.
///
/// All probability mass lands on `normal_label` and `anomaly_label`; the
/// remaining classes get zero.
///
/// The decision value lies in `[-0.5, 0.5]`, so the row maximum never
/// exceeds `sigmoid(1) ≈ 0.731`. Under a confidence gate at or above that
/// value the member never contributes to the fused vector and only serves
/// the low-confidence fallback through [`Self::predict_anomalous`].
#[derive(Debug, Clone)]
pub struct IsolationForestClassifier {
    forest: IsolationForest,
    num_classes: usize,
    normal_label: usize,
    anomaly_label: usize,
}

impl IsolationForestClassifier {
    /// Wrap a fitted forest.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if either fallback label is not a valid
    /// class id or both are equal.
    pub fn new(forest: IsolationForest, num_classes: usize, fallback: &FallbackConfig) -> Result<Self> {
        if fallback.normal_label >= num_classes || fallback.anomaly_label >= num_classes {
            return Err(MvidsError::Config(format!(
                "fallback labels ({}, {}) out of range for {num_classes} classes",
                fallback.normal_label, fallback.anomaly_label
            )));
        }
        if fallback.normal_label == fallback.anomaly_label {
            return Err(MvidsError::Config(
                "fallback normal and anomaly labels must differ".to_string(),
            ));
        }
        Ok(Self {
            forest,
            num_classes,
            normal_label: fallback.normal_label,
            anomaly_label: fallback.anomaly_label,
        })
    }

    #[must_use]
    pub fn forest(&self) -> &IsolationForest {
        &self.forest
    }

    /// Class-probability rows for `x`.
    pub fn predict_matrix(&self, x: &FeatureMatrix) -> Result<FeatureMatrix> {
        let decisions = self.forest.decision_function(x)?;
        let mut data = vec![0.0f32; x.rows() * self.num_classes];
        for (row, d) in data.chunks_mut(self.num_classes).zip(decisions) {
            // softmax([d, -d])[0] = 1 / (1 + e^(-2d))
            let normal = 1.0 / (1.0 + (-2.0 * d).exp());
            row[self.normal_label] = normal as f32;
            row[self.anomaly_label] = (1.0 - normal) as f32;
        }
        FeatureMatrix::new(x.rows(), self.num_classes, data)
    }

    /// Binary decision per row of `x`: `true` when the forest calls it
    /// anomalous.
    pub fn predict_anomalous(&self, x: &Tensor) -> Result<Vec<bool>> {
        check_input_width("isolation forest", x, self.forest.input_dim())?;
        let decisions = self.forest.decision_function(&tensor_to_matrix(x)?)?;
        Ok(decisions.into_iter().map(|d| d < 0.0).collect())
    }
}

impl ProbabilisticClassifier for IsolationForestClassifier {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Anomaly
    }

    fn input_dim(&self) -> usize {
        self.forest.input_dim()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict_proba(&self, x: &Tensor) -> Result<Tensor> {
        check_input_width("isolation forest", x, self.forest.input_dim())?;
        let probs = self.predict_matrix(&tensor_to_matrix(x)?)?;
        matrix_to_tensor(&probs, x.device())
    }
}
