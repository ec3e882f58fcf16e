//! Multi-class gradient-boosted decision trees.
//!
//! Softmax boosting with second-order (Newton) leaf values: each round fits
//! one regression tree per class to the gradient `g = p - y` and hessian
//! `h = p(1 - p)` of the cross-entropy loss. Split search runs on per-feature
//! quantile histograms with at most `bins` buckets.

use candle_core::Tensor;
use mvids_core::config::GbdtConfig;
use mvids_core::{FeatureMatrix, MvidsError, Result, EPSILON};

use super::{ClassifierKind, ProbabilisticClassifier};
use crate::tensor::{check_input_width, matrix_to_tensor, tensor_to_matrix};

/// L2 regularisation on leaf values.
const LAMBDA: f64 = 1.0;

/// Minimum hessian mass on each side of a split.
const MIN_CHILD_WEIGHT: f64 = 1e-3;

/// Floor on per-sample hessians.
const MIN_HESSIAN: f64 = 1e-6;

#[derive(Debug, Clone)]
enum Node {
    Leaf(f32),
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

/// One regression tree; node 0 is the root.
#[derive(Debug, Clone)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict(&self, row: &[f32]) -> f32 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf(value) => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Per-feature split candidates: sorted, de-duplicated quantile edges.
fn quantile_edges(x: &FeatureMatrix, bins: usize) -> Vec<Vec<f32>> {
    (0..x.cols())
        .map(|c| {
            let mut values: Vec<f32> = (0..x.rows()).map(|r| x.get(r, c)).collect();
            values.sort_by(f32::total_cmp);
            let mut edges: Vec<f32> = (1..bins)
                .filter_map(|j| values.get((j * values.len() / bins).saturating_sub(1)).copied())
                .collect();
            edges.dedup();
            // The largest value can never be a useful "<=" threshold.
            if let (Some(&last_edge), Some(&max)) = (edges.last(), values.last()) {
                if last_edge >= max {
                    edges.pop();
                }
            }
            edges
        })
        .collect()
}

struct TreeBuilder<'a> {
    binned: &'a [Vec<u16>],
    edges: &'a [Vec<f32>],
    grad: &'a [f64],
    hess: &'a [f64],
    max_depth: usize,
    learning_rate: f64,
    nodes: Vec<Node>,
}

struct BestSplit {
    gain: f64,
    feature: usize,
    bin: usize,
}

impl TreeBuilder<'_> {
    fn leaf_value(&self, indices: &[usize]) -> f32 {
        let g: f64 = indices.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = indices.iter().map(|&i| self.hess[i]).sum();
        (-g / (h + LAMBDA) * self.learning_rate) as f32
    }

    fn best_split(&self, indices: &[usize]) -> Option<BestSplit> {
        let g_total: f64 = indices.iter().map(|&i| self.grad[i]).sum();
        let h_total: f64 = indices.iter().map(|&i| self.hess[i]).sum();
        let parent = g_total * g_total / (h_total + LAMBDA);

        let mut best: Option<BestSplit> = None;
        for (feature, edges) in self.edges.iter().enumerate() {
            if edges.is_empty() {
                continue;
            }
            let mut g_hist = vec![0.0f64; edges.len() + 1];
            let mut h_hist = vec![0.0f64; edges.len() + 1];
            for &i in indices {
                let b = usize::from(self.binned[i][feature]);
                g_hist[b] += self.grad[i];
                h_hist[b] += self.hess[i];
            }

            let (mut g_left, mut h_left) = (0.0, 0.0);
            for bin in 0..edges.len() {
                g_left += g_hist[bin];
                h_left += h_hist[bin];
                let (g_right, h_right) = (g_total - g_left, h_total - h_left);
                if h_left < MIN_CHILD_WEIGHT || h_right < MIN_CHILD_WEIGHT {
                    continue;
                }
                let gain = g_left * g_left / (h_left + LAMBDA)
                    + g_right * g_right / (h_right + LAMBDA)
                    - parent;
                if gain > best.as_ref().map_or(EPSILON, |b| b.gain) {
                    best = Some(BestSplit { gain, feature, bin });
                }
            }
        }
        best
    }

    /// Grow the subtree for `indices`, returning its node index.
    fn grow(&mut self, indices: &[usize], depth: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf(self.leaf_value(indices)));
        if depth >= self.max_depth || indices.len() < 2 {
            return id;
        }
        let Some(split) = self.best_split(indices) else {
            return id;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| usize::from(self.binned[i][split.feature]) <= split.bin);
        if left_idx.is_empty() || right_idx.is_empty() {
            return id;
        }
        let left = self.grow(&left_idx, depth + 1);
        let right = self.grow(&right_idx, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: self.edges[split.feature][split.bin],
            left,
            right,
        };
        id
    }
}

fn softmax_rows(scores: &[f64], classes: usize) -> Vec<f64> {
    let mut probs = Vec::with_capacity(scores.len());
    for row in scores.chunks(classes) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = row.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        probs.extend(exps.iter().map(|e| e / total));
    }
    probs
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A trained multi-class boosted tree ensemble.
#[derive(Debug, Clone)]
pub struct GradientBoostedTrees {
    base_scores: Vec<f64>,
    /// `rounds[r][c]` is the tree for class `c` in round `r`.
    rounds: Vec<Vec<RegressionTree>>,
    input_dim: usize,
    num_classes: usize,
}

impl GradientBoostedTrees {
    /// Train on `x` / `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if the data is empty, the label count is
    /// wrong or a label is out of range, and [`MvidsError::Config`] if
    /// `num_classes < 2`.
    pub fn fit(
        x: &FeatureMatrix,
        labels: &[usize],
        num_classes: usize,
        config: &GbdtConfig,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(MvidsError::Config(format!(
                "boosted trees need at least 2 classes, got {num_classes}"
            )));
        }
        if x.rows() == 0 || x.rows() != labels.len() {
            return Err(MvidsError::Data(format!(
                "boosted trees got {} rows and {} labels",
                x.rows(),
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(MvidsError::Data(format!("label {bad} out of range")));
        }

        let n = x.rows();
        let bins = config.bins.clamp(2, usize::from(u16::MAX));
        let edges = quantile_edges(x, bins);
        let binned: Vec<Vec<u16>> = x
            .iter_rows()
            .map(|row| {
                row.iter()
                    .zip(&edges)
                    .map(|(v, e)| e.partition_point(|edge| edge < v) as u16)
                    .collect()
            })
            .collect();

        let mut counts = vec![0usize; num_classes];
        for &l in labels {
            counts[l] += 1;
        }
        let base_scores: Vec<f64> = counts
            .iter()
            .map(|&c| (c as f64 / n as f64).max(EPSILON).ln())
            .collect();

        let mut scores: Vec<f64> = (0..n).flat_map(|_| base_scores.iter().copied()).collect();
        let all: Vec<usize> = (0..n).collect();
        let mut rounds = Vec::with_capacity(config.n_estimators);

        for round in 0..config.n_estimators {
            let probs = softmax_rows(&scores, num_classes);
            let mut trees = Vec::with_capacity(num_classes);
            for class in 0..num_classes {
                let grad: Vec<f64> = (0..n)
                    .map(|i| probs[i * num_classes + class] - f64::from(u8::from(labels[i] == class)))
                    .collect();
                let hess: Vec<f64> = (0..n)
                    .map(|i| {
                        let p = probs[i * num_classes + class];
                        (p * (1.0 - p)).max(MIN_HESSIAN)
                    })
                    .collect();

                let mut builder = TreeBuilder {
                    binned: &binned,
                    edges: &edges,
                    grad: &grad,
                    hess: &hess,
                    max_depth: config.max_depth,
                    learning_rate: f64::from(config.learning_rate),
                    nodes: Vec::new(),
                };
                builder.grow(&all, 0);
                trees.push(RegressionTree {
                    nodes: builder.nodes,
                });
            }
            for (i, row) in x.iter_rows().enumerate() {
                for (class, tree) in trees.iter().enumerate() {
                    scores[i * num_classes + class] += f64::from(tree.predict(row));
                }
            }
            rounds.push(trees);

            if (round + 1) % 10 == 0 {
                tracing::debug!(round = round + 1, "Boosting round complete");
            }
        }

        let model = Self {
            base_scores,
            rounds,
            input_dim: x.cols(),
            num_classes,
        };
        tracing::info!(
            rounds = model.rounds.len(),
            classes = num_classes,
            "Boosted trees trained"
        );
        Ok(model)
    }

    /// Number of boosting rounds.
    #[must_use]
    pub fn num_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Class probabilities for each row of `x`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::DimensionMismatch`] if `x` has the wrong width.
    pub fn predict_matrix(&self, x: &FeatureMatrix) -> Result<FeatureMatrix> {
        x.expect_cols("boosted trees", self.input_dim)?;
        let mut scores = Vec::with_capacity(x.rows() * self.num_classes);
        for row in x.iter_rows() {
            for class in 0..self.num_classes {
                let boost: f64 = self
                    .rounds
                    .iter()
                    .map(|trees| f64::from(trees[class].predict(row)))
                    .sum();
                scores.push(self.base_scores[class] + boost);
            }
        }
        let probs = softmax_rows(&scores, self.num_classes)
            .into_iter()
            .map(|p| p as f32)
            .collect();
        FeatureMatrix::new(x.rows(), self.num_classes, probs)
    }
}

impl ProbabilisticClassifier for GradientBoostedTrees {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Boosted
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict_proba(&self, x: &Tensor) -> Result<Tensor> {
        check_input_width("boosted trees", x, self.input_dim)?;
        let probs = self.predict_matrix(&tensor_to_matrix(x)?)?;
        matrix_to_tensor(&probs, x.device())
    }
}
