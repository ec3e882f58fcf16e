//! The classifier bank: four independently trained classifiers, each
//! producing a class-probability distribution and a confidence per sample.
//!
//! | Member                      | Type                                   | Calibrated |
//! |-----------------------------|----------------------------------------|------------|
//! | Gradient-boosted trees      | [`GradientBoostedTrees`]               | no         |
//! | BiLSTM sequence classifier  | [`SequenceClassifier`]                 | yes        |
//! | Graph classifier            | [`GraphClassifier`]                    | yes        |
//! | Isolation forest            | [`IsolationForestClassifier`]          | no         |
//!
//! Member order is fixed by [`ClassifierKind::ALL`]; router weights use the
//! same order.

pub mod gbdt;
pub mod graph;
pub mod isolation;
pub mod sequence;

use candle_core::{Tensor, D};
use mvids_core::Result;
use serde::{Deserialize, Serialize};

use crate::calibration::Calibrated;
use crate::tensor::model_err;

pub use gbdt::GradientBoostedTrees;
pub use graph::{AdjacencyProvider, GraphClassifier, IdentityAdjacency};
pub use isolation::{IsolationForest, IsolationForestClassifier};
pub use sequence::SequenceClassifier;

/// Number of classifiers in the bank.
pub const NUM_CLASSIFIERS: usize = 4;

/// Identifies a bank member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Boosted,
    Sequence,
    Graph,
    Anomaly,
}

impl ClassifierKind {
    /// All members, in routing order.
    pub const ALL: [ClassifierKind; NUM_CLASSIFIERS] = [
        ClassifierKind::Boosted,
        ClassifierKind::Sequence,
        ClassifierKind::Graph,
        ClassifierKind::Anomaly,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ClassifierKind::Boosted => "boosted",
            ClassifierKind::Sequence => "sequence",
            ClassifierKind::Graph => "graph",
            ClassifierKind::Anomaly => "anomaly",
        }
    }
}

impl std::fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A trained classifier that outputs class probabilities.
pub trait ProbabilisticClassifier {
    fn kind(&self) -> ClassifierKind;

    /// Feature width the classifier was trained on.
    fn input_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Class probabilities for `x: [B, input_dim]`, shape `[B, num_classes]`.
    ///
    /// # Errors
    ///
    /// Returns [`mvids_core::MvidsError::DimensionMismatch`] on a width
    /// mismatch, or [`mvids_core::MvidsError::NotCalibrated`] if a
    /// calibrated member is used before calibration.
    fn predict_proba(&self, x: &Tensor) -> Result<Tensor>;
}

/// A neural model producing unnormalised class scores.
///
/// Implemented by every model trained with cross-entropy: the MVFL encoder,
/// the sequence classifier and the graph classifier.
pub trait LogitModel {
    fn input_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Logits for `x: [B, input_dim]`, shape `[B, num_classes]`.
    fn forward_logits(&self, x: &Tensor, train: bool) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// One member's prediction for a batch.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    pub kind: ClassifierKind,
    /// `[B, C]`, each row a distribution.
    pub probabilities: Tensor,
    /// `[B]`, the row-wise maximum of `probabilities`.
    pub confidence: Tensor,
}

impl ClassifierOutput {
    /// Wrap a probability batch, deriving the confidence.
    pub fn from_probabilities(kind: ClassifierKind, probabilities: Tensor) -> Result<Self> {
        let confidence = probabilities
            .max(D::Minus1)
            .map_err(model_err("Failed to compute confidence"))?;
        Ok(Self {
            kind,
            probabilities,
            confidence,
        })
    }
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

/// The four trained members.
pub struct ClassifierBank {
    pub boosted: GradientBoostedTrees,
    pub sequence: Calibrated<SequenceClassifier>,
    pub graph: Calibrated<GraphClassifier>,
    pub anomaly: IsolationForestClassifier,
}

impl ClassifierBank {
    /// Members in [`ClassifierKind::ALL`] order.
    #[must_use]
    pub fn members(&self) -> [&dyn ProbabilisticClassifier; NUM_CLASSIFIERS] {
        [&self.boosted, &self.sequence, &self.graph, &self.anomaly]
    }

    /// Run every member on `x`.
    ///
    /// # Errors
    ///
    /// Fails if any member fails, including an uncalibrated member.
    pub fn predict_all(&self, x: &Tensor) -> Result<Vec<ClassifierOutput>> {
        self.members()
            .iter()
            .map(|m| ClassifierOutput::from_probabilities(m.kind(), m.predict_proba(x)?))
            .collect()
    }

    /// The anomaly detector's binary decision per sample (`true` = anomalous).
    pub fn anomaly_flags(&self, x: &Tensor) -> Result<Vec<bool>> {
        self.anomaly.predict_anomalous(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_kind_order_and_names() {
        let names: Vec<&str> = ClassifierKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["boosted", "sequence", "graph", "anomaly"]);
    }

    #[test]
    fn test_confidence_is_row_max() {
        let probs = Tensor::new(&[[0.2f32, 0.7, 0.1], [0.5, 0.25, 0.25]], &Device::Cpu).unwrap();
        let out = ClassifierOutput::from_probabilities(ClassifierKind::Graph, probs).unwrap();
        assert_eq!(out.confidence.to_vec1::<f32>().unwrap(), vec![0.7, 0.5]);
    }
}
