//! Confidence-gated, router-weighted ensemble combination.
//!
//! Two gates protect the final decision from low-confidence votes:
//!
//! 1. **Per-classifier gate**: classifier `i` contributes
//!    `router_weight_i × p_i` to a sample only when its confidence is strictly
//!    above the threshold. The contributions are summed and the sum is **not**
//!    renormalised, so a sample with masked members has total mass below 1.
//! 2. **Per-sample fallback**: when the fused distribution's maximum is still
//!    below the threshold, the prediction is replaced by the anomaly
//!    detector's binary decision (normal or anomaly label).
//!
//! The combination is written with tensor ops so the same code serves
//! inference and router training.

use candle_core::{DType, Tensor};
use mvids_core::config::EnsembleConfig;
use mvids_core::{argmax, validate_distribution, FeatureMatrix, MvidsError, Result, EPSILON};

use crate::bank::{ClassifierBank, ClassifierOutput};
use crate::router::Router;
use crate::tensor::{model_err, tensor_to_matrix};

/// Final labels for a batch, with diagnostics.
#[derive(Debug, Clone)]
pub struct EnsembleDecision {
    /// Predicted class id per sample.
    pub labels: Vec<usize>,
    /// Fused (unnormalised) class scores per sample.
    pub fused: FeatureMatrix,
    /// Whether the anomaly-detector fallback decided the sample.
    pub fallback: Vec<bool>,
}

impl EnsembleDecision {
    /// Number of samples decided by the fallback.
    #[must_use]
    pub fn fallback_count(&self) -> usize {
        self.fallback.iter().filter(|f| **f).count()
    }
}

/// Combines classifier outputs with router weights.
#[derive(Debug, Clone)]
pub struct EnsembleCombiner {
    threshold: f32,
    normal_label: usize,
    anomaly_label: usize,
}

impl EnsembleCombiner {
    /// Build a combiner.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `threshold` is outside `(0, 1)` or
    /// the two fallback labels are equal.
    pub fn new(threshold: f32, normal_label: usize, anomaly_label: usize) -> Result<Self> {
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(MvidsError::Config(format!(
                "confidence threshold must be in (0, 1), got {threshold}"
            )));
        }
        if normal_label == anomaly_label {
            return Err(MvidsError::Config(
                "fallback normal and anomaly labels must differ".to_string(),
            ));
        }
        Ok(Self {
            threshold,
            normal_label,
            anomaly_label,
        })
    }

    /// Build from the ensemble section of the configuration.
    pub fn from_config(config: &EnsembleConfig) -> Result<Self> {
        Self::new(
            config.confidence_threshold,
            config.fallback.normal_label,
            config.fallback.anomaly_label,
        )
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Gated, weighted sum of classifier probabilities, shape `[B, C]`.
    ///
    /// # Arguments
    ///
    /// * `outputs` - One output per classifier, in router order
    /// * `router_weights` - `[B, outputs.len()]`, each row a distribution
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if the shapes disagree and
    /// [`MvidsError::InvalidDistribution`] if a router row is not a
    /// distribution.
    pub fn combine(&self, outputs: &[ClassifierOutput], router_weights: &Tensor) -> Result<Tensor> {
        let (batch, members) = router_weights
            .dims2()
            .map_err(model_err("Router weights must be [batch, classifiers]"))?;
        if outputs.is_empty() || members != outputs.len() {
            return Err(MvidsError::Config(format!(
                "router produced {members} weights for {} classifiers",
                outputs.len()
            )));
        }
        let classes = outputs[0]
            .probabilities
            .dim(1)
            .map_err(model_err("Classifier probabilities must be [batch, classes]"))?;
        for out in outputs {
            if out.probabilities.dims() != [batch, classes] {
                return Err(MvidsError::Config(format!(
                    "{} probabilities have shape {:?}, expected [{batch}, {classes}]",
                    out.kind,
                    out.probabilities.dims()
                )));
            }
        }

        let rows: Vec<Vec<f32>> = router_weights
            .to_vec2()
            .map_err(model_err("Failed to read router weights"))?;
        for row in &rows {
            validate_distribution("router weights", row)?;
        }

        self.weighted_sum(outputs, router_weights, batch, classes)
            .map_err(model_err("Ensemble combination failed"))
    }

    fn weighted_sum(
        &self,
        outputs: &[ClassifierOutput],
        router_weights: &Tensor,
        batch: usize,
        classes: usize,
    ) -> candle_core::Result<Tensor> {
        let mut fused = Tensor::zeros((batch, classes), DType::F32, router_weights.device())?;
        for (i, out) in outputs.iter().enumerate() {
            let gate = out
                .confidence
                .gt(self.threshold)?
                .to_dtype(DType::F32)?
                .unsqueeze(1)?;
            let weight = (router_weights.narrow(1, i, 1)? * gate)?;
            fused = (fused + out.probabilities.broadcast_mul(&weight)?)?;
        }
        Ok(fused)
    }

    /// Final labels from fused scores.
    ///
    /// Samples whose best fused score is below the threshold take the
    /// anomaly detector's decision instead: `anomaly_flags[i]` selects the
    /// anomaly label, otherwise the normal label.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if `anomaly_flags` has the wrong length.
    pub fn decide(&self, fused: &Tensor, anomaly_flags: &[bool]) -> Result<EnsembleDecision> {
        let fused = tensor_to_matrix(fused)?;
        if anomaly_flags.len() != fused.rows() {
            return Err(MvidsError::Data(format!(
                "{} anomaly flags for {} samples",
                anomaly_flags.len(),
                fused.rows()
            )));
        }

        let mut labels = Vec::with_capacity(fused.rows());
        let mut fallback = Vec::with_capacity(fused.rows());
        for (row, &anomalous) in fused.iter_rows().zip(anomaly_flags) {
            let best = argmax(row);
            if row.get(best).copied().unwrap_or(0.0) < self.threshold {
                labels.push(if anomalous {
                    self.anomaly_label
                } else {
                    self.normal_label
                });
                fallback.push(true);
            } else {
                labels.push(best);
                fallback.push(false);
            }
        }

        let decision = EnsembleDecision {
            labels,
            fused,
            fallback,
        };
        let fallbacks = decision.fallback_count();
        if fallbacks > 0 {
            tracing::warn!(
                fallbacks,
                samples = decision.labels.len(),
                threshold = self.threshold,
                "Low-confidence samples routed to anomaly-detector fallback"
            );
        }
        Ok(decision)
    }
}

/// Normalised inverse-loss weights: `w_i ∝ 1 / max(loss_i, ε)`.
///
/// # Errors
///
/// Returns [`MvidsError::Config`] if `losses` is empty or contains a negative
/// or NaN loss.
pub fn inverse_loss_weights(losses: &[f64]) -> Result<Vec<f32>> {
    if losses.is_empty() || losses.iter().any(|l| l.is_nan() || *l < 0.0) {
        return Err(MvidsError::Config(format!(
            "inverse-loss weights need non-negative losses, got {losses:?}"
        )));
    }
    let inverse: Vec<f64> = losses.iter().map(|l| 1.0 / l.max(EPSILON)).collect();
    let total: f64 = inverse.iter().sum();
    let weights: Vec<f32> = inverse.iter().map(|w| (w / total) as f32).collect();
    validate_distribution("inverse-loss weights", &weights)?;
    Ok(weights)
}

// ---------------------------------------------------------------------------
// Dynamic ensemble
// ---------------------------------------------------------------------------

/// The trained bank, router and combiner, ready for inference.
pub struct DynamicEnsemble {
    pub bank: ClassifierBank,
    pub router: Router,
    pub combiner: EnsembleCombiner,
}

impl DynamicEnsemble {
    /// Predict labels for `x: [B, F]`.
    pub fn predict(&self, x: &Tensor) -> Result<EnsembleDecision> {
        let outputs = self.bank.predict_all(x)?;
        let weights = self.router.route(x, false)?;
        let fused = self.combiner.combine(&outputs, &weights)?;
        let flags = self.bank.anomaly_flags(x)?;
        self.combiner.decide(&fused, &flags)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::ClassifierKind;
    use candle_core::Device;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_distribution(rng: &mut ChaCha8Rng, classes: usize, confident: bool) -> Vec<f32> {
        let winner = rng.gen_range(0..classes);
        let top: f32 = if confident {
            rng.gen_range(0.85..0.99)
        } else {
            rng.gen_range(0.4..0.75)
        };
        let rest: Vec<f32> = (0..classes - 1).map(|_| rng.gen_range(0.1..1.0)).collect();
        let rest_total: f32 = rest.iter().sum();
        let mut rest = rest.into_iter().map(|r| r / rest_total * (1.0 - top));
        (0..classes)
            .map(|c| if c == winner { top } else { rest.next().unwrap() })
            .collect()
    }

    fn output(kind: ClassifierKind, rows: &[Vec<f32>]) -> ClassifierOutput {
        let m = FeatureMatrix::from_rows(rows).unwrap();
        let t = crate::tensor::matrix_to_tensor(&m, &Device::Cpu).unwrap();
        ClassifierOutput::from_probabilities(kind, t).unwrap()
    }

    fn router_weights(batch: usize, w: [f32; 4]) -> Tensor {
        let rows: Vec<Vec<f32>> = (0..batch).map(|_| w.to_vec()).collect();
        let m = FeatureMatrix::from_rows(&rows).unwrap();
        crate::tensor::matrix_to_tensor(&m, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_two_confident_classifiers_scenario() {
        // 100 samples, 3 classes. On even samples only classifiers 1 and 2
        // are confident; on odd samples every classifier is confident.
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut probs: Vec<Vec<Vec<f32>>> = vec![Vec::new(); 4];
        for s in 0..100 {
            for (i, p) in probs.iter_mut().enumerate() {
                let confident = i < 2 || s % 2 == 1;
                p.push(random_distribution(&mut rng, 3, confident));
            }
        }
        let outputs: Vec<ClassifierOutput> = ClassifierKind::ALL
            .iter()
            .zip(&probs)
            .map(|(&k, p)| output(k, p))
            .collect();
        let weights = [0.4, 0.3, 0.2, 0.1];
        let combiner = EnsembleCombiner::new(0.8, 0, 1).unwrap();

        let fused = combiner.combine(&outputs, &router_weights(100, weights)).unwrap();
        let fused: Vec<Vec<f32>> = fused.to_vec2().unwrap();
        for s in (0..100).step_by(2) {
            let expected: Vec<f32> = (0..3)
                .map(|c| 0.4 * probs[0][s][c] + 0.3 * probs[1][s][c])
                .collect();
            for (a, b) in fused[s].iter().zip(&expected) {
                assert!((a - b).abs() < 1e-6);
            }
            assert_eq!(argmax(&fused[s]), argmax(&expected));
            // Unnormalised: only 0.7 of the mass is present.
            let total: f32 = fused[s].iter().sum();
            assert!((total - 0.7).abs() < 1e-5);
        }
        for s in (1..100).step_by(2) {
            let total: f32 = fused[s].iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_all_below_threshold_uses_fallback() {
        let rows = vec![vec![0.5, 0.3, 0.2], vec![0.6, 0.2, 0.2]];
        let outputs: Vec<ClassifierOutput> =
            ClassifierKind::ALL.iter().map(|&k| output(k, &rows)).collect();
        let combiner = EnsembleCombiner::new(0.8, 0, 2).unwrap();

        let fused = combiner.combine(&outputs, &router_weights(2, [0.25; 4])).unwrap();
        let decision = combiner.decide(&fused, &[true, false]).unwrap();
        assert!(decision.fused.as_slice().iter().all(|v| *v == 0.0));
        assert_eq!(decision.fallback, vec![true, true]);
        assert_eq!(decision.labels, vec![2, 0]);
        assert_eq!(decision.fallback_count(), 2);
    }

    #[test]
    fn test_confident_sample_keeps_argmax() {
        let confident = vec![vec![0.05, 0.9, 0.05]];
        let outputs: Vec<ClassifierOutput> = ClassifierKind::ALL
            .iter()
            .map(|&k| output(k, &confident))
            .collect();
        let combiner = EnsembleCombiner::new(0.8, 0, 2).unwrap();
        let fused = combiner.combine(&outputs, &router_weights(1, [0.25; 4])).unwrap();
        let decision = combiner.decide(&fused, &[true]).unwrap();
        assert_eq!(decision.labels, vec![1]);
        assert_eq!(decision.fallback, vec![false]);
    }

    #[test]
    fn test_confidence_equal_to_threshold_is_masked() {
        let rows = vec![vec![0.8, 0.2]];
        let outputs: Vec<ClassifierOutput> =
            ClassifierKind::ALL.iter().map(|&k| output(k, &rows)).collect();
        let combiner = EnsembleCombiner::new(0.8, 0, 1).unwrap();
        let fused: Vec<Vec<f32>> = combiner
            .combine(&outputs, &router_weights(1, [0.25; 4]))
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(fused, vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_combine_rejects_invalid_router_weights() {
        let rows = vec![vec![0.9, 0.1]];
        let outputs: Vec<ClassifierOutput> =
            ClassifierKind::ALL.iter().map(|&k| output(k, &rows)).collect();
        let combiner = EnsembleCombiner::new(0.8, 0, 1).unwrap();
        assert!(matches!(
            combiner.combine(&outputs, &router_weights(1, [0.5, 0.5, 0.5, 0.0])),
            Err(MvidsError::InvalidDistribution { .. })
        ));
        assert!(matches!(
            combiner.combine(&outputs[..3], &router_weights(1, [0.25; 4])),
            Err(MvidsError::Config(_))
        ));
    }

    #[test]
    fn test_combiner_validates_configuration() {
        assert!(EnsembleCombiner::new(0.0, 0, 1).is_err());
        assert!(EnsembleCombiner::new(1.0, 0, 1).is_err());
        assert!(EnsembleCombiner::new(0.8, 1, 1).is_err());
        assert!(EnsembleCombiner::from_config(&EnsembleConfig::default()).is_ok());
    }

    #[test]
    fn test_decide_checks_flag_count() {
        let combiner = EnsembleCombiner::new(0.8, 0, 1).unwrap();
        let fused = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(combiner.decide(&fused, &[true]).is_err());
    }

    #[test]
    fn test_inverse_loss_weights() {
        let w = inverse_loss_weights(&[1.0, 2.0, 4.0, 4.0]).unwrap();
        assert!((w[0] - 0.5).abs() < 1e-6);
        assert!((w[1] - 0.25).abs() < 1e-6);
        assert!((w[3] - 0.125).abs() < 1e-6);

        // A zero loss is floored, never infinite.
        let w = inverse_loss_weights(&[0.0, 1.0]).unwrap();
        assert!(w.iter().all(|v| v.is_finite()));
        assert!(w[0] > 0.99);

        assert!(inverse_loss_weights(&[]).is_err());
        assert!(inverse_loss_weights(&[f64::NAN]).is_err());
    }
}
