//! Temperature scaling.
//!
//! A calibrated model divides its logits by a scalar temperature `T` fit on
//! held-out data by minimising the mean negative log-likelihood. The fit
//! optimises the inverse temperature `s = 1/T`, in which the NLL is convex,
//! with damped Newton steps starting from `T = 1`. Steps are only accepted
//! when they lower the loss, so the calibrated loss never exceeds the
//! uncalibrated one.

use candle_core::{Tensor, D};
use mvids_core::{FeatureMatrix, MvidsError, Result, EPSILON};
use serde::Serialize;

use crate::bank::{ClassifierKind, LogitModel, ProbabilisticClassifier};
use crate::tensor::{model_err, tensor_to_matrix};

/// Smallest temperature a model may be calibrated to.
pub const MIN_TEMPERATURE: f32 = 0.05;

/// Largest temperature a model may be calibrated to.
pub const MAX_TEMPERATURE: f32 = 100.0;

const MAX_ITERATIONS: usize = 50;
const MAX_HALVINGS: usize = 30;
const GRADIENT_TOLERANCE: f64 = 1e-7;

/// Result of [`fit_temperature`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureFit {
    pub temperature: f32,
    /// Mean NLL at `T = 1`.
    pub loss_before: f64,
    /// Mean NLL at the fitted temperature.
    pub loss_after: f64,
    pub iterations: usize,
}

fn check_inputs(logits: &FeatureMatrix, labels: &[usize]) -> Result<()> {
    if logits.rows() == 0 {
        return Err(MvidsError::Data(
            "temperature calibration needs at least one sample".to_string(),
        ));
    }
    if logits.rows() != labels.len() {
        return Err(MvidsError::Data(format!(
            "calibration has {} logit rows but {} labels",
            logits.rows(),
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= logits.cols()) {
        return Err(MvidsError::Data(format!(
            "calibration label {bad} out of range for {} classes",
            logits.cols()
        )));
    }
    Ok(())
}

/// Loss, first and second derivative of the mean NLL with respect to the
/// inverse temperature `s`.
fn nll_derivatives(logits: &FeatureMatrix, labels: &[usize], s: f64) -> (f64, f64, f64) {
    let mut loss = 0.0;
    let mut grad = 0.0;
    let mut hess = 0.0;
    for (row, &label) in logits.iter_rows().zip(labels) {
        let max = row.iter().fold(f64::NEG_INFINITY, |m, &z| m.max(s * f64::from(z)));
        let weights: Vec<f64> = row.iter().map(|&z| (s * f64::from(z) - max).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mean_z: f64 = row
            .iter()
            .zip(&weights)
            .map(|(&z, &w)| f64::from(z) * w)
            .sum::<f64>()
            / total;
        let mean_z2: f64 = row
            .iter()
            .zip(&weights)
            .map(|(&z, &w)| f64::from(z) * f64::from(z) * w)
            .sum::<f64>()
            / total;
        let target = f64::from(row[label]);

        loss += max + total.ln() - s * target;
        grad += mean_z - target;
        hess += mean_z2 - mean_z * mean_z;
    }
    let n = labels.len() as f64;
    (loss / n, grad / n, hess / n)
}

/// Mean negative log-likelihood of `labels` under `softmax(logits / temperature)`.
///
/// # Errors
///
/// Returns [`MvidsError::Data`] if the inputs are inconsistent and
/// [`MvidsError::Config`] if `temperature` is not positive.
pub fn nll_at_temperature(logits: &FeatureMatrix, labels: &[usize], temperature: f64) -> Result<f64> {
    check_inputs(logits, labels)?;
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(MvidsError::Config(format!(
            "temperature must be positive, got {temperature}"
        )));
    }
    Ok(nll_derivatives(logits, labels, 1.0 / temperature.max(EPSILON)).0)
}

/// Fit the temperature minimising the NLL of `labels` given `logits`.
///
/// # Errors
///
/// Returns [`MvidsError::Data`] if there are no samples, the label count
/// differs from the logit rows, or a label is out of range.
pub fn fit_temperature(logits: &FeatureMatrix, labels: &[usize]) -> Result<TemperatureFit> {
    check_inputs(logits, labels)?;
    let s_min = 1.0 / f64::from(MAX_TEMPERATURE);
    let s_max = 1.0 / f64::from(MIN_TEMPERATURE);

    let mut s = 1.0;
    let (loss_before, mut grad, mut hess) = nll_derivatives(logits, labels, s);
    let mut loss = loss_before;
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS && grad.abs() > GRADIENT_TOLERANCE {
        iterations += 1;
        let mut step = grad / hess.max(EPSILON);
        let mut accepted = false;
        for _ in 0..MAX_HALVINGS {
            let candidate = (s - step).clamp(s_min, s_max);
            let (l, g, h) = nll_derivatives(logits, labels, candidate);
            if l < loss {
                s = candidate;
                loss = l;
                grad = g;
                hess = h;
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted {
            break;
        }
    }

    let temperature = (1.0 / s) as f32;
    if (s - s_min).abs() < f64::EPSILON || (s - s_max).abs() < f64::EPSILON {
        tracing::warn!(temperature, "Temperature reached its bound during calibration");
    }

    Ok(TemperatureFit {
        temperature,
        loss_before,
        loss_after: loss,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Calibrated model
// ---------------------------------------------------------------------------

/// A logit model whose probabilities are `softmax(logits / T)`.
///
/// Using the model as a [`ProbabilisticClassifier`] before a temperature is
/// set fails with [`MvidsError::NotCalibrated`].
pub struct Calibrated<M> {
    kind: ClassifierKind,
    model: M,
    temperature: Option<f32>,
}

impl<M: LogitModel> Calibrated<M> {
    /// Wrap an uncalibrated model.
    pub fn new(kind: ClassifierKind, model: M) -> Self {
        Self {
            kind,
            model,
            temperature: None,
        }
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Fitted temperature, if any.
    #[must_use]
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Set the temperature directly, clamped to
    /// `[MIN_TEMPERATURE, MAX_TEMPERATURE]`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `temperature` is not a positive
    /// finite number.
    pub fn set_temperature(&mut self, temperature: f32) -> Result<()> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(MvidsError::Config(format!(
                "{} temperature must be positive, got {temperature}",
                self.kind
            )));
        }
        let clamped = temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE);
        if clamped != temperature {
            tracing::warn!(classifier = %self.kind, temperature, clamped, "Temperature floored");
        }
        self.temperature = Some(clamped);
        Ok(())
    }

    /// Fit the temperature on held-out `x` / `labels` and store it.
    pub fn calibrate(&mut self, x: &Tensor, labels: &[usize]) -> Result<TemperatureFit> {
        let logits = tensor_to_matrix(&self.model.forward_logits(x, false)?)?;
        self.calibrate_logits(&logits, labels)
    }

    /// Fit the temperature on precomputed held-out logits and store it.
    ///
    /// Used when the validation set is scored in several batches.
    pub fn calibrate_logits(
        &mut self,
        logits: &FeatureMatrix,
        labels: &[usize],
    ) -> Result<TemperatureFit> {
        let fit = fit_temperature(logits, labels)?;
        self.set_temperature(fit.temperature)?;
        tracing::info!(
            classifier = %self.kind,
            temperature = fit.temperature,
            loss_before = fit.loss_before,
            loss_after = fit.loss_after,
            "Temperature calibrated"
        );
        Ok(fit)
    }

    /// `logits / T` for `x`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::NotCalibrated`] if no temperature is set.
    pub fn calibrated_logits(&self, x: &Tensor) -> Result<Tensor> {
        let temperature = self
            .temperature
            .ok_or_else(|| MvidsError::NotCalibrated(self.kind.to_string()))?;
        self.model
            .forward_logits(x, false)?
            .affine(1.0 / f64::from(temperature), 0.0)
            .map_err(model_err("Failed to scale logits"))
    }
}

impl<M: LogitModel> ProbabilisticClassifier for Calibrated<M> {
    fn kind(&self) -> ClassifierKind {
        self.kind
    }

    fn input_dim(&self) -> usize {
        self.model.input_dim()
    }

    fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    fn predict_proba(&self, x: &Tensor) -> Result<Tensor> {
        let logits = self.calibrated_logits(x)?;
        candle_nn::ops::softmax(&logits, D::Minus1).map_err(model_err("Calibrated softmax failed"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Overconfident logits: correct class boosted, but 30% of labels flipped.
    fn overconfident(n: usize, classes: usize) -> (FeatureMatrix, Vec<usize>) {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut rows = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let predicted = rng.gen_range(0..classes);
            let row: Vec<f32> = (0..classes)
                .map(|c| if c == predicted { 8.0 } else { rng.gen_range(-1.0..1.0) })
                .collect();
            rows.push(row);
            labels.push(if rng.gen_bool(0.3) {
                (predicted + 1) % classes
            } else {
                predicted
            });
        }
        (FeatureMatrix::from_rows(&rows).unwrap(), labels)
    }

    struct FixedLogits(Tensor);

    impl LogitModel for FixedLogits {
        fn input_dim(&self) -> usize {
            1
        }

        fn num_classes(&self) -> usize {
            self.0.dims2().unwrap().1
        }

        fn forward_logits(&self, _x: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_calibration_does_not_increase_loss() {
        let (logits, labels) = overconfident(200, 3);
        let fit = fit_temperature(&logits, &labels).unwrap();
        assert!(fit.loss_after <= fit.loss_before);
        // Overconfident logits must be softened.
        assert!(fit.temperature > 1.0);
        let check = nll_at_temperature(&logits, &labels, f64::from(fit.temperature)).unwrap();
        assert!((check - fit.loss_after).abs() < 1e-4);
    }

    #[test]
    fn test_calibration_of_perfect_predictions_sharpens() {
        let logits = FeatureMatrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let fit = fit_temperature(&logits, &[0, 1]).unwrap();
        assert!(fit.temperature < 1.0);
        assert!(fit.temperature >= MIN_TEMPERATURE);
        assert!(fit.loss_after < fit.loss_before);
    }

    #[test]
    fn test_fit_rejects_bad_inputs() {
        let logits = FeatureMatrix::from_rows(&[vec![1.0, 0.0]]).unwrap();
        assert!(fit_temperature(&logits, &[]).is_err());
        assert!(fit_temperature(&logits, &[2]).is_err());
        assert!(fit_temperature(&FeatureMatrix::empty(2), &[]).is_err());
        assert!(nll_at_temperature(&logits, &[0], 0.0).is_err());
    }

    #[test]
    fn test_uncalibrated_model_fails() {
        let logits = Tensor::new(&[[2.0f32, 0.0]], &Device::Cpu).unwrap();
        let model = Calibrated::new(ClassifierKind::Sequence, FixedLogits(logits.clone()));
        assert!(matches!(
            model.predict_proba(&logits),
            Err(MvidsError::NotCalibrated(_))
        ));
    }

    #[test]
    fn test_calibrated_probabilities_use_temperature() {
        let logits = Tensor::new(&[[2.0f32, 0.0]], &Device::Cpu).unwrap();
        let mut model = Calibrated::new(ClassifierKind::Graph, FixedLogits(logits.clone()));
        model.set_temperature(2.0).unwrap();
        let p: Vec<Vec<f32>> = model.predict_proba(&logits).unwrap().to_vec2().unwrap();
        let expected = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((p[0][0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_set_temperature_validation() {
        let logits = Tensor::new(&[[1.0f32, 0.0]], &Device::Cpu).unwrap();
        let mut model = Calibrated::new(ClassifierKind::Graph, FixedLogits(logits));
        assert!(model.set_temperature(0.0).is_err());
        assert!(model.set_temperature(f32::NAN).is_err());
        model.set_temperature(1e-6).unwrap();
        assert_eq!(model.temperature(), Some(MIN_TEMPERATURE));
    }

    #[test]
    fn test_calibrate_stores_temperature() {
        let (logits, labels) = overconfident(100, 3);
        let device = Device::Cpu;
        let t = crate::tensor::matrix_to_tensor(&logits, &device).unwrap();
        let mut model = Calibrated::new(ClassifierKind::Sequence, FixedLogits(t.clone()));
        let fit = model.calibrate(&t, &labels).unwrap();
        assert_eq!(model.temperature(), Some(fit.temperature));
        assert!(model.predict_proba(&t).is_ok());
    }
}
