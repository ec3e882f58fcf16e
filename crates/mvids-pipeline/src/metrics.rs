//! Multi-class classification metrics.
//!
//! Computes confusion-matrix-derived metrics from predicted and ground-truth
//! class ids. Macro averages weight every class equally, including classes
//! with no support in the evaluated set.

use mvids_core::{MvidsError, Result};
use serde::Serialize;

/// Precision, recall and F1 for one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of true samples of this class.
    pub support: usize,
}

/// Metrics computed from a multi-class confusion matrix.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    /// `confusion[true][predicted]`.
    pub confusion: Vec<Vec<usize>>,
    pub per_class: Vec<ClassMetrics>,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Compute metrics for `predictions` against `labels`.
///
/// `class_names[i]` names class id `i`.
///
/// # Errors
///
/// Returns [`MvidsError::Data`] if the lengths differ or an id is out of
/// range for `class_names`.
pub fn compute_metrics(
    predictions: &[usize],
    labels: &[usize],
    class_names: &[String],
) -> Result<ClassificationMetrics> {
    if predictions.len() != labels.len() {
        return Err(MvidsError::Data(format!(
            "{} predictions for {} labels",
            predictions.len(),
            labels.len()
        )));
    }
    let k = class_names.len();
    if let Some(&bad) = predictions.iter().chain(labels).find(|&&c| c >= k) {
        return Err(MvidsError::Data(format!(
            "class id {bad} out of range for {k} classes"
        )));
    }

    let mut confusion = vec![vec![0usize; k]; k];
    for (&pred, &label) in predictions.iter().zip(labels) {
        confusion[label][pred] += 1;
    }

    let correct: usize = (0..k).map(|c| confusion[c][c]).sum();
    let accuracy = ratio(correct, labels.len());

    let per_class: Vec<ClassMetrics> = class_names
        .iter()
        .enumerate()
        .map(|(c, name)| {
            let tp = confusion[c][c];
            let predicted: usize = (0..k).map(|r| confusion[r][c]).sum();
            let support: usize = confusion[c].iter().sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                label: name.clone(),
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect();

    let mean = |f: fn(&ClassMetrics) -> f64| {
        if k == 0 {
            0.0
        } else {
            per_class.iter().map(f).sum::<f64>() / k as f64
        }
    };

    Ok(ClassificationMetrics {
        accuracy,
        macro_precision: mean(|m| m.precision),
        macro_recall: mean(|m| m.recall),
        macro_f1: mean(|m| m.f1),
        confusion,
        per_class,
    })
}

impl std::fmt::Display for ClassificationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "acc={:.4} macro_prec={:.4} macro_rec={:.4} macro_f1={:.4}",
            self.accuracy, self.macro_precision, self.macro_recall, self.macro_f1,
        )?;
        writeln!(
            f,
            "{:<24} {:>9} {:>9} {:>9} {:>9}",
            "class", "precision", "recall", "f1", "support"
        )?;
        for m in &self.per_class {
            writeln!(
                f,
                "{:<24} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                m.label, m.precision, m.recall, m.f1, m.support
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(k: usize) -> Vec<String> {
        (0..k).map(|c| format!("class_{c}")).collect()
    }

    #[test]
    fn test_perfect_predictions() {
        let labels = vec![0, 1, 2, 2, 1];
        let m = compute_metrics(&labels, &labels, &names(3)).unwrap();
        assert!((m.accuracy - 1.0).abs() < 1e-9);
        assert!((m.macro_precision - 1.0).abs() < 1e-9);
        assert!((m.macro_recall - 1.0).abs() < 1e-9);
        assert!((m.macro_f1 - 1.0).abs() < 1e-9);
        assert_eq!(m.confusion[2][2], 2);
    }

    #[test]
    fn test_mixed() {
        // class 0: 2 right, 1 predicted as 1
        // class 1: 1 right, 1 predicted as 0
        let labels = vec![0, 0, 0, 1, 1];
        let preds = vec![0, 0, 1, 1, 0];
        let m = compute_metrics(&preds, &labels, &names(2)).unwrap();
        assert_eq!(m.confusion, vec![vec![2, 1], vec![1, 1]]);
        assert!((m.accuracy - 3.0 / 5.0).abs() < 1e-9);

        let c0 = &m.per_class[0];
        assert!((c0.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((c0.recall - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(c0.support, 3);

        let c1 = &m.per_class[1];
        assert!((c1.precision - 0.5).abs() < 1e-9);
        assert!((c1.recall - 0.5).abs() < 1e-9);
        assert!((m.macro_recall - (2.0 / 3.0 + 0.5) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_class_without_support() {
        let m = compute_metrics(&[0, 0], &[0, 0], &names(3)).unwrap();
        assert_eq!(m.per_class[2].support, 0);
        assert!((m.per_class[2].f1).abs() < 1e-9);
        assert!((m.macro_f1 - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty() {
        let m = compute_metrics(&[], &[], &names(2)).unwrap();
        assert!((m.accuracy).abs() < 1e-9);
        assert!((m.macro_f1).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(compute_metrics(&[0], &[0, 1], &names(2)).is_err());
        assert!(compute_metrics(&[2], &[0], &names(2)).is_err());
    }

    #[test]
    fn test_display_lists_classes() {
        let m = compute_metrics(&[0, 1], &[0, 1], &names(2)).unwrap();
        let text = m.to_string();
        assert!(text.contains("class_0"));
        assert!(text.contains("macro_f1=1.0000"));
    }
}
