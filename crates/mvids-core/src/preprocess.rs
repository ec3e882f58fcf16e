//! Raw flow table → numeric feature matrix + integer labels.
//!
//! Reads a CSV with a header row and one label column. Every other column is
//! parsed as a float; cells that are empty, non-numeric or infinite count as
//! missing and are imputed with the column mean before each column is
//! standardised to zero mean and unit variance.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use crate::{FeatureMatrix, MvidsError, Result};

// ---------------------------------------------------------------------------
// Label encoding
// ---------------------------------------------------------------------------

/// Stable mapping between label strings and class ids.
///
/// The normal label (if present) is always class 0; the remaining labels are
/// assigned ids in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Build an encoder from observed labels.
    #[must_use]
    pub fn fit<S: AsRef<str>>(labels: &[S], normal_label: &str) -> Self {
        let distinct: BTreeSet<&str> = labels.iter().map(|l| l.as_ref().trim()).collect();
        let mut classes = Vec::with_capacity(distinct.len());
        if distinct.contains(normal_label) {
            classes.push(normal_label.to_string());
        }
        classes.extend(
            distinct
                .into_iter()
                .filter(|l| *l != normal_label)
                .map(str::to_string),
        );
        let encoder = Self { classes };
        if !encoder.has_normal(normal_label) {
            tracing::warn!(
                normal_label,
                class_zero = encoder.decode(0).unwrap_or(""),
                "Normal label not present in the data; class 0 is an attack class \
                 and the fallback normal label will name it"
            );
        }
        encoder
    }

    /// Whether `normal_label` was observed and holds id 0.
    #[must_use]
    pub fn has_normal(&self, normal_label: &str) -> bool {
        self.classes.first().is_some_and(|c| c == normal_label)
    }

    /// Build an encoder from an explicit class list.
    #[must_use]
    pub fn from_classes(classes: Vec<String>) -> Self {
        Self { classes }
    }

    /// Class id for `label`.
    #[must_use]
    pub fn encode(&self, label: &str) -> Option<usize> {
        let label = label.trim();
        self.classes.iter().position(|c| c == label)
    }

    /// Label string for class `id`.
    #[must_use]
    pub fn decode(&self, id: usize) -> Option<&str> {
        self.classes.get(id).map(String::as_str)
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// All class labels, indexed by id.
    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

// ---------------------------------------------------------------------------
// Standardisation
// ---------------------------------------------------------------------------

/// Per-column z-score standardiser.
#[derive(Debug, Clone)]
pub struct Standardizer {
    means: Vec<f32>,
    stds: Vec<f32>,
}

impl Standardizer {
    /// Compute column means and standard deviations.
    #[must_use]
    pub fn fit(x: &FeatureMatrix) -> Self {
        let n = x.rows().max(1) as f64;
        let mut means = vec![0.0f64; x.cols()];
        for row in x.iter_rows() {
            for (m, &v) in means.iter_mut().zip(row) {
                *m += f64::from(v);
            }
        }
        means.iter_mut().for_each(|m| *m /= n);

        let mut vars = vec![0.0f64; x.cols()];
        for row in x.iter_rows() {
            for ((acc, &v), &m) in vars.iter_mut().zip(row).zip(&means) {
                let d = f64::from(v) - m;
                *acc += d * d;
            }
        }

        Self {
            means: means.iter().map(|&m| m as f32).collect(),
            stds: vars.iter().map(|&v| (v / n).sqrt() as f32).collect(),
        }
    }

    /// Standardise `x` in place. Zero-variance columns become 0.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::DimensionMismatch`] if the column count differs
    /// from the fitted data.
    pub fn transform(&self, x: &mut FeatureMatrix) -> Result<()> {
        x.expect_cols("Standardizer", self.means.len())?;
        for r in 0..x.rows() {
            for c in 0..x.cols() {
                let std = self.stds[c];
                let v = x.get_mut(r, c);
                *v = if std > f32::EPSILON {
                    (*v - self.means[c]) / std
                } else {
                    0.0
                };
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dataset loading
// ---------------------------------------------------------------------------

/// A preprocessed dataset ready for the pipeline.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Standardised features, one row per flow.
    pub features: FeatureMatrix,
    /// Class id per row.
    pub labels: Vec<usize>,
    /// Feature column names, in matrix column order.
    pub feature_names: Vec<String>,
    /// Label encoder used for `labels`.
    pub encoder: LabelEncoder,
}

impl Dataset {
    /// Number of samples per class id.
    #[must_use]
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.encoder.num_classes()];
        for &l in &self.labels {
            counts[l] += 1;
        }
        counts
    }
}

/// Load and preprocess a CSV file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the label column is missing,
/// or there are no feature columns.
pub fn load_csv(path: &Path, label_column: &str, normal_label: &str) -> Result<Dataset> {
    let file = std::fs::File::open(path).map_err(|e| {
        MvidsError::Data(format!("Failed to open dataset {}: {e}", path.display()))
    })?;
    let dataset = read_dataset(file, label_column, normal_label)?;
    tracing::info!(
        path = %path.display(),
        samples = dataset.features.rows(),
        features = dataset.features.cols(),
        classes = dataset.encoder.num_classes(),
        "Dataset loaded"
    );
    Ok(dataset)
}

/// Preprocess a CSV stream: parse, impute, standardise and encode labels.
///
/// # Errors
///
/// See [`load_csv`].
pub fn read_dataset<R: Read>(reader: R, label_column: &str, normal_label: &str) -> Result<Dataset> {
    let mut csv = csv::ReaderBuilder::new().flexible(false).from_reader(reader);
    let headers: Vec<String> = csv.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let label_idx = headers
        .iter()
        .position(|h| h == label_column.trim())
        .ok_or_else(|| MvidsError::Data(format!("label column '{label_column}' not found")))?;
    let feature_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != label_idx)
        .map(|(_, h)| h.clone())
        .collect();
    if feature_names.is_empty() {
        return Err(MvidsError::Data("dataset has no feature columns".to_string()));
    }

    let mut raw_labels = Vec::new();
    let mut data = Vec::new();
    let mut missing = 0usize;
    for record in csv.records() {
        let record = record?;
        for (i, field) in record.iter().enumerate() {
            if i == label_idx {
                raw_labels.push(field.trim().to_string());
            } else {
                let value = field.trim().parse::<f32>().ok().filter(|v| v.is_finite());
                if value.is_none() {
                    missing += 1;
                }
                data.push(value.unwrap_or(f32::NAN));
            }
        }
    }
    if raw_labels.is_empty() {
        return Err(MvidsError::Data("dataset has no rows".to_string()));
    }
    if missing > 0 {
        tracing::warn!(missing, "Imputing missing or non-finite cells with column means");
    }

    let mut features = FeatureMatrix::new(raw_labels.len(), feature_names.len(), data)?;
    impute_column_means(&mut features);
    Standardizer::fit(&features).transform(&mut features)?;

    let encoder = LabelEncoder::fit(&raw_labels, normal_label);
    let labels = raw_labels
        .iter()
        .map(|l| {
            encoder
                .encode(l)
                .ok_or_else(|| MvidsError::Data(format!("unencodable label '{l}'")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Dataset {
        features,
        labels,
        feature_names,
        encoder,
    })
}

/// Replace NaN cells with their column mean (0 for all-missing columns).
pub fn impute_column_means(x: &mut FeatureMatrix) {
    for c in 0..x.cols() {
        let (sum, count) = (0..x.rows())
            .map(|r| x.get(r, c))
            .filter(|v| v.is_finite())
            .fold((0.0f64, 0usize), |(s, n), v| (s + f64::from(v), n + 1));
        let mean = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };
        for r in 0..x.rows() {
            let v = x.get_mut(r, c);
            if !v.is_finite() {
                *v = mean;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
 Flow Duration, Fwd Packets,Label
10,1,BENIGN
20,,DDoS
30,3,PortScan
,4,BENIGN
50,Infinity,DDoS
";

    #[test]
    fn test_label_encoder_puts_normal_first() {
        let enc = LabelEncoder::fit(&["PortScan", "BENIGN", "DDoS", "BENIGN"], "BENIGN");
        assert_eq!(enc.classes(), &["BENIGN", "DDoS", "PortScan"]);
        assert_eq!(enc.encode("DDoS"), Some(1));
        assert_eq!(enc.decode(2), Some("PortScan"));
        assert_eq!(enc.encode("Bot"), None);
    }

    #[test]
    fn test_label_encoder_without_normal_label() {
        let enc = LabelEncoder::fit(&["b", "a"], "BENIGN");
        assert_eq!(enc.classes(), &["a", "b"]);
        assert!(!enc.has_normal("BENIGN"));
        assert_eq!(enc.decode(0), Some("a"));

        let enc = LabelEncoder::fit(&["b", "BENIGN"], "BENIGN");
        assert!(enc.has_normal("BENIGN"));
    }

    #[test]
    fn test_read_dataset_imputes_and_standardises() {
        let ds = read_dataset(SAMPLE.as_bytes(), "Label", "BENIGN").unwrap();
        assert_eq!(ds.features.rows(), 5);
        assert_eq!(ds.features.cols(), 2);
        assert_eq!(ds.feature_names, vec!["Flow Duration", "Fwd Packets"]);
        assert_eq!(ds.labels, vec![0, 1, 2, 0, 1]);
        assert_eq!(ds.class_counts(), vec![2, 2, 1]);
        assert!(ds.features.as_slice().iter().all(|v| v.is_finite()));

        for c in 0..2 {
            let mean: f32 = (0..5).map(|r| ds.features.get(r, c)).sum::<f32>() / 5.0;
            assert!(mean.abs() < 1e-5);
        }
    }

    #[test]
    fn test_read_dataset_missing_label_column() {
        let result = read_dataset(SAMPLE.as_bytes(), "attack_type", "BENIGN");
        assert!(matches!(result, Err(MvidsError::Data(_))));
    }

    #[test]
    fn test_zero_variance_column_becomes_zero() {
        let mut x = FeatureMatrix::from_rows(&[vec![1.0, 5.0], vec![3.0, 5.0]]).unwrap();
        Standardizer::fit(&x).transform(&mut x).unwrap();
        assert_eq!(x.get(0, 1), 0.0);
        assert_eq!(x.get(1, 1), 0.0);
        assert!((x.get(0, 0) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_impute_all_missing_column() {
        let mut x = FeatureMatrix::from_rows(&[vec![f32::NAN, 1.0], vec![f32::NAN, 3.0]]).unwrap();
        impute_column_means(&mut x);
        assert_eq!(x.get(0, 0), 0.0);
        assert_eq!(x.get(1, 1), 3.0);
    }
}
