//! Core types, errors, and configuration for MVIDS
//!
//! This crate contains the foundational types shared across all MVIDS
//! components: the error type, the row-major [`FeatureMatrix`] that every
//! stage consumes, probability-distribution validation, the YAML pipeline
//! configuration, preprocessing of raw flow tables, and the CSV artifact
//! layouts produced by a run.

pub mod artifacts;
pub mod config;
pub mod preprocess;

pub use config::{load_config, PipelineConfig};

// ---------------------------------------------------------------------------
// Numerical constants
// ---------------------------------------------------------------------------

/// Tolerance used when checking that a distribution sums to one.
pub const DISTRIBUTION_TOLERANCE: f64 = 1e-5;

/// Floor applied to denominators that may approach zero.
pub const EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(Debug, thiserror::Error)]
pub enum MvidsError {
    /// Configuration error. Always fatal.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input width does not match the width a component was built for.
    #[error("{component}: expected input width {expected}, got {actual}")]
    DimensionMismatch {
        /// Component that rejected the input.
        component: String,
        /// Width the component was configured with.
        expected: usize,
        /// Width that was supplied.
        actual: usize,
    },

    /// A weight vector or probability distribution is negative or does not sum to one.
    #[error("Invalid distribution for {what}: sum={sum:.6}")]
    InvalidDistribution {
        /// What the distribution describes (e.g. `router weights`).
        what: String,
        /// Observed sum (NaN if a component was negative or non-finite).
        sum: f64,
    },

    /// A calibrated classifier was used before its temperature was fit.
    #[error("Classifier not calibrated: {0}")]
    NotCalibrated(String),

    /// Tensor or model failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Malformed or inconsistent tabular data.
    #[error("Data error: {0}")]
    Data(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reader/writer error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// YAML configuration parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, MvidsError>`.
pub type Result<T> = std::result::Result<T, MvidsError>;

// ---------------------------------------------------------------------------
// Distributions
// ---------------------------------------------------------------------------

/// Check that `values` is a probability distribution: every entry finite and
/// non-negative, and the total within [`DISTRIBUTION_TOLERANCE`] of one.
///
/// # Errors
///
/// Returns [`MvidsError::InvalidDistribution`] otherwise.
pub fn validate_distribution(what: &str, values: &[f32]) -> Result<()> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(MvidsError::InvalidDistribution {
            what: what.to_string(),
            sum: f64::NAN,
        });
    }
    let sum: f64 = values.iter().map(|&v| f64::from(v)).sum();
    if (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
        return Err(MvidsError::InvalidDistribution {
            what: what.to_string(),
            sum,
        });
    }
    Ok(())
}

/// Index of the largest value. Ties resolve to the lowest index; an empty
/// slice yields 0.
#[must_use]
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Feature matrix
// ---------------------------------------------------------------------------

/// Dense row-major matrix of `f32` features: rows are samples, columns are
/// features. Immutable in shape once built, except for appending rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    /// Build a matrix from row-major data.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(MvidsError::Data(format!(
                "matrix data has {} values, expected {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from a list of equally sized rows.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if the rows are ragged.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(MvidsError::Data(format!(
                    "row {i} has {} columns, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// An empty matrix with a fixed column count.
    #[must_use]
    pub fn empty(cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            data: Vec::new(),
        }
    }

    /// Number of rows (samples).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (features).
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major backing data.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consume the matrix, returning its row-major data.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Borrow row `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= self.rows()`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Iterate over rows.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        (0..self.rows).map(move |i| self.row(i))
    }

    /// Value at `(row, col)`.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Mutable value at `(row, col)`.
    pub fn get_mut(&mut self, row: usize, col: usize) -> &mut f32 {
        &mut self.data[row * self.cols + col]
    }

    /// Gather the given rows into a new matrix, in order.
    #[must_use]
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::DimensionMismatch`] if the row width differs.
    pub fn push_row(&mut self, row: &[f32]) -> Result<()> {
        self.expect_width("FeatureMatrix::push_row", row.len())?;
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Append all rows of `other`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::DimensionMismatch`] if the widths differ.
    pub fn extend(&mut self, other: &FeatureMatrix) -> Result<()> {
        self.expect_width("FeatureMatrix::extend", other.cols)?;
        self.data.extend_from_slice(&other.data);
        self.rows += other.rows;
        Ok(())
    }

    /// Fail with [`MvidsError::DimensionMismatch`] unless this matrix has
    /// `expected` columns.
    pub fn expect_cols(&self, component: &str, expected: usize) -> Result<()> {
        if self.cols != expected {
            return Err(MvidsError::DimensionMismatch {
                component: component.to_string(),
                expected,
                actual: self.cols,
            });
        }
        Ok(())
    }

    fn expect_width(&self, component: &str, actual: usize) -> Result<()> {
        if actual != self.cols {
            return Err(MvidsError::DimensionMismatch {
                component: component.to_string(),
                expected: self.cols,
                actual,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_distribution_accepts_valid() {
        assert!(validate_distribution("w", &[0.4, 0.3, 0.2, 0.1]).is_ok());
        assert!(validate_distribution("w", &[1.0]).is_ok());
    }

    #[test]
    fn test_validate_distribution_rejects_bad_sum() {
        let err = validate_distribution("router weights", &[0.5, 0.6]).unwrap_err();
        match err {
            MvidsError::InvalidDistribution { what, sum } => {
                assert_eq!(what, "router weights");
                assert!((sum - 1.1).abs() < 1e-6);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_distribution_rejects_negative_and_nan() {
        assert!(validate_distribution("w", &[1.5, -0.5]).is_err());
        assert!(validate_distribution("w", &[f32::NAN, 1.0]).is_err());
        assert!(validate_distribution("w", &[]).is_err());
    }

    #[test]
    fn test_argmax_prefers_lowest_index_on_tie() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[0.0, 0.0, 0.0]), 0);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_matrix_from_rows_and_select() {
        let m = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]])
            .unwrap();
        assert_eq!(m.rows(), 3);
        assert_eq!(m.cols(), 2);
        assert_eq!(m.row(1), &[3.0, 4.0]);
        let s = m.select_rows(&[2, 0]);
        assert_eq!(s.as_slice(), &[5.0, 6.0, 1.0, 2.0]);
        assert_eq!(m.iter_rows().count(), 3);
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        assert!(FeatureMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(FeatureMatrix::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_matrix_push_row_checks_width() {
        let mut m = FeatureMatrix::empty(3);
        m.push_row(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(m.rows(), 1);
        assert!(matches!(
            m.push_row(&[1.0]),
            Err(MvidsError::DimensionMismatch {
                expected: 3,
                actual: 1,
                ..
            })
        ));
    }
}
