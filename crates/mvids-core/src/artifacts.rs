//! Tabular artifacts written by a pipeline run.
//!
//! - **Features table**: `mvfl_feature_0..N`, `global_attention`,
//!   `temporal_attention`, `protocol_attention`, `attack_type`. One row per
//!   sample: the fused embedding, the per-view attention weights and the
//!   sample's label.
//! - **Results table**: `true_labels`, `predictions`.
//!
//! Floats are written with Rust's shortest round-trip formatting, so reading
//! a table back yields bit-identical values.

use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FeatureMatrix, MvidsError, Result};

/// Prefix of the fused-embedding columns in the features table.
pub const FEATURE_COLUMN_PREFIX: &str = "mvfl_feature_";

/// Attention-weight columns, in view order (global, temporal, protocol).
pub const ATTENTION_COLUMNS: [&str; 3] =
    ["global_attention", "temporal_attention", "protocol_attention"];

/// Label column of the features table.
pub const LABEL_COLUMN: &str = "attack_type";

// ---------------------------------------------------------------------------
// Features table
// ---------------------------------------------------------------------------

/// Fused embeddings, attention weights and labels for a set of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturesTable {
    /// Fused embedding per sample.
    pub embeddings: FeatureMatrix,
    /// Attention weights per sample (global, temporal, protocol).
    pub attention: Vec<[f32; 3]>,
    /// Label per sample.
    pub labels: Vec<String>,
}

impl FeaturesTable {
    /// Assemble a table, checking that all columns have one entry per sample.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] on a length mismatch.
    pub fn new(
        embeddings: FeatureMatrix,
        attention: Vec<[f32; 3]>,
        labels: Vec<String>,
    ) -> Result<Self> {
        if attention.len() != embeddings.rows() || labels.len() != embeddings.rows() {
            return Err(MvidsError::Data(format!(
                "features table length mismatch: {} embeddings, {} attention rows, {} labels",
                embeddings.rows(),
                attention.len(),
                labels.len()
            )));
        }
        Ok(Self {
            embeddings,
            attention,
            labels,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Header row for this table's embedding width.
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = (0..self.embeddings.cols())
            .map(|i| format!("{FEATURE_COLUMN_PREFIX}{i}"))
            .collect();
        header.extend(ATTENTION_COLUMNS.iter().map(|c| (*c).to_string()));
        header.push(LABEL_COLUMN.to_string());
        header
    }

    /// Write the table as CSV.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(self.header())?;
        for ((row, attention), label) in self
            .embeddings
            .iter_rows()
            .zip(&self.attention)
            .zip(&self.labels)
        {
            let mut record: Vec<String> = row.iter().map(f32::to_string).collect();
            record.extend(attention.iter().map(f32::to_string));
            record.push(label.clone());
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Read a table written by [`FeaturesTable::write_csv`].
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if the header does not follow the
    /// features-table layout or a cell is not a number.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::Reader::from_reader(reader);
        let headers: Vec<String> = csv.headers()?.iter().map(str::to_string).collect();
        let width = headers
            .len()
            .checked_sub(ATTENTION_COLUMNS.len() + 1)
            .ok_or_else(|| MvidsError::Data("features table header too short".to_string()))?;

        for (i, h) in headers.iter().take(width).enumerate() {
            if *h != format!("{FEATURE_COLUMN_PREFIX}{i}") {
                return Err(MvidsError::Data(format!(
                    "unexpected features column '{h}' at position {i}"
                )));
            }
        }
        if headers[width..width + 3] != ATTENTION_COLUMNS || headers[width + 3] != LABEL_COLUMN {
            return Err(MvidsError::Data(format!(
                "features table must end with {ATTENTION_COLUMNS:?} and '{LABEL_COLUMN}'"
            )));
        }

        let mut embeddings = FeatureMatrix::empty(width);
        let mut attention = Vec::new();
        let mut labels = Vec::new();
        for (line, record) in csv.records().enumerate() {
            let record = record?;
            let values = record
                .iter()
                .take(width + 3)
                .map(|f| {
                    f.parse::<f32>().map_err(|e| {
                        MvidsError::Data(format!("row {line}: invalid number '{f}': {e}"))
                    })
                })
                .collect::<Result<Vec<f32>>>()?;
            embeddings.push_row(&values[..width])?;
            attention.push([values[width], values[width + 1], values[width + 2]]);
            labels.push(record.get(width + 3).unwrap_or_default().to_string());
        }

        Self::new(embeddings, attention, labels)
    }

    /// Write the table to a CSV file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.write_csv(std::fs::File::create(path)?)
    }

    /// Read a table from a CSV file.
    ///
    /// # Errors
    ///
    /// See [`FeaturesTable::read_csv`].
    pub fn load(path: &Path) -> Result<Self> {
        Self::read_csv(std::fs::File::open(path)?)
    }
}

// ---------------------------------------------------------------------------
// Results table
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ResultRow {
    true_labels: usize,
    predictions: usize,
}

/// Ground truth and predicted class id per evaluated sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsTable {
    pub true_labels: Vec<usize>,
    pub predictions: Vec<usize>,
}

impl ResultsTable {
    /// Assemble a results table.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Data`] if the columns differ in length.
    pub fn new(true_labels: Vec<usize>, predictions: Vec<usize>) -> Result<Self> {
        if true_labels.len() != predictions.len() {
            return Err(MvidsError::Data(format!(
                "results table length mismatch: {} labels, {} predictions",
                true_labels.len(),
                predictions.len()
            )));
        }
        Ok(Self {
            true_labels,
            predictions,
        })
    }

    /// Write as CSV.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        for (&true_labels, &predictions) in self.true_labels.iter().zip(&self.predictions) {
            csv.serialize(ResultRow {
                true_labels,
                predictions,
            })?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Read a table written by [`ResultsTable::write_csv`].
    ///
    /// # Errors
    ///
    /// Returns an error if the CSV is malformed.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut table = Self::default();
        for row in csv::Reader::from_reader(reader).deserialize() {
            let row: ResultRow = row?;
            table.true_labels.push(row.true_labels);
            table.predictions.push(row.predictions);
        }
        Ok(table)
    }

    /// Write to a CSV file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.write_csv(std::fs::File::create(path)?)
    }

    /// Read from a CSV file.
    ///
    /// # Errors
    ///
    /// See [`ResultsTable::read_csv`].
    pub fn load(path: &Path) -> Result<Self> {
        Self::read_csv(std::fs::File::open(path)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_features() -> FeaturesTable {
        let embeddings = FeatureMatrix::from_rows(&[
            vec![0.1, -2.5e-7, 3.0],
            vec![1.0 / 3.0, f32::MIN_POSITIVE, -0.0],
        ])
        .unwrap();
        FeaturesTable::new(
            embeddings,
            vec![[0.2, 0.3, 0.5], [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]],
            vec!["BENIGN".to_string(), "DDoS".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_features_header_layout() {
        let header = sample_features().header();
        assert_eq!(
            header,
            vec![
                "mvfl_feature_0",
                "mvfl_feature_1",
                "mvfl_feature_2",
                "global_attention",
                "temporal_attention",
                "protocol_attention",
                "attack_type",
            ]
        );
    }

    #[test]
    fn test_features_table_round_trip_is_lossless() {
        let table = sample_features();
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let back = FeaturesTable::read_csv(buf.as_slice()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_features_table_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let table = sample_features();
        table.save(&path).unwrap();
        assert_eq!(FeaturesTable::load(&path).unwrap(), table);
    }

    #[test]
    fn test_features_table_rejects_foreign_header() {
        let csv = "a,b,global_attention,temporal_attention,protocol_attention,attack_type\n";
        assert!(matches!(
            FeaturesTable::read_csv(csv.as_bytes()),
            Err(MvidsError::Data(_))
        ));
    }

    #[test]
    fn test_features_table_length_mismatch() {
        let embeddings = FeatureMatrix::from_rows(&[vec![0.0]]).unwrap();
        assert!(FeaturesTable::new(embeddings, vec![], vec!["x".to_string()]).is_err());
    }

    #[test]
    fn test_results_table_round_trip() {
        let table = ResultsTable::new(vec![0, 1, 2, 1], vec![0, 2, 2, 1]).unwrap();
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("true_labels,predictions\n"));
        assert_eq!(ResultsTable::read_csv(buf.as_slice()).unwrap(), table);
    }

    #[test]
    fn test_results_table_length_mismatch() {
        assert!(ResultsTable::new(vec![0], vec![]).is_err());
    }
}
