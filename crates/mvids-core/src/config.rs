//! YAML configuration for a pipeline run.
//!
//! Every section is optional in the file; missing sections and fields fall
//! back to the defaults below. [`load_config`] validates the result so that
//! configuration errors surface before any model is built.
//!
//! ```yaml
//! data:
//!   label_column: "attack_type"
//!   normal_label: "BENIGN"
//! ensemble:
//!   confidence_threshold: 0.8
//! mvfl:
//!   embed_dim: 64
//!   num_heads: 4
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{MvidsError, Result};

// ---------------------------------------------------------------------------
// Top-level configuration
// ---------------------------------------------------------------------------

/// Configuration for a full pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Input table and split configuration.
    #[serde(default)]
    pub data: DataConfig,
    /// Minority-class balancing stage.
    #[serde(default)]
    pub balancing: BalancingConfig,
    /// Multi-view feature learning (views + fusion).
    #[serde(default)]
    pub mvfl: MvflConfig,
    /// Classifier bank, router and combiner.
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    /// Optimizer and early stopping for the neural models.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Check every section for values that would make the run meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.balancing.validate()?;
        self.mvfl.validate()?;
        self.ensemble.validate()?;
        self.training.validate()?;
        Ok(())
    }
}

/// Load a [`PipelineConfig`] from a YAML file at `path` and validate it.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or a
/// value is out of range.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MvidsError::Config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    let config: PipelineConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

fn require(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(MvidsError::Config(message()))
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Input table and train/validation/test split configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Column holding the class label.
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Label value of benign traffic; always encoded as class 0.
    #[serde(default = "default_normal_label")]
    pub normal_label: String,
    /// Fraction of each class held out for validation/calibration.
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,
    /// Fraction of each class held out for the final evaluation.
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,
    /// Seed for splits, shuffling and synthetic sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_label_column() -> String {
    "attack_type".to_string()
}

fn default_normal_label() -> String {
    "BENIGN".to_string()
}

fn default_val_ratio() -> f64 {
    0.2
}

fn default_test_ratio() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            label_column: default_label_column(),
            normal_label: default_normal_label(),
            val_ratio: default_val_ratio(),
            test_ratio: default_test_ratio(),
            seed: default_seed(),
        }
    }
}

impl DataConfig {
    fn validate(&self) -> Result<()> {
        require(!self.label_column.trim().is_empty(), || {
            "data.label_column must not be empty".to_string()
        })?;
        require(
            self.val_ratio > 0.0 && self.test_ratio > 0.0 && self.val_ratio + self.test_ratio < 1.0,
            || {
                format!(
                    "data.val_ratio ({}) and data.test_ratio ({}) must be positive and sum below 1",
                    self.val_ratio, self.test_ratio
                )
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Balancing
// ---------------------------------------------------------------------------

/// Minority-class balancing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancingConfig {
    /// Disable to train on the raw class distribution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Classes with fewer real samples than this are skipped.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Fixed target size per class; `None` targets the largest class size.
    #[serde(default)]
    pub target_count: Option<usize>,
    /// Synthetic rows whose mean absolute z-score against the minority class
    /// exceeds this are rejected.
    #[serde(default = "default_quality_max_z")]
    pub quality_max_z: f32,
    /// Standard deviation of the Gaussian jitter added to interpolated rows.
    #[serde(default = "default_jitter_std")]
    pub jitter_std: f32,
}

fn default_true() -> bool {
    true
}

fn default_min_samples() -> usize {
    10
}

fn default_quality_max_z() -> f32 {
    3.0
}

fn default_jitter_std() -> f32 {
    0.01
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: default_min_samples(),
            target_count: None,
            quality_max_z: default_quality_max_z(),
            jitter_std: default_jitter_std(),
        }
    }
}

impl BalancingConfig {
    fn validate(&self) -> Result<()> {
        require(self.min_samples >= 2, || {
            "balancing.min_samples must be at least 2".to_string()
        })?;
        require(self.quality_max_z > 0.0, || {
            "balancing.quality_max_z must be positive".to_string()
        })?;
        require(self.jitter_std >= 0.0 && self.jitter_std.is_finite(), || {
            "balancing.jitter_std must be a finite non-negative number".to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Multi-view feature learning
// ---------------------------------------------------------------------------

/// Multi-view feature learning configuration.
///
/// The global and temporal views embed to `embed_dim`; the protocol view
/// embeds to `embed_dim / 2` with `max(1, num_layers / 2)` attention blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvflConfig {
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Length of the pseudo-sequence synthesised by the temporal view.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Noise injected into the temporal pseudo-sequence during training.
    #[serde(default = "default_noise_std")]
    pub noise_std: f32,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Width of the first hidden layer of the fusion attention network.
    #[serde(default = "default_fusion_hidden")]
    pub fusion_hidden: usize,
}

fn default_embed_dim() -> usize {
    64
}

fn default_num_heads() -> usize {
    4
}

fn default_num_layers() -> usize {
    2
}

fn default_window() -> usize {
    8
}

fn default_noise_std() -> f32 {
    0.1
}

fn default_dropout() -> f32 {
    0.1
}

fn default_fusion_hidden() -> usize {
    128
}

impl Default for MvflConfig {
    fn default() -> Self {
        Self {
            embed_dim: default_embed_dim(),
            num_heads: default_num_heads(),
            num_layers: default_num_layers(),
            window: default_window(),
            noise_std: default_noise_std(),
            dropout: default_dropout(),
            fusion_hidden: default_fusion_hidden(),
        }
    }
}

impl MvflConfig {
    /// Embedding width of the protocol view.
    #[must_use]
    pub fn protocol_dim(&self) -> usize {
        self.embed_dim / 2
    }

    /// Number of attention blocks in the protocol view.
    #[must_use]
    pub fn protocol_layers(&self) -> usize {
        (self.num_layers / 2).max(1)
    }

    /// Validate the attention geometry.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if the protocol view's half width cannot
    /// be split across `num_heads`, or any size is zero.
    pub fn validate(&self) -> Result<()> {
        require(self.num_heads > 0 && self.num_layers > 0, || {
            "mvfl.num_heads and mvfl.num_layers must be positive".to_string()
        })?;
        require(
            self.embed_dim > 0 && self.embed_dim % (2 * self.num_heads) == 0,
            || {
                format!(
                    "mvfl.embed_dim ({}) must be a positive multiple of 2 * num_heads ({})",
                    self.embed_dim,
                    2 * self.num_heads
                )
            },
        )?;
        require(self.window > 0, || "mvfl.window must be positive".to_string())?;
        require(self.fusion_hidden >= 2, || {
            "mvfl.fusion_hidden must be at least 2".to_string()
        })?;
        require(
            (0.0..1.0).contains(&self.dropout) && self.noise_std >= 0.0,
            || "mvfl.dropout must be in [0, 1) and mvfl.noise_std non-negative".to_string(),
        )
    }
}

// ---------------------------------------------------------------------------
// Ensemble
// ---------------------------------------------------------------------------

/// Gradient-boosted tree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbdtConfig {
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_gbdt_learning_rate")]
    pub learning_rate: f32,
    /// Histogram bins per feature used for split search.
    #[serde(default = "default_bins")]
    pub bins: usize,
}

fn default_n_estimators() -> usize {
    50
}

fn default_max_depth() -> usize {
    3
}

fn default_gbdt_learning_rate() -> f32 {
    0.1
}

fn default_bins() -> usize {
    16
}

impl Default for GbdtConfig {
    fn default() -> Self {
        Self {
            n_estimators: default_n_estimators(),
            max_depth: default_max_depth(),
            learning_rate: default_gbdt_learning_rate(),
            bins: default_bins(),
        }
    }
}

/// Isolation forest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,
    /// Sub-sample size per tree.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

fn default_n_trees() -> usize {
    100
}

fn default_sample_size() -> usize {
    256
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            n_trees: default_n_trees(),
            sample_size: default_sample_size(),
        }
    }
}

/// Class labels emitted by the anomaly-detector fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Label emitted when the anomaly detector calls a sample normal.
    #[serde(default)]
    pub normal_label: usize,
    /// Label emitted when the anomaly detector calls a sample anomalous.
    #[serde(default = "default_anomaly_label")]
    pub anomaly_label: usize,
}

fn default_anomaly_label() -> usize {
    1
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            normal_label: 0,
            anomaly_label: default_anomaly_label(),
        }
    }
}

/// Classifier bank, router and combiner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Per-classifier confidence gate and per-sample fallback threshold.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_router_hidden")]
    pub router_hidden: usize,
    #[serde(default = "default_hidden")]
    pub lstm_hidden: usize,
    #[serde(default = "default_hidden")]
    pub graph_hidden: usize,
    #[serde(default)]
    pub gbdt: GbdtConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

fn default_confidence_threshold() -> f32 {
    0.8
}

fn default_router_hidden() -> usize {
    64
}

fn default_hidden() -> usize {
    64
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            router_hidden: default_router_hidden(),
            lstm_hidden: default_hidden(),
            graph_hidden: default_hidden(),
            gbdt: GbdtConfig::default(),
            isolation: IsolationConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

impl EnsembleConfig {
    fn validate(&self) -> Result<()> {
        require(
            self.confidence_threshold > 0.0 && self.confidence_threshold < 1.0,
            || {
                format!(
                    "ensemble.confidence_threshold ({}) must be in (0, 1)",
                    self.confidence_threshold
                )
            },
        )?;
        require(
            self.router_hidden >= 2 && self.lstm_hidden > 0 && self.graph_hidden > 0,
            || "ensemble hidden widths must be positive (router_hidden >= 2)".to_string(),
        )?;
        require(
            self.gbdt.n_estimators > 0 && self.gbdt.max_depth > 0 && self.gbdt.bins >= 2,
            || "ensemble.gbdt needs n_estimators > 0, max_depth > 0, bins >= 2".to_string(),
        )?;
        require(
            self.gbdt.learning_rate > 0.0 && self.gbdt.learning_rate <= 1.0,
            || "ensemble.gbdt.learning_rate must be in (0, 1]".to_string(),
        )?;
        require(
            self.isolation.n_trees > 0 && self.isolation.sample_size >= 2,
            || "ensemble.isolation needs n_trees > 0 and sample_size >= 2".to_string(),
        )?;
        require(
            self.fallback.normal_label != self.fallback.anomaly_label,
            || "ensemble.fallback labels must differ".to_string(),
        )
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

/// Optimizer and early-stopping configuration shared by the neural models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Epochs without validation improvement before stopping.
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Run on the CPU even when a GPU back end is compiled in.
    #[serde(default)]
    pub force_cpu: bool,
}

fn default_lr() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_batch_size() -> usize {
    256
}

fn default_epochs() -> usize {
    20
}

fn default_patience() -> usize {
    5
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            patience: default_patience(),
            force_cpu: false,
        }
    }
}

impl TrainingConfig {
    fn validate(&self) -> Result<()> {
        require(self.lr > 0.0 && self.weight_decay >= 0.0, || {
            "training.lr must be positive and training.weight_decay non-negative".to_string()
        })?;
        require(
            self.batch_size > 0 && self.epochs > 0 && self.patience > 0,
            || "training.batch_size, epochs and patience must be positive".to_string(),
        )
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper to write YAML to a temp file and return the path.
    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.ensemble.confidence_threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.balancing.min_samples, 10);
        assert_eq!(config.mvfl.protocol_dim(), 32);
        assert_eq!(config.mvfl.protocol_layers(), 1);
    }

    #[test]
    fn test_load_config_partial_uses_defaults() {
        let yaml = r#"
data:
  label_column: "Label"
ensemble:
  confidence_threshold: 0.7
  fallback:
    anomaly_label: 2
balancing:
  target_count: 500
logging:
  format: json
"#;
        let f = write_yaml(yaml);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.data.label_column, "Label");
        assert_eq!(config.data.normal_label, "BENIGN");
        assert!((config.ensemble.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.ensemble.fallback.anomaly_label, 2);
        assert_eq!(config.balancing.target_count, Some(500));
        assert_eq!(config.mvfl.embed_dim, 64);
        assert_eq!(config.logging.format, "json");
        assert!(!config.training.force_cpu);
    }

    #[test]
    fn test_force_cpu_from_yaml() {
        let f = write_yaml("training:\n  force_cpu: true\n  epochs: 3\n");
        let config = load_config(f.path()).unwrap();
        assert!(config.training.force_cpu);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 256);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(MvidsError::Config(_))));
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("not: [valid: yaml: {{{}}}");
        assert!(matches!(load_config(f.path()), Err(MvidsError::Yaml(_))));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let f = write_yaml("ensemble:\n  confidence_threshold: 1.5\n");
        assert!(matches!(load_config(f.path()), Err(MvidsError::Config(_))));
    }

    #[test]
    fn test_embed_dim_must_split_across_heads() {
        let config = MvflConfig {
            embed_dim: 36,
            num_heads: 4,
            ..MvflConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MvflConfig {
            embed_dim: 40,
            num_heads: 4,
            ..MvflConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallback_labels_must_differ() {
        let mut config = PipelineConfig::default();
        config.ensemble.fallback.anomaly_label = 0;
        assert!(config.validate().is_err());
    }
}
