//! Training, evaluation and orchestration for the MVIDS pipeline.
//!
//! - [`data`]: stratified splits and mini-batch iteration
//! - [`metrics`]: multi-class classification metrics
//! - [`trainer`]: AdamW training loops with early stopping
//! - [`pipeline`]: the end-to-end run behind the `mvids` binary

pub mod data;
pub mod metrics;
pub mod pipeline;
pub mod trainer;

pub use metrics::{compute_metrics, ClassificationMetrics};
pub use pipeline::{evaluate_results, run, run_on_dataset, RunSummary};
