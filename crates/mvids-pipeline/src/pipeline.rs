//! End-to-end pipeline: preprocessing, balancing, multi-view feature
//! learning, the classifier bank, router training and evaluation.
//!
//! A run writes the following into its output directory:
//!
//! | File                      | Contents                                        |
//! |---------------------------|-------------------------------------------------|
//! | `features.csv`            | fused embedding + view attention per sample     |
//! | `results.csv`             | true and predicted class id per test sample     |
//! | `summary.json`            | [`RunSummary`]                                  |
//! | `models/*.safetensors`    | one parameter bundle per neural model           |

use std::path::Path;

use candle_core::{Device, Tensor};
use mvids_core::artifacts::{FeaturesTable, ResultsTable};
use mvids_core::preprocess::{load_csv, Dataset};
use mvids_core::{argmax, FeatureMatrix, MvidsError, PipelineConfig, Result, EPSILON};
use mvids_ml::bank::{
    GradientBoostedTrees, GraphClassifier, IdentityAdjacency, IsolationForest,
    IsolationForestClassifier, SequenceClassifier, NUM_CLASSIFIERS,
};
use mvids_ml::device::{device_label, select_device};
use mvids_ml::tensor::tensor_to_matrix;
use mvids_ml::{
    balance, inverse_loss_weights, BalanceReport, Calibrated, ClassifierBank, ClassifierKind,
    ClassifierOutput, DynamicEnsemble, EnsembleCombiner, EnsembleDecision, InterpolatingSynthesizer,
    LogitModel, MvflEncoder, ParamBundle, Router, TemperatureFit,
};
use serde::Serialize;

use crate::data::{chunk_ranges, rows_to_tensor, stratified_split, Split};
use crate::metrics::{compute_metrics, ClassificationMetrics};
use crate::trainer::{predict_logits, train_logit_model, train_router, RouterSplit, TrainOutcome};

pub const FEATURES_FILE: &str = "features.csv";
pub const RESULTS_FILE: &str = "results.csv";
pub const SUMMARY_FILE: &str = "summary.json";
pub const MODELS_DIR: &str = "models";

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Partition sizes of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SplitSizes {
    pub train: usize,
    /// Training rows after balancing.
    pub balanced_train: usize,
    pub val: usize,
    pub test: usize,
}

/// Fitted temperature of a calibrated member.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSummary {
    pub classifier: ClassifierKind,
    #[serde(flatten)]
    pub fit: TemperatureFit,
}

/// Diagnostics for one bank member.
#[derive(Debug, Clone, Serialize)]
pub struct MemberSummary {
    pub classifier: ClassifierKind,
    /// Mean NLL on the calibration split.
    pub val_loss: f64,
    /// Normalised inverse-loss weight.
    pub prior_weight: f32,
    pub test_accuracy: f64,
}

/// Everything a run reports, written to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub classes: Vec<String>,
    pub samples: usize,
    pub features: usize,
    /// Compute device the neural members ran on.
    pub device: String,
    pub split: SplitSizes,
    pub balance: BalanceReport,
    pub training: Vec<TrainOutcome>,
    pub calibration: Vec<CalibrationSummary>,
    pub members: Vec<MemberSummary>,
    /// Mean router weight per member over the test split.
    pub mean_router_weights: Vec<f32>,
    /// Mean view attention (global, temporal, protocol) over all samples.
    pub mean_attention: [f32; 3],
    pub fallback_count: usize,
    pub metrics: ClassificationMetrics,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Load `data_path` and run the whole pipeline, writing artifacts to
/// `out_dir`.
///
/// # Errors
///
/// Returns an error if the data cannot be loaded, a stage fails, or an
/// artifact cannot be written.
pub fn run(config: &PipelineConfig, data_path: &Path, out_dir: &Path) -> Result<RunSummary> {
    config.validate()?;
    let dataset = load_csv(data_path, &config.data.label_column, &config.data.normal_label)?;
    run_on_dataset(config, &dataset, out_dir)
}

/// Run the pipeline on an already preprocessed dataset.
pub fn run_on_dataset(
    config: &PipelineConfig,
    dataset: &Dataset,
    out_dir: &Path,
) -> Result<RunSummary> {
    let classes = dataset.encoder.classes().to_vec();
    let num_classes = classes.len();
    let input_dim = dataset.features.cols();
    if num_classes < 2 {
        return Err(MvidsError::Data(format!(
            "need at least 2 classes, found {num_classes}"
        )));
    }
    std::fs::create_dir_all(out_dir)?;

    let device = select_device(config.training.force_cpu);
    tracing::info!(device = device_label(&device), "Selected compute device");
    let seed = config.data.seed;
    let batch_size = config.training.batch_size;

    // Split and balance
    let split = stratified_split(
        &dataset.features,
        &dataset.labels,
        config.data.val_ratio,
        config.data.test_ratio,
        seed,
    )?;
    if split.test.is_empty() {
        return Err(MvidsError::Data("test split is empty".to_string()));
    }
    let mut synthesizer = InterpolatingSynthesizer::new(seed, config.balancing.jitter_std)?;
    let balanced = balance(
        &split.train.features,
        &split.train.labels,
        num_classes,
        &config.balancing,
        &mut synthesizer,
    )?;
    let report = balanced.report;
    let train = Split {
        features: balanced.features,
        labels: balanced.labels,
    };
    tracing::info!(
        original = split.train.len(),
        balanced = train.len(),
        generated = report.total_generated(),
        "Training split balanced"
    );

    let calibration = if split.val.is_empty() {
        tracing::warn!("Validation split is empty, calibrating on the training split");
        &train
    } else {
        &split.val
    };

    // Multi-view feature learning
    let mut mvfl_bundle = ParamBundle::new("mvfl", &device);
    let encoder = MvflEncoder::new(input_dim, num_classes, &config.mvfl, mvfl_bundle.var_builder())?;
    let mvfl_outcome = train_logit_model(
        "mvfl",
        &encoder,
        &mut mvfl_bundle,
        &train,
        &split.val,
        &config.training,
        seed,
    )?;
    let features = encode_features(&encoder, dataset, batch_size, &device)?;
    features.save(&out_dir.join(FEATURES_FILE))?;
    let mean_attention = mean_attention(&features);
    tracing::info!(
        samples = features.len(),
        global = mean_attention[0],
        temporal = mean_attention[1],
        protocol = mean_attention[2],
        "Fused features written"
    );

    // Classifier bank
    let boosted = GradientBoostedTrees::fit(
        &train.features,
        &train.labels,
        num_classes,
        &config.ensemble.gbdt,
    )?;

    let mut sequence_bundle = ParamBundle::new("sequence", &device);
    let sequence = SequenceClassifier::new(
        input_dim,
        config.ensemble.lstm_hidden,
        num_classes,
        config.mvfl.dropout,
        sequence_bundle.var_builder(),
    )?;
    let sequence_outcome = train_logit_model(
        "sequence",
        &sequence,
        &mut sequence_bundle,
        &train,
        &split.val,
        &config.training,
        seed,
    )?;
    let mut sequence = Calibrated::new(ClassifierKind::Sequence, sequence);
    let sequence_fit = calibrate(&mut sequence, calibration, batch_size, &device)?;

    let mut graph_bundle = ParamBundle::new("graph", &device);
    let graph = GraphClassifier::new(
        input_dim,
        config.ensemble.graph_hidden,
        num_classes,
        config.mvfl.dropout,
        Box::new(IdentityAdjacency),
        graph_bundle.var_builder(),
    )?;
    let graph_outcome = train_logit_model(
        "graph",
        &graph,
        &mut graph_bundle,
        &train,
        &split.val,
        &config.training,
        seed,
    )?;
    let mut graph = Calibrated::new(ClassifierKind::Graph, graph);
    let graph_fit = calibrate(&mut graph, calibration, batch_size, &device)?;

    let forest = IsolationForest::fit(
        &normal_rows(&train, config.ensemble.fallback.normal_label),
        &config.ensemble.isolation,
        seed,
    )?;
    let anomaly = IsolationForestClassifier::new(forest, num_classes, &config.ensemble.fallback)?;

    let bank = ClassifierBank {
        boosted,
        sequence,
        graph,
        anomaly,
    };

    // Static prior from validation losses
    let calibration_outputs = bank_outputs(&bank, &calibration.features, batch_size, &device)?;
    let val_losses: Vec<f64> = calibration_outputs
        .iter()
        .map(|o| mean_nll(&o.probabilities, &calibration.labels))
        .collect::<Result<_>>()?;
    let prior = inverse_loss_weights(&val_losses)?;
    for ((kind, loss), weight) in ClassifierKind::ALL.iter().zip(&val_losses).zip(&prior) {
        tracing::info!(classifier = %kind, val_loss = loss, prior_weight = weight, "Member scored");
    }

    // Router
    let combiner = EnsembleCombiner::from_config(&config.ensemble)?;
    let mut router_bundle = ParamBundle::new("router", &device);
    let router = Router::new(
        input_dim,
        config.ensemble.router_hidden,
        config.mvfl.dropout,
        router_bundle.var_builder(),
    )?;
    let train_outputs = bank_outputs(&bank, &train.features, batch_size, &device)?;
    let val_outputs = if split.val.is_empty() {
        Vec::new()
    } else {
        calibration_outputs
    };
    let router_outcome = train_router(
        &router,
        &mut router_bundle,
        &combiner,
        RouterSplit {
            split: &train,
            outputs: &train_outputs,
        },
        RouterSplit {
            split: &split.val,
            outputs: &val_outputs,
        },
        &config.training,
        seed,
    )?;

    // Evaluation
    let ensemble = DynamicEnsemble {
        bank,
        router,
        combiner,
    };
    let (decision, mean_router_weights) =
        predict_in_chunks(&ensemble, &split.test.features, batch_size, &device)?;
    let metrics = compute_metrics(&decision.labels, &split.test.labels, &classes)?;
    tracing::info!(
        accuracy = metrics.accuracy,
        macro_f1 = metrics.macro_f1,
        fallbacks = decision.fallback_count(),
        "Test evaluation complete"
    );

    let test_outputs = bank_outputs(&ensemble.bank, &split.test.features, batch_size, &device)?;
    let mut members = Vec::with_capacity(NUM_CLASSIFIERS);
    for (i, output) in test_outputs.iter().enumerate() {
        members.push(MemberSummary {
            classifier: output.kind,
            val_loss: val_losses[i],
            prior_weight: prior[i],
            test_accuracy: accuracy(&output.probabilities, &split.test.labels)?,
        });
    }

    ResultsTable::new(split.test.labels.clone(), decision.labels.clone())?
        .save(&out_dir.join(RESULTS_FILE))?;
    let models = out_dir.join(MODELS_DIR);
    for bundle in [&mvfl_bundle, &sequence_bundle, &graph_bundle, &router_bundle] {
        bundle.save(&models.join(format!("{}.safetensors", bundle.name())))?;
    }

    let summary = RunSummary {
        classes,
        samples: dataset.features.rows(),
        features: input_dim,
        device: device_label(&device).to_string(),
        split: SplitSizes {
            train: split.train.len(),
            balanced_train: train.len(),
            val: split.val.len(),
            test: split.test.len(),
        },
        balance: report,
        training: vec![mvfl_outcome, sequence_outcome, graph_outcome, router_outcome],
        calibration: vec![
            CalibrationSummary {
                classifier: ClassifierKind::Sequence,
                fit: sequence_fit,
            },
            CalibrationSummary {
                classifier: ClassifierKind::Graph,
                fit: graph_fit,
            },
        ],
        members,
        mean_router_weights,
        mean_attention,
        fallback_count: decision.fallback_count(),
        metrics,
    };
    std::fs::write(
        out_dir.join(SUMMARY_FILE),
        serde_json::to_string_pretty(&summary)?,
    )?;
    tracing::info!(out_dir = %out_dir.display(), "Run artifacts written");
    Ok(summary)
}

/// Recompute metrics from a saved results table.
///
/// Without `class_names`, classes are named by id.
pub fn evaluate_results(
    path: &Path,
    class_names: Option<Vec<String>>,
) -> Result<ClassificationMetrics> {
    let results = ResultsTable::load(path)?;
    let names = class_names.unwrap_or_else(|| {
        let k = results
            .true_labels
            .iter()
            .chain(&results.predictions)
            .max()
            .map_or(0, |m| m + 1);
        (0..k).map(|c| c.to_string()).collect()
    });
    compute_metrics(&results.predictions, &results.true_labels, &names)
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Fused embeddings and view weights for every sample of `dataset`.
fn encode_features(
    encoder: &MvflEncoder,
    dataset: &Dataset,
    batch_size: usize,
    device: &Device,
) -> Result<FeaturesTable> {
    let mut embeddings = FeatureMatrix::empty(encoder.fusion_dim());
    let mut attention = Vec::with_capacity(dataset.features.rows());
    for range in chunk_ranges(dataset.features.rows(), batch_size) {
        let out = encoder.encode(&rows_to_tensor(&dataset.features, range, device)?, false)?;
        embeddings.extend(&tensor_to_matrix(&out.fused)?)?;
        let weights = tensor_to_matrix(&out.weights)?;
        for row in weights.iter_rows() {
            let row: [f32; 3] = row.try_into().map_err(|_| {
                MvidsError::Model(format!("expected 3 view weights, got {}", row.len()))
            })?;
            attention.push(row);
        }
    }
    let labels = dataset
        .labels
        .iter()
        .map(|&l| {
            dataset
                .encoder
                .decode(l)
                .map(str::to_string)
                .ok_or_else(|| MvidsError::Data(format!("unknown class id {l}")))
        })
        .collect::<Result<Vec<_>>>()?;
    FeaturesTable::new(embeddings, attention, labels)
}

fn mean_attention(features: &FeaturesTable) -> [f32; 3] {
    let mut mean = [0.0f32; 3];
    for row in &features.attention {
        for (m, w) in mean.iter_mut().zip(row) {
            *m += w;
        }
    }
    let n = features.len().max(1) as f32;
    mean.map(|m| m / n)
}

fn calibrate<M: LogitModel>(
    model: &mut Calibrated<M>,
    split: &Split,
    batch_size: usize,
    device: &Device,
) -> Result<TemperatureFit> {
    let logits = predict_logits(model.model(), &split.features, batch_size, device)?;
    model.calibrate_logits(&logits, &split.labels)
}

/// Training rows of the normal class, or every row when there are too few
/// normal rows to fit a forest.
fn normal_rows(train: &Split, normal_label: usize) -> FeatureMatrix {
    let rows: Vec<usize> = train
        .labels
        .iter()
        .enumerate()
        .filter(|(_, &l)| l == normal_label)
        .map(|(i, _)| i)
        .collect();
    if rows.len() < 2 {
        tracing::warn!(
            normal_rows = rows.len(),
            "Too few normal samples, fitting the isolation forest on all training rows"
        );
        return train.features.clone();
    }
    train.features.select_rows(&rows)
}

/// Every member's output for every row of `x`, scored in chunks.
fn bank_outputs(
    bank: &ClassifierBank,
    x: &FeatureMatrix,
    batch_size: usize,
    device: &Device,
) -> Result<Vec<ClassifierOutput>> {
    if x.rows() == 0 {
        return Err(MvidsError::Data("cannot score an empty split".to_string()));
    }
    let mut parts: Vec<Vec<Tensor>> = vec![Vec::new(); NUM_CLASSIFIERS];
    for range in chunk_ranges(x.rows(), batch_size) {
        let batch = rows_to_tensor(x, range, device)?;
        for (i, out) in bank.predict_all(&batch)?.into_iter().enumerate() {
            parts[i].push(out.probabilities);
        }
    }
    ClassifierKind::ALL
        .iter()
        .zip(parts)
        .map(|(&kind, parts)| {
            let probabilities = Tensor::cat(&parts, 0)
                .map_err(|e| MvidsError::Model(format!("Failed to join {kind} outputs: {e}")))?;
            ClassifierOutput::from_probabilities(kind, probabilities)
        })
        .collect()
}

/// Ensemble decisions for every row of `x` and the mean router weights.
fn predict_in_chunks(
    ensemble: &DynamicEnsemble,
    x: &FeatureMatrix,
    batch_size: usize,
    device: &Device,
) -> Result<(EnsembleDecision, Vec<f32>)> {
    let mut decision = EnsembleDecision {
        labels: Vec::with_capacity(x.rows()),
        fused: FeatureMatrix::empty(0),
        fallback: Vec::with_capacity(x.rows()),
    };
    let mut weight_sums = vec![0.0f32; NUM_CLASSIFIERS];
    for range in chunk_ranges(x.rows(), batch_size) {
        let batch = rows_to_tensor(x, range, device)?;
        let part = ensemble.predict(&batch)?;
        if decision.fused.rows() == 0 {
            decision.fused = FeatureMatrix::empty(part.fused.cols());
        }
        decision.fused.extend(&part.fused)?;
        decision.labels.extend(part.labels);
        decision.fallback.extend(part.fallback);

        let weights = tensor_to_matrix(&ensemble.router.route(&batch, false)?)?;
        for row in weights.iter_rows() {
            for (s, w) in weight_sums.iter_mut().zip(row) {
                *s += w;
            }
        }
    }
    let n = x.rows().max(1) as f32;
    Ok((decision, weight_sums.into_iter().map(|s| s / n).collect()))
}

/// Mean `-ln p(label)` over the rows of `probabilities`.
fn mean_nll(probabilities: &Tensor, labels: &[usize]) -> Result<f64> {
    let probs = tensor_to_matrix(probabilities)?;
    if probs.rows() != labels.len() || labels.is_empty() {
        return Err(MvidsError::Data(format!(
            "{} probability rows for {} labels",
            probs.rows(),
            labels.len()
        )));
    }
    let total: f64 = probs
        .iter_rows()
        .zip(labels)
        .map(|(row, &l)| -(f64::from(row[l]).max(EPSILON)).ln())
        .sum();
    Ok(total / labels.len() as f64)
}

fn accuracy(probabilities: &Tensor, labels: &[usize]) -> Result<f64> {
    let probs = tensor_to_matrix(probabilities)?;
    let correct = probs
        .iter_rows()
        .zip(labels)
        .filter(|(row, &l)| argmax(row) == l)
        .count();
    Ok(correct as f64 / labels.len().max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_nll() {
        let p = Tensor::new(&[[0.5f32, 0.5], [1.0, 0.0]], &Device::Cpu).unwrap();
        let loss = mean_nll(&p, &[0, 0]).unwrap();
        assert!((loss - 0.5 * 2f64.ln()).abs() < 1e-6);

        // A zero probability is floored, never infinite.
        let loss = mean_nll(&p, &[0, 1]).unwrap();
        assert!(loss.is_finite());
        assert!(mean_nll(&p, &[0]).is_err());
    }

    #[test]
    fn test_accuracy() {
        let p = Tensor::new(&[[0.9f32, 0.1], [0.2, 0.8], [0.6, 0.4]], &Device::Cpu).unwrap();
        let acc = accuracy(&p, &[0, 1, 1]).unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normal_rows_falls_back_to_all() {
        let split = Split {
            features: FeatureMatrix::from_rows(&[vec![0.0], vec![1.0], vec![2.0]]).unwrap(),
            labels: vec![0, 1, 1],
        };
        assert_eq!(normal_rows(&split, 0).rows(), 3);
        assert_eq!(normal_rows(&split, 1).rows(), 2);
    }

    #[test]
    fn test_evaluate_results_names_classes_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        ResultsTable::new(vec![0, 1, 2, 2], vec![0, 1, 2, 1])
            .unwrap()
            .save(&path)
            .unwrap();
        let m = evaluate_results(&path, None).unwrap();
        assert_eq!(m.per_class.len(), 3);
        assert_eq!(m.per_class[2].label, "2");
        assert!((m.accuracy - 0.75).abs() < 1e-9);

        let named = vec!["BENIGN".to_string(), "DoS".to_string(), "PortScan".to_string()];
        let m = evaluate_results(&path, Some(named)).unwrap();
        assert_eq!(m.per_class[0].label, "BENIGN");
    }
}
