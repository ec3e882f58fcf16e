//! Training loops with early stopping.
//!
//! Every neural model is trained the same way: AdamW over the parameters of
//! its [`ParamBundle`], a per-epoch reshuffle seeded with `seed + epoch`, and
//! early stopping on the validation loss. The best epoch is snapshotted and
//! restored into the bundle when training ends.

use candle_core::{Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use mvids_core::config::TrainingConfig;
use mvids_core::{FeatureMatrix, MvidsError, Result, EPSILON};
use mvids_ml::tensor::{labels_to_tensor, matrix_to_tensor, tensor_to_matrix};
use mvids_ml::{ClassifierOutput, EnsembleCombiner, LogitModel, ParamBundle, Router};
use serde::Serialize;

use crate::data::{chunk_ranges, rows_to_tensor, BatchIterator, Split};

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Summary of one training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub name: String,
    pub history: Vec<EpochMetrics>,
    /// 1-based epoch whose parameters were kept.
    pub best_epoch: usize,
    pub best_val_loss: f64,
    /// Bundle version after restoring the best epoch.
    pub version: u64,
}

fn candle_err(context: &'static str) -> impl Fn(candle_core::Error) -> MvidsError {
    move |e| MvidsError::Model(format!("{context}: {e}"))
}

fn optimizer(bundle: &ParamBundle, config: &TrainingConfig) -> Result<AdamW> {
    AdamW::new(
        bundle.varmap().all_vars(),
        ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )
    .map_err(candle_err("Failed to create optimizer"))
}

/// Tracks the best validation loss and the patience counter.
struct EarlyStopping {
    best_val_loss: f64,
    best_epoch: usize,
    best: Option<ParamBundle>,
    patience: usize,
    counter: usize,
}

impl EarlyStopping {
    fn new(patience: usize) -> Self {
        Self {
            best_val_loss: f64::MAX,
            best_epoch: 0,
            best: None,
            patience,
            counter: 0,
        }
    }

    /// Record an epoch; returns whether it improved on the best loss.
    fn observe(&mut self, epoch: usize, val_loss: f64, bundle: &ParamBundle) -> Result<bool> {
        if val_loss < self.best_val_loss {
            self.best_val_loss = val_loss;
            self.best_epoch = epoch;
            self.best = Some(bundle.snapshot()?);
            self.counter = 0;
            Ok(true)
        } else {
            self.counter += 1;
            Ok(false)
        }
    }

    fn exhausted(&self) -> bool {
        self.counter >= self.patience
    }

    fn finish(
        self,
        name: &str,
        bundle: &mut ParamBundle,
        history: Vec<EpochMetrics>,
    ) -> Result<TrainOutcome> {
        if let Some(best) = &self.best {
            bundle.restore(best)?;
        }
        tracing::info!(
            model = name,
            best_epoch = self.best_epoch,
            best_val_loss = self.best_val_loss,
            version = bundle.version(),
            "Training finished"
        );
        Ok(TrainOutcome {
            name: name.to_string(),
            history,
            best_epoch: self.best_epoch,
            best_val_loss: self.best_val_loss,
            version: bundle.version(),
        })
    }
}

fn log_epoch(name: &str, metrics: &EpochMetrics, improved: bool) {
    let marker = if improved { "*" } else { "" };
    tracing::info!(
        model = name,
        epoch = metrics.epoch,
        train_loss = %format!("{:.4}", metrics.train_loss),
        val_loss = %format!("{:.4}", metrics.val_loss),
        val_accuracy = %format!("{:.4}", metrics.val_accuracy),
        marker,
        "Epoch complete"
    );
}

// ---------------------------------------------------------------------------
// Logit models
// ---------------------------------------------------------------------------

/// Train `model`, whose parameters live in `bundle`, with cross-entropy.
///
/// With an empty validation split the training loss drives early stopping.
///
/// # Errors
///
/// Returns [`MvidsError::Data`] if the training split is empty and
/// propagates model failures.
pub fn train_logit_model<M: LogitModel>(
    name: &str,
    model: &M,
    bundle: &mut ParamBundle,
    train: &Split,
    val: &Split,
    config: &TrainingConfig,
    seed: u64,
) -> Result<TrainOutcome> {
    if train.is_empty() {
        return Err(MvidsError::Data(format!("{name}: no training samples")));
    }
    let device = bundle.device().clone();
    let inputs = matrix_to_tensor(&train.features, &device)?;
    let labels = labels_to_tensor(&train.labels, &device)?;
    let mut batches = BatchIterator::new(inputs, labels, config.batch_size)?;
    let mut opt = optimizer(bundle, config)?;
    let mut stopping = EarlyStopping::new(config.patience);
    let mut history = Vec::new();

    tracing::info!(
        model = name,
        samples = train.len(),
        parameters = bundle.num_parameters()?,
        lr = config.lr,
        weight_decay = config.weight_decay,
        batch_size = config.batch_size,
        epochs = config.epochs,
        patience = config.patience,
        "Training started"
    );

    for epoch in 0..config.epochs {
        batches.reshuffle(seed, epoch);
        let mut epoch_loss = 0.0;
        let mut batch_count = 0usize;

        while let Some((x, y)) = batches.next_batch()? {
            let logits = model.forward_logits(&x, true)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &y)
                .map_err(candle_err("Loss computation failed"))?;
            opt.backward_step(&loss)
                .map_err(candle_err("Backward step failed"))?;
            let loss_val = loss
                .to_scalar::<f32>()
                .map_err(candle_err("Loss scalar failed"))?;
            epoch_loss += f64::from(loss_val);
            batch_count += 1;
        }
        bundle.bump_version();

        let train_loss = epoch_loss / batch_count.max(1) as f64;
        let (val_loss, val_accuracy) = if val.is_empty() {
            (train_loss, 0.0)
        } else {
            evaluate_logit_model(model, val, config.batch_size, &device)?
        };

        let improved = stopping.observe(epoch + 1, val_loss, bundle)?;
        let metrics = EpochMetrics {
            epoch: epoch + 1,
            train_loss,
            val_loss,
            val_accuracy,
        };
        log_epoch(name, &metrics, improved);
        history.push(metrics);

        if stopping.exhausted() {
            tracing::info!(
                model = name,
                epoch = epoch + 1,
                patience = config.patience,
                "Early stopping"
            );
            break;
        }
    }

    stopping.finish(name, bundle, history)
}

/// Mean cross-entropy and accuracy of `model` on `split`, scored in chunks
/// of `batch_size` rows.
pub fn evaluate_logit_model<M: LogitModel>(
    model: &M,
    split: &Split,
    batch_size: usize,
    device: &Device,
) -> Result<(f64, f64)> {
    let mut total_loss = 0.0;
    let mut correct = 0usize;
    for range in chunk_ranges(split.len(), batch_size) {
        let x = rows_to_tensor(&split.features, range.clone(), device)?;
        let y = labels_to_tensor(&split.labels[range.clone()], device)?;
        let logits = model.forward_logits(&x, false)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &y)
            .and_then(|l| l.to_scalar::<f32>())
            .map_err(candle_err("Validation loss failed"))?;
        total_loss += f64::from(loss) * range.len() as f64;

        let preds: Vec<u32> = logits
            .argmax(D::Minus1)
            .and_then(|p| p.to_vec1())
            .map_err(candle_err("argmax failed"))?;
        correct += preds
            .iter()
            .zip(&split.labels[range])
            .filter(|(p, l)| **p as usize == **l)
            .count();
    }
    let n = split.len().max(1) as f64;
    Ok((total_loss / n, correct as f64 / n))
}

/// Logits of `model` for every row of `x`, computed in chunks.
pub fn predict_logits<M: LogitModel>(
    model: &M,
    x: &FeatureMatrix,
    batch_size: usize,
    device: &Device,
) -> Result<FeatureMatrix> {
    let mut out = FeatureMatrix::empty(model.num_classes());
    for range in chunk_ranges(x.rows(), batch_size) {
        let logits = model.forward_logits(&rows_to_tensor(x, range, device)?, false)?;
        out.extend(&tensor_to_matrix(&logits)?)?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Negative log-likelihood of `labels` under the fused scores.
///
/// The fused scores are not renormalised; the epsilon keeps fully masked
/// rows finite.
fn ensemble_loss(fused: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let log_p = (fused + EPSILON)?.log()?;
    candle_nn::loss::nll(&log_p, labels)
}

fn select_outputs(outputs: &[ClassifierOutput], idx: &Tensor) -> Result<Vec<ClassifierOutput>> {
    outputs
        .iter()
        .map(|o| {
            Ok(ClassifierOutput {
                kind: o.kind,
                probabilities: o
                    .probabilities
                    .index_select(idx, 0)
                    .map_err(candle_err("index_select probabilities"))?,
                confidence: o
                    .confidence
                    .index_select(idx, 0)
                    .map_err(candle_err("index_select confidence"))?,
            })
        })
        .collect()
}

/// Precomputed bank outputs for one partition.
pub struct RouterSplit<'a> {
    pub split: &'a Split,
    /// One output per classifier, covering every row of `split`.
    pub outputs: &'a [ClassifierOutput],
}

/// Train the router through the ensemble loss.
///
/// Classifier probabilities are constants here; only the router's
/// parameters receive gradients, flowing through
/// [`EnsembleCombiner::combine`].
pub fn train_router(
    router: &Router,
    bundle: &mut ParamBundle,
    combiner: &EnsembleCombiner,
    train: RouterSplit<'_>,
    val: RouterSplit<'_>,
    config: &TrainingConfig,
    seed: u64,
) -> Result<TrainOutcome> {
    const NAME: &str = "router";
    if train.split.is_empty() {
        return Err(MvidsError::Data("router: no training samples".to_string()));
    }
    let device = bundle.device().clone();
    let inputs = matrix_to_tensor(&train.split.features, &device)?;
    let labels = labels_to_tensor(&train.split.labels, &device)?;
    let mut batches = BatchIterator::new(inputs, labels, config.batch_size)?;
    let mut opt = optimizer(bundle, config)?;
    let mut stopping = EarlyStopping::new(config.patience);
    let mut history = Vec::new();

    let val_inputs = matrix_to_tensor(&val.split.features, &device)?;
    let val_labels = labels_to_tensor(&val.split.labels, &device)?;

    for epoch in 0..config.epochs {
        batches.reshuffle(seed, epoch);
        let mut epoch_loss = 0.0;
        let mut batch_count = 0usize;

        while let Some(idx) = batches.next_indices()? {
            let (x, y) = batches.select(&idx)?;
            let outputs = select_outputs(train.outputs, &idx)?;
            let weights = router.route(&x, true)?;
            let fused = combiner.combine(&outputs, &weights)?;
            let loss = ensemble_loss(&fused, &y).map_err(candle_err("Ensemble loss failed"))?;
            opt.backward_step(&loss)
                .map_err(candle_err("Backward step failed"))?;
            let loss_val = loss
                .to_scalar::<f32>()
                .map_err(candle_err("Loss scalar failed"))?;
            epoch_loss += f64::from(loss_val);
            batch_count += 1;
        }
        bundle.bump_version();

        let train_loss = epoch_loss / batch_count.max(1) as f64;
        let (val_loss, val_accuracy) = if val.split.is_empty() {
            (train_loss, 0.0)
        } else {
            let weights = router.route(&val_inputs, false)?;
            let fused = combiner.combine(val.outputs, &weights)?;
            let loss = ensemble_loss(&fused, &val_labels)
                .and_then(|l| l.to_scalar::<f32>())
                .map_err(candle_err("Validation loss failed"))?;
            let preds: Vec<u32> = fused
                .argmax(D::Minus1)
                .and_then(|p| p.to_vec1())
                .map_err(candle_err("argmax failed"))?;
            let correct = preds
                .iter()
                .zip(&val.split.labels)
                .filter(|(p, l)| **p as usize == **l)
                .count();
            (f64::from(loss), correct as f64 / val.split.len() as f64)
        };

        let improved = stopping.observe(epoch + 1, val_loss, bundle)?;
        let metrics = EpochMetrics {
            epoch: epoch + 1,
            train_loss,
            val_loss,
            val_accuracy,
        };
        log_epoch(NAME, &metrics, improved);
        history.push(metrics);

        if stopping.exhausted() {
            tracing::info!(model = NAME, epoch = epoch + 1, "Early stopping");
            break;
        }
    }

    stopping.finish(NAME, bundle, history)
}
