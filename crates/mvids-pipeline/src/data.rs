//! Stratified splitting and batch iteration.

use candle_core::{Device, Tensor};
use mvids_core::{FeatureMatrix, MvidsError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Rows and class ids of one partition.
#[derive(Debug, Clone)]
pub struct Split {
    pub features: FeatureMatrix,
    pub labels: Vec<usize>,
}

impl Split {
    fn gather(x: &FeatureMatrix, labels: &[usize], indices: &[usize]) -> Self {
        Self {
            features: x.select_rows(indices),
            labels: indices.iter().map(|&i| labels[i]).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Train/validation/test partitions and the source row of every sample.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train: Split,
    pub val: Split,
    pub test: Split,
    pub train_indices: Vec<usize>,
    pub val_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
}

/// Split `x` / `labels` preserving class ratios in every partition.
///
/// Each class is shuffled independently; `round(n * val_ratio)` of its rows
/// go to validation, `round(n * test_ratio)` to test and the rest to train.
/// Test takes precedence over validation when a class is too small for both.
///
/// # Errors
///
/// Returns [`MvidsError::Data`] if the label count differs from the rows or
/// the training partition would be empty, and [`MvidsError::Config`] if the
/// ratios are out of range.
pub fn stratified_split(
    x: &FeatureMatrix,
    labels: &[usize],
    val_ratio: f64,
    test_ratio: f64,
    seed: u64,
) -> Result<DataSplit> {
    if x.rows() != labels.len() {
        return Err(MvidsError::Data(format!(
            "split got {} rows and {} labels",
            x.rows(),
            labels.len()
        )));
    }
    if !(0.0..1.0).contains(&val_ratio)
        || !(0.0..1.0).contains(&test_ratio)
        || val_ratio + test_ratio >= 1.0
    {
        return Err(MvidsError::Config(format!(
            "split ratios must be in [0, 1) with a positive remainder \
             (val {val_ratio}, test {test_ratio})"
        )));
    }

    let num_classes = labels.iter().max().map_or(0, |m| m + 1);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (i, &l) in labels.iter().enumerate() {
        by_class[l].push(i);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train_indices = Vec::new();
    let mut val_indices = Vec::new();
    let mut test_indices = Vec::new();
    for rows in &mut by_class {
        rows.shuffle(&mut rng);
        let n = rows.len();
        let n_test = ((n as f64 * test_ratio).round() as usize).min(n);
        let n_val = ((n as f64 * val_ratio).round() as usize).min(n - n_test);
        test_indices.extend_from_slice(&rows[..n_test]);
        val_indices.extend_from_slice(&rows[n_test..n_test + n_val]);
        train_indices.extend_from_slice(&rows[n_test + n_val..]);
    }

    if train_indices.is_empty() {
        return Err(MvidsError::Data(
            "stratified split left no training samples".to_string(),
        ));
    }

    tracing::info!(
        train = train_indices.len(),
        val = val_indices.len(),
        test = test_indices.len(),
        classes = num_classes,
        "Stratified split"
    );

    Ok(DataSplit {
        train: Split::gather(x, labels, &train_indices),
        val: Split::gather(x, labels, &val_indices),
        test: Split::gather(x, labels, &test_indices),
        train_indices,
        val_indices,
        test_indices,
    })
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Mini-batch iterator over pre-loaded tensors. Reshuffles indices each epoch.
pub struct BatchIterator {
    inputs: Tensor,
    labels: Tensor,
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl BatchIterator {
    /// Iterate over the rows of `inputs` and the matching entries of `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `batch_size == 0` and
    /// [`MvidsError::Data`] if the row counts differ.
    pub fn new(inputs: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MvidsError::Config("batch_size must be > 0".to_string()));
        }
        let n = inputs
            .dim(0)
            .map_err(|e| MvidsError::Model(format!("batch inputs need rows: {e}")))?;
        let m = labels
            .dim(0)
            .map_err(|e| MvidsError::Model(format!("batch labels need rows: {e}")))?;
        if n != m {
            return Err(MvidsError::Data(format!(
                "{n} input rows but {m} labels"
            )));
        }
        Ok(Self {
            inputs,
            labels,
            indices: (0..n).collect(),
            batch_size,
            pos: 0,
        })
    }

    /// Number of samples per epoch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Row indices of the next mini-batch as a u32 tensor, or `None` once the
    /// epoch is exhausted.
    pub fn next_indices(&mut self) -> Result<Option<Tensor>> {
        let n = self.indices.len();
        if self.pos >= n {
            return Ok(None);
        }
        let end = (self.pos + self.batch_size).min(n);
        let batch_idx: Vec<u32> = self.indices[self.pos..end]
            .iter()
            .map(|&i| i as u32)
            .collect();
        self.pos = end;
        Tensor::new(batch_idx.as_slice(), self.inputs.device())
            .map(Some)
            .map_err(|e| MvidsError::Model(format!("batch index tensor: {e}")))
    }

    /// Returns the next mini-batch, or `None` if the epoch is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<(Tensor, Tensor)>> {
        let Some(idx) = self.next_indices()? else {
            return Ok(None);
        };
        let batch = self.select(&idx)?;
        Ok(Some(batch))
    }

    /// Inputs and labels at `idx`.
    pub fn select(&self, idx: &Tensor) -> Result<(Tensor, Tensor)> {
        let inputs = self
            .inputs
            .index_select(idx, 0)
            .map_err(|e| MvidsError::Model(format!("index_select inputs: {e}")))?;
        let labels = self
            .labels
            .index_select(idx, 0)
            .map_err(|e| MvidsError::Model(format!("index_select labels: {e}")))?;
        Ok((inputs, labels))
    }
}

/// Consecutive row ranges of at most `batch_size` rows covering `0..n`.
///
/// Used for inference passes that must not materialise the whole set at once.
pub fn chunk_ranges(n: usize, batch_size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    let step = batch_size.max(1);
    (0..n).step_by(step).map(move |start| start..(start + step).min(n))
}

/// Rows `range` of `x` as a tensor on `device`.
pub fn rows_to_tensor(
    x: &FeatureMatrix,
    range: std::ops::Range<usize>,
    device: &Device,
) -> Result<Tensor> {
    let cols = x.cols();
    let data = &x.as_slice()[range.start * cols..range.end * cols];
    Tensor::from_slice(data, (range.len(), cols), device)
        .map_err(|e| MvidsError::Model(format!("Failed to create batch tensor: {e}")))
}
