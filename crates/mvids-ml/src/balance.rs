//! Minority-class balancing.
//!
//! [`balance`] brings every class up to a target count with synthetic
//! samples from a [`SampleSynthesizer`], after a quality filter. Classes with
//! fewer than `min_samples` real samples are too small to synthesise from:
//! they are skipped with a warning and kept exactly as they are.
//!
//! Original samples are never modified or reordered; synthetic samples are
//! appended after them.

use mvids_core::config::BalancingConfig;
use mvids_core::{FeatureMatrix, MvidsError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Produces synthetic feature vectors resembling a set of real ones.
pub trait SampleSynthesizer {
    /// Generate `count` rows statistically similar to `samples`.
    ///
    /// # Errors
    ///
    /// Implementations fail if `samples` cannot support synthesis.
    fn synthesize(&mut self, samples: &FeatureMatrix, count: usize) -> Result<FeatureMatrix>;
}

/// Interpolates between random pairs of real samples and adds Gaussian
/// jitter.
pub struct InterpolatingSynthesizer {
    rng: ChaCha8Rng,
    jitter: Normal<f32>,
}

impl InterpolatingSynthesizer {
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `jitter_std` is negative or NaN.
    pub fn new(seed: u64, jitter_std: f32) -> Result<Self> {
        if !(jitter_std >= 0.0 && jitter_std.is_finite()) {
            return Err(MvidsError::Config(format!(
                "jitter_std must be finite and non-negative, got {jitter_std}"
            )));
        }
        let jitter = Normal::new(0.0, jitter_std)
            .map_err(|e| MvidsError::Config(format!("invalid jitter_std {jitter_std}: {e}")))?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            jitter,
        })
    }
}

impl SampleSynthesizer for InterpolatingSynthesizer {
    fn synthesize(&mut self, samples: &FeatureMatrix, count: usize) -> Result<FeatureMatrix> {
        if samples.rows() == 0 {
            return Err(MvidsError::Data(
                "cannot synthesise from an empty sample set".to_string(),
            ));
        }
        let mut out = FeatureMatrix::empty(samples.cols());
        let mut row = vec![0.0f32; samples.cols()];
        for _ in 0..count {
            let a = samples.row(self.rng.gen_range(0..samples.rows()));
            let b = samples.row(self.rng.gen_range(0..samples.rows()));
            let t: f32 = self.rng.gen();
            for ((v, &x), &y) in row.iter_mut().zip(a).zip(b) {
                *v = x + t * (y - x) + self.jitter.sample(&mut self.rng);
            }
            out.push_row(&row)?;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Quality filter
// ---------------------------------------------------------------------------

/// Keep the synthetic rows that look like `reference`.
///
/// A row is rejected if any value is non-finite or its mean absolute z-score
/// against the reference columns exceeds `max_z`. Columns that are constant
/// in the reference do not count towards the mean. Returns the kept rows and
/// the number rejected.
pub fn quality_filter(
    reference: &FeatureMatrix,
    synthetic: &FeatureMatrix,
    max_z: f32,
) -> Result<(FeatureMatrix, usize)> {
    synthetic.expect_cols("quality filter", reference.cols())?;
    let n = reference.rows().max(1) as f64;
    let stats: Vec<(f64, f64)> = (0..reference.cols())
        .map(|c| {
            let mean = (0..reference.rows()).map(|r| f64::from(reference.get(r, c))).sum::<f64>() / n;
            let var = (0..reference.rows())
                .map(|r| (f64::from(reference.get(r, c)) - mean).powi(2))
                .sum::<f64>()
                / n;
            (mean, var.sqrt())
        })
        .collect();

    let mut kept = FeatureMatrix::empty(synthetic.cols());
    let mut rejected = 0;
    for row in synthetic.iter_rows() {
        if row.iter().any(|v| !v.is_finite()) {
            rejected += 1;
            continue;
        }
        let (z_sum, counted) = row
            .iter()
            .zip(&stats)
            .filter(|(_, (_, std))| *std > f64::from(f32::EPSILON))
            .fold((0.0, 0usize), |(sum, k), (&v, (mean, std))| {
                (sum + (f64::from(v) - mean).abs() / std, k + 1)
            });
        let mean_z = if counted == 0 { 0.0 } else { z_sum / counted as f64 };
        if mean_z > f64::from(max_z) {
            rejected += 1;
        } else {
            kept.push_row(row)?;
        }
    }
    Ok((kept, rejected))
}

// ---------------------------------------------------------------------------
// Balancing
// ---------------------------------------------------------------------------

/// What happened to one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassBalance {
    pub label: usize,
    /// Real samples before balancing.
    pub original: usize,
    /// Synthetic samples that passed the quality filter.
    pub generated: usize,
    /// Synthetic samples dropped by the quality filter.
    pub rejected: usize,
    /// Whether the class was below `min_samples` and left untouched.
    pub skipped: bool,
}

/// Per-class outcome of [`balance`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub classes: Vec<ClassBalance>,
}

impl BalanceReport {
    #[must_use]
    pub fn total_generated(&self) -> usize {
        self.classes.iter().map(|c| c.generated).sum()
    }

    /// Labels of the classes that were skipped.
    #[must_use]
    pub fn skipped(&self) -> Vec<usize> {
        self.classes
            .iter()
            .filter(|c| c.skipped)
            .map(|c| c.label)
            .collect()
    }
}

/// A balanced training set.
#[derive(Debug, Clone)]
pub struct Balanced {
    pub features: FeatureMatrix,
    pub labels: Vec<usize>,
    pub report: BalanceReport,
}

/// Balance `x` / `labels` over `num_classes` classes.
///
/// With `config.enabled == false` the data is returned unchanged with an
/// empty report.
///
/// # Errors
///
/// Returns [`MvidsError::Data`] if the label count differs from the rows or
/// a label is out of range, and propagates synthesizer failures.
pub fn balance(
    x: &FeatureMatrix,
    labels: &[usize],
    num_classes: usize,
    config: &BalancingConfig,
    synthesizer: &mut dyn SampleSynthesizer,
) -> Result<Balanced> {
    if x.rows() != labels.len() {
        return Err(MvidsError::Data(format!(
            "balancing got {} rows and {} labels",
            x.rows(),
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(MvidsError::Data(format!("label {bad} out of range")));
    }

    let mut features = x.clone();
    let mut out_labels = labels.to_vec();
    let mut report = BalanceReport::default();
    if !config.enabled {
        return Ok(Balanced {
            features,
            labels: out_labels,
            report,
        });
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (i, &l) in labels.iter().enumerate() {
        members[l].push(i);
    }
    let target = config
        .target_count
        .unwrap_or_else(|| members.iter().map(Vec::len).max().unwrap_or(0));

    for (label, rows) in members.iter().enumerate() {
        let mut entry = ClassBalance {
            label,
            original: rows.len(),
            generated: 0,
            rejected: 0,
            skipped: false,
        };
        if rows.len() >= target {
            report.classes.push(entry);
            continue;
        }
        if rows.len() < config.min_samples {
            tracing::warn!(
                class = label,
                samples = rows.len(),
                min_samples = config.min_samples,
                "Class below minimum sample floor, skipping synthesis"
            );
            entry.skipped = true;
            report.classes.push(entry);
            continue;
        }

        let real = x.select_rows(rows);
        let synthetic = synthesizer.synthesize(&real, target - rows.len())?;
        let (kept, rejected) = quality_filter(&real, &synthetic, config.quality_max_z)?;
        entry.generated = kept.rows();
        entry.rejected = rejected;
        features.extend(&kept)?;
        out_labels.extend(std::iter::repeat(label).take(kept.rows()));

        tracing::info!(
            class = label,
            original = rows.len(),
            generated = entry.generated,
            rejected,
            "Class balanced"
        );
        report.classes.push(entry);
    }

    Ok(Balanced {
        features,
        labels: out_labels,
        report,
    })
}
