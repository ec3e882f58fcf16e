//! Cross-view attention fusion.
//!
//! # Architecture
//!
//! ```text
//! [e_global ‖ e_temporal ‖ e_protocol]
//!     → Linear(hidden) → ReLU → Dropout
//!     → Linear(hidden/2) → ReLU → Dropout
//!     → Linear(3) → Softmax                       = attention weights a
//! [a_0·e_global ‖ a_1·e_temporal ‖ a_2·e_protocol]
//!     → Linear(max view width)                    = fused embedding
//! ```
//!
//! A near-uniform `a` means every view contributes about equally; that is a
//! valid outcome, not a failure.

use candle_core::{Module, Tensor, D};
use candle_nn::{Dropout, Linear, VarBuilder};
use mvids_core::{MvidsError, Result};

use crate::tensor::{check_input_width, model_err};

/// Output of [`CrossViewFusion::fuse`].
#[derive(Debug, Clone)]
pub struct FusionOutput {
    /// Fused embedding, `[B, output_dim]`.
    pub fused: Tensor,
    /// Per-sample view weights, `[B, num_views]`; each row sums to 1.
    pub weights: Tensor,
}

/// Learns per-sample view weights and combines the weighted view embeddings.
pub struct CrossViewFusion {
    attn1: Linear,
    attn2: Linear,
    attn_out: Linear,
    dropout: Dropout,
    output: Linear,
    view_dims: Vec<usize>,
    output_dim: usize,
}

impl CrossViewFusion {
    /// Build a fusion layer for views of the given widths.
    ///
    /// # Arguments
    ///
    /// * `view_dims` - Embedding width of each view, in fusion order
    /// * `hidden` - Width of the first attention hidden layer (the second is half)
    /// * `dropout` - Dropout probability inside the attention network
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if there are no views, a width is zero
    /// or `hidden < 2`.
    pub fn new(view_dims: &[usize], hidden: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if view_dims.is_empty() || view_dims.contains(&0) {
            return Err(MvidsError::Config(format!(
                "fusion needs at least one view with positive width, got {view_dims:?}"
            )));
        }
        if hidden < 2 {
            return Err(MvidsError::Config(format!(
                "fusion hidden width must be at least 2, got {hidden}"
            )));
        }
        let concat_dim: usize = view_dims.iter().sum();
        let output_dim = view_dims.iter().copied().max().unwrap_or_default();
        let build = |e: candle_core::Error| MvidsError::Config(format!("Failed to build fusion: {e}"));

        Ok(Self {
            attn1: candle_nn::linear(concat_dim, hidden, vb.pp("attn1")).map_err(build)?,
            attn2: candle_nn::linear(hidden, hidden / 2, vb.pp("attn2")).map_err(build)?,
            attn_out: candle_nn::linear(hidden / 2, view_dims.len(), vb.pp("attn_out"))
                .map_err(build)?,
            dropout: Dropout::new(dropout),
            output: candle_nn::linear(concat_dim, output_dim, vb.pp("output")).map_err(build)?,
            view_dims: view_dims.to_vec(),
            output_dim,
        })
    }

    /// Number of views this layer fuses.
    #[must_use]
    pub fn num_views(&self) -> usize {
        self.view_dims.len()
    }

    /// Width of the fused embedding (the largest view width).
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Fuse one embedding batch per view.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if the number of views is wrong and
    /// [`MvidsError::DimensionMismatch`] if a view has the wrong width.
    pub fn fuse(&self, views: &[Tensor], train: bool) -> Result<FusionOutput> {
        if views.len() != self.view_dims.len() {
            return Err(MvidsError::Config(format!(
                "fusion expects {} views, got {}",
                self.view_dims.len(),
                views.len()
            )));
        }
        for (view, &dim) in views.iter().zip(&self.view_dims) {
            check_input_width("fusion", view, dim)?;
        }
        self.forward(views, train)
            .map_err(model_err("Fusion forward failed"))
    }

    fn forward(&self, views: &[Tensor], train: bool) -> candle_core::Result<FusionOutput> {
        let concat = Tensor::cat(views, 1)?;

        let h = self.attn1.forward(&concat)?.relu()?.apply_t(&self.dropout, train)?;
        let h = self.attn2.forward(&h)?.relu()?.apply_t(&self.dropout, train)?;
        let weights = candle_nn::ops::softmax(&self.attn_out.forward(&h)?, D::Minus1)?;

        let scaled = views
            .iter()
            .enumerate()
            .map(|(i, view)| view.broadcast_mul(&weights.narrow(1, i, 1)?))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let fused = self.output.forward(&Tensor::cat(&scaled, 1)?)?;

        Ok(FusionOutput { fused, weights })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn fusion(varmap: &VarMap) -> CrossViewFusion {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CrossViewFusion::new(&[16, 16, 8], 32, 0.1, vb).unwrap()
    }

    fn views(batch: usize) -> Vec<Tensor> {
        [16, 16, 8]
            .iter()
            .map(|&d| Tensor::randn(0f32, 1.0, (batch, d), &Device::Cpu).unwrap())
            .collect()
    }

    #[test]
    fn test_attention_weights_are_distributions() {
        let varmap = VarMap::new();
        let fusion = fusion(&varmap);
        let out = fusion.fuse(&views(10), false).unwrap();
        let weights: Vec<Vec<f32>> = out.weights.to_vec2().unwrap();
        assert_eq!(weights.len(), 10);
        for row in weights {
            assert_eq!(row.len(), 3);
            mvids_core::validate_distribution("attention weights", &row).unwrap();
        }
    }

    #[test]
    fn test_fused_width_independent_of_batch_size() {
        let varmap = VarMap::new();
        let fusion = fusion(&varmap);
        assert_eq!(fusion.output_dim(), 16);
        for batch in [1, 3, 17] {
            let out = fusion.fuse(&views(batch), true).unwrap();
            assert_eq!(out.fused.dims(), &[batch, 16]);
            assert_eq!(out.weights.dims(), &[batch, 3]);
        }
    }

    #[test]
    fn test_fuse_rejects_wrong_view_count() {
        let varmap = VarMap::new();
        let fusion = fusion(&varmap);
        let mut v = views(2);
        v.pop();
        assert!(matches!(fusion.fuse(&v, false), Err(MvidsError::Config(_))));
    }

    #[test]
    fn test_fuse_rejects_wrong_view_width() {
        let varmap = VarMap::new();
        let fusion = fusion(&varmap);
        let mut v = views(2);
        v[2] = Tensor::zeros((2, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            fusion.fuse(&v, false),
            Err(MvidsError::DimensionMismatch {
                expected: 8,
                actual: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_new_rejects_empty_views() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(CrossViewFusion::new(&[], 32, 0.0, vb).is_err());
    }
}
