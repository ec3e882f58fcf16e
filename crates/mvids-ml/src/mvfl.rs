//! Multi-view feature learning (MVFL) encoder.
//!
//! Runs the three [`FeatureView`]s, fuses their embeddings with
//! [`CrossViewFusion`] and, for training, puts a linear classification head
//! on the fused embedding.
//!
//! # Architecture
//!
//! ```text
//! x [B, F] ─┬─ GlobalView   → [B, D]   ─┐
//!           ├─ TemporalView → [B, D]   ─┼─ CrossViewFusion → fused [B, D] → Linear(C)
//!           └─ ProtocolView → [B, D/2] ─┘                  → weights [B, 3]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use mvids_core::config::MvflConfig;
use mvids_core::{MvidsError, Result};

use crate::bank::LogitModel;
use crate::fusion::{CrossViewFusion, FusionOutput};
use crate::tensor::{check_input_width, model_err};
use crate::views::{build_views, FeatureView};

/// Views, fusion and classification head.
pub struct MvflEncoder {
    views: Vec<Box<dyn FeatureView>>,
    fusion: CrossViewFusion,
    head: Linear,
    input_dim: usize,
    num_classes: usize,
}

impl MvflEncoder {
    /// Build an encoder for `input_dim` features and `num_classes` classes.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if the configuration is invalid or
    /// `num_classes < 2`.
    pub fn new(
        input_dim: usize,
        num_classes: usize,
        config: &MvflConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(MvidsError::Config(format!(
                "MVFL head needs at least 2 classes, got {num_classes}"
            )));
        }
        let views = build_views(input_dim, config, &vb)?;
        let view_dims: Vec<usize> = views.iter().map(|v| v.output_dim()).collect();
        let fusion = CrossViewFusion::new(
            &view_dims,
            config.fusion_hidden,
            config.dropout,
            vb.pp("fusion"),
        )?;
        let head = candle_nn::linear(fusion.output_dim(), num_classes, vb.pp("head"))
            .map_err(|e| MvidsError::Config(format!("Failed to build MVFL head: {e}")))?;

        tracing::debug!(
            input_dim,
            num_classes,
            fusion_dim = fusion.output_dim(),
            "MVFL encoder built"
        );

        Ok(Self {
            views,
            fusion,
            head,
            input_dim,
            num_classes,
        })
    }

    /// The views, in fusion order.
    #[must_use]
    pub fn views(&self) -> &[Box<dyn FeatureView>] {
        &self.views
    }

    /// Width of the fused embedding.
    #[must_use]
    pub fn fusion_dim(&self) -> usize {
        self.fusion.output_dim()
    }

    /// Embed `x` with every view.
    pub fn embed_views(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        check_input_width("MVFL encoder", x, self.input_dim)?;
        self.views.iter().map(|v| v.embed(x, train)).collect()
    }

    /// Fused embedding and view attention weights for `x`.
    pub fn encode(&self, x: &Tensor, train: bool) -> Result<FusionOutput> {
        let embeddings = self.embed_views(x, train)?;
        self.fusion.fuse(&embeddings, train)
    }
}

impl LogitModel for MvflEncoder {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_logits(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.encode(x, train)?;
        self.head
            .forward(&out.fused)
            .map_err(model_err("MVFL head forward failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ParamBundle;
    use candle_core::Device;

    fn config() -> MvflConfig {
        MvflConfig {
            embed_dim: 16,
            num_heads: 2,
            num_layers: 1,
            window: 3,
            noise_std: 0.05,
            dropout: 0.0,
            fusion_hidden: 16,
        }
    }

    #[test]
    fn test_encode_shapes() {
        let bundle = ParamBundle::new("mvfl", &Device::Cpu);
        let encoder = MvflEncoder::new(20, 3, &config(), bundle.var_builder()).unwrap();
        let x = Tensor::randn(0f32, 1.0, (7, 20), &Device::Cpu).unwrap();

        let out = encoder.encode(&x, false).unwrap();
        assert_eq!(out.fused.dims(), &[7, 16]);
        assert_eq!(out.weights.dims(), &[7, 3]);
        assert_eq!(encoder.forward_logits(&x, true).unwrap().dims(), &[7, 3]);
        assert!(bundle.num_parameters().unwrap() > 0);
    }

    #[test]
    fn test_encoder_rejects_single_class() {
        let bundle = ParamBundle::new("mvfl", &Device::Cpu);
        assert!(MvflEncoder::new(20, 1, &config(), bundle.var_builder()).is_err());
    }

    #[test]
    fn test_encoder_rejects_wrong_width() {
        let bundle = ParamBundle::new("mvfl", &Device::Cpu);
        let encoder = MvflEncoder::new(20, 3, &config(), bundle.var_builder()).unwrap();
        let x = Tensor::zeros((2, 21), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            encoder.encode(&x, false),
            Err(MvidsError::DimensionMismatch { .. })
        ));
    }
}
