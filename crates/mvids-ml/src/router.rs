//! Per-sample classifier router.
//!
//! # Architecture
//!
//! ```text
//! x [B, F] → Linear(H) → ReLU → Dropout → Linear(H/2) → ReLU → Linear(4) → Softmax
//! ```
//!
//! The router has no supervised target of its own. It is trained through the
//! ensemble loss: gradients flow from the cross-entropy of the combined
//! distribution back through the weighted sum in
//! [`crate::ensemble::EnsembleCombiner::combine`].

use candle_core::{Module, Tensor, D};
use candle_nn::{Dropout, Linear, VarBuilder};
use mvids_core::{MvidsError, Result};

use crate::bank::NUM_CLASSIFIERS;
use crate::tensor::{check_input_width, model_err};

/// Feed-forward gating network over the classifier bank.
pub struct Router {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
    dropout: Dropout,
    input_dim: usize,
}

impl Router {
    /// Build a router for `input_dim` features.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `input_dim == 0` or `hidden < 2`.
    pub fn new(input_dim: usize, hidden: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if input_dim == 0 || hidden < 2 {
            return Err(MvidsError::Config(format!(
                "router needs input_dim > 0 and hidden >= 2 (got {input_dim}, {hidden})"
            )));
        }
        let build = |e: candle_core::Error| MvidsError::Config(format!("Failed to build router: {e}"));
        Ok(Self {
            fc1: candle_nn::linear(input_dim, hidden, vb.pp("fc1")).map_err(build)?,
            fc2: candle_nn::linear(hidden, hidden / 2, vb.pp("fc2")).map_err(build)?,
            out: candle_nn::linear(hidden / 2, NUM_CLASSIFIERS, vb.pp("out")).map_err(build)?,
            dropout: Dropout::new(dropout),
            input_dim,
        })
    }

    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Router weights `[B, 4]` for `x: [B, input_dim]`; each row sums to 1.
    pub fn route(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_input_width("router", x, self.input_dim)?;
        self.forward(x, train).map_err(model_err("Router forward failed"))
    }

    fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(x)?.relu()?.apply_t(&self.dropout, train)?;
        let h = self.fc2.forward(&h)?.relu()?;
        candle_nn::ops::softmax(&self.out.forward(&h)?, D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ParamBundle;
    use candle_core::Device;

    #[test]
    fn test_router_weights_are_distributions() {
        let bundle = ParamBundle::new("router", &Device::Cpu);
        let router = Router::new(20, 16, 0.1, bundle.var_builder()).unwrap();
        let x = Tensor::randn(0f32, 3.0, (50, 20), &Device::Cpu).unwrap();
        let weights: Vec<Vec<f32>> = router.route(&x, false).unwrap().to_vec2().unwrap();
        assert_eq!(weights.len(), 50);
        for row in weights {
            assert_eq!(row.len(), NUM_CLASSIFIERS);
            mvids_core::validate_distribution("router weights", &row).unwrap();
        }
    }

    #[test]
    fn test_router_rejects_wrong_width() {
        let bundle = ParamBundle::new("router", &Device::Cpu);
        let router = Router::new(20, 16, 0.0, bundle.var_builder()).unwrap();
        let x = Tensor::zeros((1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            router.route(&x, false),
            Err(MvidsError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_router_rejects_tiny_hidden() {
        let bundle = ParamBundle::new("router", &Device::Cpu);
        assert!(Router::new(20, 1, 0.0, bundle.var_builder()).is_err());
    }
}
