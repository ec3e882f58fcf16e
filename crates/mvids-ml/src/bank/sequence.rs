//! Bidirectional LSTM classifier.
//!
//! # Architecture
//!
//! ```text
//! x [B, F] → Linear(H) → ReLU → as sequence [B, 1, H]
//!          → LSTM forward  ─┐
//!          → LSTM backward ─┴→ [h_fwd ‖ h_bwd] [B, 2H] → Dropout → Linear(C)
//! ```
//!
//! Each record is a length-1 sequence, so both directions read the same
//! step; they still carry independent weights.

use candle_core::{Module, Tensor};
use candle_nn::{Dropout, LSTMConfig, Linear, VarBuilder, LSTM, RNN};
use mvids_core::{MvidsError, Result};

use super::LogitModel;
use crate::tensor::{check_input_width, model_err};

/// Projection, bidirectional LSTM and linear head.
pub struct SequenceClassifier {
    proj: Linear,
    forward_lstm: LSTM,
    backward_lstm: LSTM,
    dropout: Dropout,
    head: Linear,
    input_dim: usize,
    num_classes: usize,
}

impl SequenceClassifier {
    /// Build a classifier with hidden width `hidden`.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if a width is zero or `num_classes < 2`.
    pub fn new(
        input_dim: usize,
        hidden: usize,
        num_classes: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if input_dim == 0 || hidden == 0 || num_classes < 2 {
            return Err(MvidsError::Config(format!(
                "sequence classifier needs positive widths and 2+ classes \
                 (input {input_dim}, hidden {hidden}, classes {num_classes})"
            )));
        }
        let build =
            |e: candle_core::Error| MvidsError::Config(format!("Failed to build sequence classifier: {e}"));
        Ok(Self {
            proj: candle_nn::linear(input_dim, hidden, vb.pp("proj")).map_err(build)?,
            forward_lstm: candle_nn::lstm(hidden, hidden, LSTMConfig::default(), vb.pp("lstm_fwd"))
                .map_err(build)?,
            backward_lstm: candle_nn::lstm(hidden, hidden, LSTMConfig::default(), vb.pp("lstm_bwd"))
                .map_err(build)?,
            dropout: Dropout::new(dropout),
            head: candle_nn::linear(2 * hidden, num_classes, vb.pp("head")).map_err(build)?,
            input_dim,
            num_classes,
        })
    }

    fn last_hidden(lstm: &LSTM, seq: &Tensor) -> candle_core::Result<Tensor> {
        let states = lstm.seq(seq)?;
        states
            .last()
            .map(|s| s.h().clone())
            .ok_or_else(|| candle_core::Error::Msg("empty sequence".to_string()))
    }

    fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let seq = self.proj.forward(x)?.relu()?.unsqueeze(1)?;
        let reversed_idx: Vec<u32> = (0..seq.dim(1)? as u32).rev().collect();
        let reversed_idx = Tensor::new(reversed_idx.as_slice(), seq.device())?;
        let reversed = seq.index_select(&reversed_idx, 1)?;

        let h_fwd = Self::last_hidden(&self.forward_lstm, &seq)?;
        let h_bwd = Self::last_hidden(&self.backward_lstm, &reversed)?;
        let h = Tensor::cat(&[h_fwd, h_bwd], 1)?.apply_t(&self.dropout, train)?;
        self.head.forward(&h)
    }
}

impl LogitModel for SequenceClassifier {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_logits(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_input_width("sequence classifier", x, self.input_dim)?;
        self.forward(x, train)
            .map_err(model_err("Sequence classifier forward failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ParamBundle;
    use candle_core::Device;

    #[test]
    fn test_sequence_logit_shape() {
        let bundle = ParamBundle::new("sequence", &Device::Cpu);
        let model = SequenceClassifier::new(20, 8, 3, 0.1, bundle.var_builder()).unwrap();
        let x = Tensor::randn(0f32, 1.0, (5, 20), &Device::Cpu).unwrap();
        assert_eq!(model.forward_logits(&x, false).unwrap().dims(), &[5, 3]);
        assert_eq!(model.forward_logits(&x, true).unwrap().dims(), &[5, 3]);
    }

    #[test]
    fn test_directions_have_separate_weights() {
        let bundle = ParamBundle::new("sequence", &Device::Cpu);
        let _model = SequenceClassifier::new(4, 4, 2, 0.0, bundle.var_builder()).unwrap();
        let names: Vec<String> = bundle.varmap().data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n.starts_with("lstm_fwd.")));
        assert!(names.iter().any(|n| n.starts_with("lstm_bwd.")));
    }

    #[test]
    fn test_sequence_rejects_wrong_width() {
        let bundle = ParamBundle::new("sequence", &Device::Cpu);
        let model = SequenceClassifier::new(20, 8, 3, 0.0, bundle.var_builder()).unwrap();
        let x = Tensor::zeros((2, 10), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward_logits(&x, false),
            Err(MvidsError::DimensionMismatch { .. })
        ));
    }
}
