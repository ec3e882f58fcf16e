//! The three feature views.
//!
//! Each view maps a batch of raw feature vectors `[B, F]` to a batch of view
//! embeddings. The views are independent: each owns its own attention stack
//! and shares no parameters with the others.
//!
//! | View     | Sequence                         | Mask   | Width         |
//! |----------|----------------------------------|--------|---------------|
//! | Global   | the vector as one token          | none   | `embed_dim`   |
//! | Temporal | `window` noisy copies            | causal | `embed_dim`   |
//! | Protocol | projected features as one token  | none   | `embed_dim/2` |

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use mvids_core::config::MvflConfig;
use mvids_core::{MvidsError, Result};
use serde::{Deserialize, Serialize};

use crate::attention::SequenceEncoder;
use crate::tensor::{check_input_width, model_err};

/// Identifies one of the three views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Global,
    Temporal,
    Protocol,
}

impl ViewKind {
    /// All views, in fusion order.
    pub const ALL: [ViewKind; 3] = [ViewKind::Global, ViewKind::Temporal, ViewKind::Protocol];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ViewKind::Global => "global",
            ViewKind::Temporal => "temporal",
            ViewKind::Protocol => "protocol",
        }
    }
}

impl std::fmt::Display for ViewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A learned encoder from raw feature vectors to a fixed-size embedding.
pub trait FeatureView {
    /// Which view this is.
    fn kind(&self) -> ViewKind;

    /// Feature width the view was built for.
    fn input_dim(&self) -> usize;

    /// Embedding width.
    fn output_dim(&self) -> usize;

    /// Embed `x: [B, input_dim]` into `[B, output_dim]`.
    ///
    /// `train` enables dropout (and, for the temporal view, noise injection).
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::DimensionMismatch`] if `x` has the wrong width.
    fn embed(&self, x: &Tensor, train: bool) -> Result<Tensor>;
}

fn check_construction(kind: ViewKind, input_dim: usize, config: &MvflConfig) -> Result<()> {
    if input_dim == 0 {
        return Err(MvidsError::Config(format!(
            "{kind} view needs a positive input width"
        )));
    }
    config.validate()
}

fn build_err(kind: ViewKind) -> impl Fn(candle_core::Error) -> MvidsError {
    move |e| MvidsError::Config(format!("Failed to build {kind} view: {e}"))
}

// ---------------------------------------------------------------------------
// Global view
// ---------------------------------------------------------------------------

/// Treats the whole feature vector as a single token and applies unmasked
/// self-attention.
pub struct GlobalView {
    encoder: SequenceEncoder,
}

impl GlobalView {
    /// Build the view for `input_dim` features.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `input_dim` is zero or the
    /// configuration is invalid.
    pub fn new(input_dim: usize, config: &MvflConfig, vb: VarBuilder) -> Result<Self> {
        check_construction(ViewKind::Global, input_dim, config)?;
        let encoder = SequenceEncoder::new(
            input_dim,
            config.embed_dim,
            config.num_heads,
            config.num_layers,
            1,
            config.dropout,
            vb.pp("encoder"),
        )
        .map_err(build_err(ViewKind::Global))?;
        Ok(Self { encoder })
    }
}

impl FeatureView for GlobalView {
    fn kind(&self) -> ViewKind {
        ViewKind::Global
    }

    fn input_dim(&self) -> usize {
        self.encoder.input_dim()
    }

    fn output_dim(&self) -> usize {
        self.encoder.output_dim()
    }

    fn embed(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_input_width("global view", x, self.input_dim())?;
        let seq = x
            .unsqueeze(1)
            .map_err(model_err("Failed to build global sequence"))?;
        self.encoder
            .forward(&seq, false, train)
            .map_err(model_err("Global view forward failed"))
    }
}

// ---------------------------------------------------------------------------
// Temporal view
// ---------------------------------------------------------------------------

/// Builds a pseudo-sequence of `window` copies of the input and applies
/// causal self-attention, reading the final position.
///
/// Gaussian noise with standard deviation `noise_std` is added to every copy
/// in training mode only, so inference is deterministic.
pub struct TemporalView {
    encoder: SequenceEncoder,
    window: usize,
    noise_std: f32,
}

impl TemporalView {
    /// Build the view for `input_dim` features.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `input_dim` is zero or the
    /// configuration is invalid.
    pub fn new(input_dim: usize, config: &MvflConfig, vb: VarBuilder) -> Result<Self> {
        check_construction(ViewKind::Temporal, input_dim, config)?;
        let encoder = SequenceEncoder::new(
            input_dim,
            config.embed_dim,
            config.num_heads,
            config.num_layers,
            config.window,
            config.dropout,
            vb.pp("encoder"),
        )
        .map_err(build_err(ViewKind::Temporal))?;
        Ok(Self {
            encoder,
            window: config.window,
            noise_std: config.noise_std,
        })
    }

    /// Length of the synthesized sequence.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Repeat `x: [B, F]` into `[B, window, F]`, adding noise when training.
    fn pseudo_sequence(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (b, f) = x.dims2()?;
        let seq = x
            .unsqueeze(1)?
            .broadcast_as((b, self.window, f))?
            .contiguous()?;
        if train && self.noise_std > 0.0 {
            let noise = Tensor::randn(0f32, self.noise_std, (b, self.window, f), x.device())?;
            seq + noise
        } else {
            Ok(seq)
        }
    }
}

impl FeatureView for TemporalView {
    fn kind(&self) -> ViewKind {
        ViewKind::Temporal
    }

    fn input_dim(&self) -> usize {
        self.encoder.input_dim()
    }

    fn output_dim(&self) -> usize {
        self.encoder.output_dim()
    }

    fn embed(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_input_width("temporal view", x, self.input_dim())?;
        let seq = self
            .pseudo_sequence(x, train)
            .map_err(model_err("Failed to build temporal sequence"))?;
        self.encoder
            .forward(&seq, true, train)
            .map_err(model_err("Temporal view forward failed"))
    }
}

// ---------------------------------------------------------------------------
// Protocol view
// ---------------------------------------------------------------------------

/// Projects the features through a learned nonlinear extractor, then applies
/// a shallower, half-width attention stack.
pub struct ProtocolView {
    extractor: Linear,
    encoder: SequenceEncoder,
}

impl ProtocolView {
    /// Build the view for `input_dim` features.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if `input_dim` is zero or the
    /// configuration is invalid.
    pub fn new(input_dim: usize, config: &MvflConfig, vb: VarBuilder) -> Result<Self> {
        check_construction(ViewKind::Protocol, input_dim, config)?;
        let extractor = candle_nn::linear(input_dim, input_dim, vb.pp("extractor"))
            .map_err(build_err(ViewKind::Protocol))?;
        let encoder = SequenceEncoder::new(
            input_dim,
            config.protocol_dim(),
            config.num_heads,
            config.protocol_layers(),
            1,
            config.dropout,
            vb.pp("encoder"),
        )
        .map_err(build_err(ViewKind::Protocol))?;
        Ok(Self { extractor, encoder })
    }
}

impl FeatureView for ProtocolView {
    fn kind(&self) -> ViewKind {
        ViewKind::Protocol
    }

    fn input_dim(&self) -> usize {
        self.encoder.input_dim()
    }

    fn output_dim(&self) -> usize {
        self.encoder.output_dim()
    }

    fn embed(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_input_width("protocol view", x, self.input_dim())?;
        let seq = self
            .extractor
            .forward(x)
            .and_then(|t| t.relu())
            .and_then(|t| t.unsqueeze(1))
            .map_err(model_err("Protocol feature extraction failed"))?;
        self.encoder
            .forward(&seq, false, train)
            .map_err(model_err("Protocol view forward failed"))
    }
}

/// Build all three views in [`ViewKind::ALL`] order, each under its own
/// parameter prefix.
///
/// # Errors
///
/// Returns [`MvidsError::Config`] if any view cannot be built.
pub fn build_views(
    input_dim: usize,
    config: &MvflConfig,
    vb: &VarBuilder,
) -> Result<Vec<Box<dyn FeatureView>>> {
    Ok(vec![
        Box::new(GlobalView::new(input_dim, config, vb.pp("global"))?),
        Box::new(TemporalView::new(input_dim, config, vb.pp("temporal"))?),
        Box::new(ProtocolView::new(input_dim, config, vb.pp("protocol"))?),
    ])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> MvflConfig {
        MvflConfig {
            embed_dim: 16,
            num_heads: 2,
            num_layers: 2,
            window: 4,
            noise_std: 0.1,
            dropout: 0.0,
            fusion_hidden: 16,
        }
    }

    fn input(rows: usize, cols: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_view_output_widths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let views = build_views(20, &small_config(), &vb).unwrap();

        let kinds: Vec<ViewKind> = views.iter().map(|v| v.kind()).collect();
        assert_eq!(kinds, ViewKind::ALL.to_vec());

        let x = input(5, 20);
        let widths: Vec<usize> = views
            .iter()
            .map(|v| v.embed(&x, false).unwrap().dims2().unwrap().1)
            .collect();
        assert_eq!(widths, vec![16, 16, 8]);
        assert_eq!(views[2].output_dim(), 8);
    }

    #[test]
    fn test_view_rejects_wrong_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let view = GlobalView::new(20, &small_config(), vb).unwrap();
        assert!(matches!(
            view.embed(&input(3, 19), false),
            Err(MvidsError::DimensionMismatch {
                expected: 20,
                actual: 19,
                ..
            })
        ));
    }

    #[test]
    fn test_view_rejects_zero_input_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            ProtocolView::new(0, &small_config(), vb),
            Err(MvidsError::Config(_))
        ));
    }

    #[test]
    fn test_view_rejects_invalid_head_split() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MvflConfig {
            num_heads: 3,
            ..small_config()
        };
        assert!(matches!(
            TemporalView::new(20, &config, vb),
            Err(MvidsError::Config(_))
        ));
    }

    #[test]
    fn test_temporal_inference_is_deterministic() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let view = TemporalView::new(20, &small_config(), vb).unwrap();
        let x = input(4, 20);
        let a: Vec<Vec<f32>> = view.embed(&x, false).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = view.embed(&x, false).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_temporal_training_injects_noise() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let view = TemporalView::new(20, &small_config(), vb).unwrap();
        let x = input(3, 20);

        // Every position of a training sequence is perturbed independently.
        let seq: Vec<Vec<Vec<f32>>> = view.pseudo_sequence(&x, true).unwrap().to_vec3().unwrap();
        let rows: Vec<Vec<f32>> = x.to_vec2().unwrap();
        for (sample, original) in seq.iter().zip(&rows) {
            assert_eq!(sample.len(), 4);
            assert!(sample.iter().all(|step| step != original));
            assert_ne!(sample[0], sample[1]);
        }

        // Inference repeats the row unchanged.
        let clean: Vec<Vec<Vec<f32>>> = view.pseudo_sequence(&x, false).unwrap().to_vec3().unwrap();
        for (sample, original) in clean.iter().zip(&rows) {
            assert!(sample.iter().all(|step| step == original));
        }

        let a: Vec<Vec<f32>> = view.embed(&x, true).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = view.embed(&x, true).unwrap().to_vec2().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_temporal_noise_disabled_at_zero_std() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MvflConfig {
            noise_std: 0.0,
            ..small_config()
        };
        let view = TemporalView::new(20, &config, vb).unwrap();
        let x = input(2, 20);
        let train: Vec<Vec<Vec<f32>>> = view.pseudo_sequence(&x, true).unwrap().to_vec3().unwrap();
        let eval: Vec<Vec<Vec<f32>>> = view.pseudo_sequence(&x, false).unwrap().to_vec3().unwrap();
        assert_eq!(train, eval);
    }

    #[test]
    fn test_temporal_window_one_matches_global() {
        // Both views are built under the same prefix so they share weights;
        // a 1×1 causal mask must not change anything.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MvflConfig {
            window: 1,
            ..small_config()
        };
        let global = GlobalView::new(20, &config, vb.clone()).unwrap();
        let temporal = TemporalView::new(20, &config, vb).unwrap();
        assert_eq!(temporal.window(), 1);

        let x = input(6, 20);
        let g: Vec<Vec<f32>> = global.embed(&x, false).unwrap().to_vec2().unwrap();
        let t: Vec<Vec<f32>> = temporal.embed(&x, false).unwrap().to_vec2().unwrap();
        assert_eq!(g, t);
    }

    #[test]
    fn test_views_do_not_share_parameters() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _views = build_views(20, &small_config(), &vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for prefix in ["global.", "temporal.", "protocol."] {
            assert!(data.keys().any(|k| k.starts_with(prefix)));
        }
    }
}
