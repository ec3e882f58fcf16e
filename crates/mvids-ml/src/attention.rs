//! Self-attention building blocks shared by the three feature views.
//!
//! # Architecture
//!
//! ```text
//! seq [B, L, F] → Linear(F → D) + sinusoidal positions
//!              → N × AttentionBlock (optionally causal)
//!              → last position [B, D] → Linear(D → D)
//! ```
//!
//! Each [`AttentionBlock`] is a post-norm transformer encoder layer:
//! multi-head self-attention and a ReLU feed-forward network, each wrapped in
//! dropout, a residual connection and layer normalisation.

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};

/// Score assigned to masked attention positions before the softmax.
const MASK_VALUE: f32 = -1e9;

/// Feed-forward width multiplier inside each block.
const FF_MULTIPLIER: usize = 4;

/// Sinusoidal positional encodings, shape `[max_len, dim]`.
pub fn sinusoidal_positions(
    max_len: usize,
    dim: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut data = Vec::with_capacity(max_len * dim);
    for pos in 0..max_len {
        for i in 0..dim {
            let exponent = (2 * (i / 2)) as f64 / dim as f64;
            let angle = pos as f64 / 10_000f64.powf(exponent);
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(value as f32);
        }
    }
    Tensor::from_vec(data, (max_len, dim), device)
}

/// Lower-triangular causal mask, shape `[len, len]`, u8: 1 where query `i`
/// may attend to key `j` (`j <= i`), 0 elsewhere.
pub fn causal_mask(len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<u8> = (0..len)
        .flat_map(|i| (0..len).map(move |j| u8::from(j <= i)))
        .collect();
    Tensor::from_vec(data, (len, len), device)
}

// ---------------------------------------------------------------------------
// Attention block
// ---------------------------------------------------------------------------

/// One transformer encoder layer.
pub struct AttentionBlock {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    norm1: LayerNorm,
    ff1: Linear,
    ff2: Linear,
    norm2: LayerNorm,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl AttentionBlock {
    /// Build a block of width `dim` split across `num_heads` heads.
    ///
    /// `dim` must be divisible by `num_heads`; callers validate this when the
    /// configuration is loaded.
    pub fn new(
        dim: usize,
        num_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(candle_core::Error::Msg(format!(
                "attention width {dim} is not divisible by {num_heads} heads"
            )));
        }
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            norm1: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            ff1: candle_nn::linear(dim, dim * FF_MULTIPLIER, vb.pp("ff1"))?,
            ff2: candle_nn::linear(dim * FF_MULTIPLIER, dim, vb.pp("ff2"))?,
            norm2: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            dropout: Dropout::new(dropout),
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// Forward pass over `x: [B, L, D]`.
    ///
    /// `mask` is a `[L, L]` u8 tensor (see [`causal_mask`]); masked scores are
    /// replaced before the softmax so position `i` cannot see masked keys.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (b, l, d) = x.dims3()?;

        let split_heads = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, l, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(self.q_proj.forward(x)?)?;
        let k = split_heads(self.k_proj.forward(x)?)?;
        let v = split_heads(self.v_proj.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        if let Some(mask) = mask {
            let shape = scores.shape().clone();
            let fill = Tensor::new(MASK_VALUE, scores.device())?.broadcast_as(shape.clone())?;
            scores = mask.broadcast_as(shape)?.where_cond(&scores, &fill)?;
        }
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, l, d))?;
        let attended = self.out_proj.forward(&attended)?.apply_t(&self.dropout, train)?;
        let x = self.norm1.forward(&(x + attended)?)?;

        let ff = self
            .ff2
            .forward(&self.ff1.forward(&x)?.relu()?)?
            .apply_t(&self.dropout, train)?;
        self.norm2.forward(&(x + ff)?)
    }
}

// ---------------------------------------------------------------------------
// Sequence encoder
// ---------------------------------------------------------------------------

/// Input projection, positional encoding, a stack of attention blocks and an
/// output projection read from the final sequence position.
pub struct SequenceEncoder {
    input_proj: Linear,
    positions: Tensor,
    blocks: Vec<AttentionBlock>,
    output_proj: Linear,
    input_dim: usize,
    dim: usize,
    max_len: usize,
}

impl SequenceEncoder {
    /// Build an encoder for sequences of up to `max_len` steps of width
    /// `input_dim`, producing vectors of width `dim`.
    pub fn new(
        input_dim: usize,
        dim: usize,
        num_heads: usize,
        num_layers: usize,
        max_len: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let blocks = (0..num_layers)
            .map(|i| AttentionBlock::new(dim, num_heads, dropout, vb.pp(format!("block{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            input_proj: candle_nn::linear(input_dim, dim, vb.pp("input_proj"))?,
            positions: sinusoidal_positions(max_len, dim, vb.device())?,
            blocks,
            output_proj: candle_nn::linear(dim, dim, vb.pp("output_proj"))?,
            input_dim,
            dim,
            max_len,
        })
    }

    /// Width of each input step.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Width of the encoded output.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.dim
    }

    /// Encode `seq: [B, L, F]` into `[B, D]`, reading the last position.
    ///
    /// With `causal` set, position `i` attends only to positions `<= i`.
    pub fn forward(&self, seq: &Tensor, causal: bool, train: bool) -> candle_core::Result<Tensor> {
        let (_, len, _) = seq.dims3()?;
        if len == 0 || len > self.max_len {
            return Err(candle_core::Error::Msg(format!(
                "sequence length {len} outside 1..={}",
                self.max_len
            )));
        }

        let positions = self.positions.narrow(0, 0, len)?.unsqueeze(0)?;
        let mut h = self.input_proj.forward(seq)?.broadcast_add(&positions)?;

        let mask = if causal {
            Some(causal_mask(len, seq.device())?)
        } else {
            None
        };
        for block in &self.blocks {
            h = block.forward(&h, mask.as_ref(), train)?;
        }

        let last = h.narrow(1, len - 1, 1)?.squeeze(1)?;
        self.output_proj.forward(&last)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn vb(varmap: &VarMap) -> VarBuilder<'static> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_causal_mask_is_lower_triangular() {
        let mask = causal_mask(3, &Device::Cpu).unwrap();
        assert_eq!(mask.dtype(), DType::U8);
        let rows: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
    }

    #[test]
    fn test_causal_mask_single_position_is_unconstrained() {
        let mask = causal_mask(1, &Device::Cpu).unwrap();
        assert_eq!(mask.to_vec2::<u8>().unwrap(), vec![vec![1]]);
    }

    #[test]
    fn test_positions_shape_and_first_row() {
        let pe = sinusoidal_positions(5, 8, &Device::Cpu).unwrap();
        assert_eq!(pe.dims(), &[5, 8]);
        let first: Vec<f32> = pe.get(0).unwrap().to_vec1().unwrap();
        // sin(0) = 0 on even dims, cos(0) = 1 on odd dims.
        for (i, v) in first.iter().enumerate() {
            let expected = if i % 2 == 0 { 0.0 } else { 1.0 };
            assert!((v - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_block_preserves_shape() {
        let varmap = VarMap::new();
        let block = AttentionBlock::new(8, 2, 0.0, vb(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 4, 8), &Device::Cpu).unwrap();
        let mask = causal_mask(4, &Device::Cpu).unwrap();
        let y = block.forward(&x, Some(&mask), false).unwrap();
        assert_eq!(y.dims(), &[3, 4, 8]);
    }

    #[test]
    fn test_block_rejects_indivisible_heads() {
        let varmap = VarMap::new();
        assert!(AttentionBlock::new(10, 3, 0.0, vb(&varmap)).is_err());
    }

    #[test]
    fn test_causal_first_position_ignores_future() {
        // Under a causal mask the first position's output depends only on the
        // first input step, so changing later steps must not move it.
        let varmap = VarMap::new();
        let block = AttentionBlock::new(8, 2, 0.0, vb(&varmap)).unwrap();
        let mask = causal_mask(3, &Device::Cpu).unwrap();

        let a = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let head = a.narrow(1, 0, 1).unwrap();
        let tail = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let b = Tensor::cat(&[&head, &tail], 1).unwrap();

        let ya: Vec<f32> = block
            .forward(&a, Some(&mask), false)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let yb: Vec<f32> = block
            .forward(&b, Some(&mask), false)
            .unwrap()
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (x, y) in ya.iter().zip(&yb) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_encoder_output_width_and_length_limit() {
        let varmap = VarMap::new();
        let enc = SequenceEncoder::new(5, 8, 2, 2, 4, 0.0, vb(&varmap)).unwrap();
        assert_eq!(enc.input_dim(), 5);
        assert_eq!(enc.output_dim(), 8);

        let seq = Tensor::randn(0f32, 1.0, (2, 4, 5), &Device::Cpu).unwrap();
        assert_eq!(enc.forward(&seq, true, false).unwrap().dims(), &[2, 8]);

        let too_long = Tensor::randn(0f32, 1.0, (2, 5, 5), &Device::Cpu).unwrap();
        assert!(enc.forward(&too_long, true, false).is_err());
    }

    #[test]
    fn test_single_step_causal_matches_unmasked() {
        let varmap = VarMap::new();
        let enc = SequenceEncoder::new(5, 8, 2, 2, 1, 0.0, vb(&varmap)).unwrap();
        let seq = Tensor::randn(0f32, 1.0, (3, 1, 5), &Device::Cpu).unwrap();
        let causal: Vec<Vec<f32>> = enc.forward(&seq, true, false).unwrap().to_vec2().unwrap();
        let open: Vec<Vec<f32>> = enc.forward(&seq, false, false).unwrap().to_vec2().unwrap();
        assert_eq!(causal, open);
    }
}
