//! Graph classifier over the samples of a batch.
//!
//! Every row of the batch is a node. An [`AdjacencyProvider`] supplies the
//! `[B, B]` adjacency, which is row-normalised and used for two rounds of
//! neighbour aggregation before a per-node linear readout.
//!
//! # Architecture
//!
//! ```text
//! x [B, F] → Linear(H) → ReLU                    = h0
//! Â · Linear(H)(h0) → ReLU → Dropout             = h1
//! Â · Linear(H)(h1) → ReLU                       = h2
//! h2 → Linear(C)                                 = logits [B, C]
//! ```
//!
//! With [`IdentityAdjacency`] each node only aggregates itself; real flow
//! topology can be plugged in without touching the classifier.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};
use mvids_core::{MvidsError, Result, EPSILON};

use super::LogitModel;
use crate::tensor::{check_input_width, model_err};

/// Source of the node adjacency for a batch.
pub trait AdjacencyProvider {
    /// Non-negative adjacency matrix `[batch, batch]` for the rows of `x`.
    fn adjacency(&self, x: &Tensor, device: &Device) -> Result<Tensor>;
}

/// Self-loops only.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAdjacency;

impl AdjacencyProvider for IdentityAdjacency {
    fn adjacency(&self, x: &Tensor, device: &Device) -> Result<Tensor> {
        let n = x.dim(0).map_err(model_err("Adjacency needs a batch dimension"))?;
        let data: Vec<f32> = (0..n * n)
            .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(data, (n, n), device).map_err(model_err("Failed to build adjacency"))
    }
}

/// Two-round message-passing classifier.
pub struct GraphClassifier {
    proj: Linear,
    gc1: Linear,
    gc2: Linear,
    head: Linear,
    dropout: Dropout,
    adjacency: Box<dyn AdjacencyProvider>,
    input_dim: usize,
    num_classes: usize,
}

impl GraphClassifier {
    /// Build a classifier with hidden width `hidden` and the given adjacency
    /// source.
    ///
    /// # Errors
    ///
    /// Returns [`MvidsError::Config`] if a width is zero or `num_classes < 2`.
    pub fn new(
        input_dim: usize,
        hidden: usize,
        num_classes: usize,
        dropout: f32,
        adjacency: Box<dyn AdjacencyProvider>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if input_dim == 0 || hidden == 0 || num_classes < 2 {
            return Err(MvidsError::Config(format!(
                "graph classifier needs positive widths and 2+ classes \
                 (input {input_dim}, hidden {hidden}, classes {num_classes})"
            )));
        }
        let build =
            |e: candle_core::Error| MvidsError::Config(format!("Failed to build graph classifier: {e}"));
        Ok(Self {
            proj: candle_nn::linear(input_dim, hidden, vb.pp("proj")).map_err(build)?,
            gc1: candle_nn::linear(hidden, hidden, vb.pp("gc1")).map_err(build)?,
            gc2: candle_nn::linear(hidden, hidden, vb.pp("gc2")).map_err(build)?,
            head: candle_nn::linear(hidden, num_classes, vb.pp("head")).map_err(build)?,
            dropout: Dropout::new(dropout),
            adjacency,
            input_dim,
            num_classes,
        })
    }

    /// Row-normalised adjacency for `x`, validated against the batch size.
    fn normalized_adjacency(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0).map_err(model_err("Graph input needs a batch dimension"))?;
        let adj = self.adjacency.adjacency(x, x.device())?;
        if adj.dims() != [batch, batch] {
            return Err(MvidsError::Config(format!(
                "adjacency must be [{batch}, {batch}], got {:?}",
                adj.dims()
            )));
        }
        let degree = adj
            .sum_keepdim(1)
            .and_then(|d| d + EPSILON)
            .map_err(model_err("Failed to compute node degree"))?;
        adj.broadcast_div(&degree)
            .map_err(model_err("Failed to normalise adjacency"))
    }

    fn forward(&self, x: &Tensor, adj: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.proj.forward(x)?.relu()?;
        let h = adj
            .matmul(&self.gc1.forward(&h)?)?
            .relu()?
            .apply_t(&self.dropout, train)?;
        let h = adj.matmul(&self.gc2.forward(&h)?)?.relu()?;
        // Per-node readout with no pooling across the batch: each row keeps
        // its own logits, mixed with its neighbours only through `adj`.
        self.head.forward(&h)
    }
}

impl LogitModel for GraphClassifier {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward_logits(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        check_input_width("graph classifier", x, self.input_dim)?;
        let adj = self.normalized_adjacency(x)?;
        self.forward(x, &adj, train)
            .map_err(model_err("Graph classifier forward failed"))
    }
}
