// src/encoder.rs
//
// Graph attention encoder.
//
// Each layer: h = Norm(h + MHA(h)); h = Norm(h + FF(h)) with a ReLU
// feed-forward of width `hidden_dim`. The graph embedding is the mean of
// the final node embeddings.

use std::fmt;

use log::info;
use ndarray::{Array2, Array3, ArrayView3, Axis};
use rand_chacha::ChaCha8Rng;

use crate::config::PolicyConfig;
use crate::error::{PomoError, Result};
use crate::nn::{Linear, MultiHeadAttention, Norm};

/// Node embeddings (B, N, D) -> (node representations (B, N, D), graph
/// embedding (B, D)).
pub trait Encoder: fmt::Debug + Send + Sync {
    fn encode(&self, embeddings: ArrayView3<'_, f32>) -> Result<(Array3<f32>, Array2<f32>)>;
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    mha: MultiHeadAttention,
    norm_attn: Norm,
    ff_in: Linear,
    ff_out: Linear,
    norm_ff: Norm,
}

impl EncoderLayer {
    fn new(cfg: &PolicyConfig, rng: &mut ChaCha8Rng) -> Self {
        let d = cfg.embedding_dim;
        Self {
            mha: MultiHeadAttention::new(d, cfg.n_heads, rng),
            norm_attn: Norm::new(cfg.normalization, d),
            ff_in: Linear::new(d, cfg.hidden_dim, true, rng),
            ff_out: Linear::new(cfg.hidden_dim, d, true, rng),
            norm_ff: Norm::new(cfg.normalization, d),
        }
    }

    fn forward(&self, h: &Array3<f32>) -> Result<Array3<f32>> {
        let mut attn = Array3::<f32>::zeros(h.raw_dim());
        for (x, mut out) in h.outer_iter().zip(attn.outer_iter_mut()) {
            out.assign(&self.mha.forward(x)?);
        }
        let h = self.norm_attn.forward(&(h + &attn));

        let hidden = self.ff_in.forward3(h.view())?.mapv(|v| v.max(0.0));
        let ff = self.ff_out.forward3(hidden.view())?;
        Ok(self.norm_ff.forward(&(&h + &ff)))
    }
}

#[derive(Debug, Clone)]
pub struct GraphAttentionEncoder {
    embedding_dim: usize,
    layers: Vec<EncoderLayer>,
}

impl GraphAttentionEncoder {
    pub fn new(cfg: &PolicyConfig, rng: &mut ChaCha8Rng) -> Self {
        if cfg.force_flash_attn {
            info!("force_flash_attn requested; using the standard attention path on this backend");
        }
        Self {
            embedding_dim: cfg.embedding_dim,
            layers: (0..cfg.n_encode_layers)
                .map(|_| EncoderLayer::new(cfg, rng))
                .collect(),
        }
    }
}

impl Encoder for GraphAttentionEncoder {
    fn encode(&self, embeddings: ArrayView3<'_, f32>) -> Result<(Array3<f32>, Array2<f32>)> {
        let (_, n, d) = embeddings.dim();
        if d != self.embedding_dim {
            return Err(PomoError::shape("encoder input width", self.embedding_dim, d));
        }
        if n == 0 {
            return Err(PomoError::shape("encoder nodes", ">= 1", 0));
        }
        let mut h = embeddings.to_owned();
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        let graph = mean_over_nodes(&h)?;
        Ok((h, graph))
    }
}

/// Pass-through encoder: node representations equal the input embeddings.
#[derive(Debug, Clone, Default)]
pub struct IdentityEncoder;

impl Encoder for IdentityEncoder {
    fn encode(&self, embeddings: ArrayView3<'_, f32>) -> Result<(Array3<f32>, Array2<f32>)> {
        let h = embeddings.to_owned();
        let graph = mean_over_nodes(&h)?;
        Ok((h, graph))
    }
}

fn mean_over_nodes(h: &Array3<f32>) -> Result<Array2<f32>> {
    h.mean_axis(Axis(1))
        .ok_or_else(|| PomoError::shape("encoder nodes", ">= 1", 0))
}
