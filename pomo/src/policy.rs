// src/policy.rs
//
// POMO policy: init embedding -> encoder -> multi-start decoder ->
// log-likelihood.
//
// Adapters are looked up by environment name at construction. All
// parameters come from one ChaCha8Rng seeded with `init_seed`, drawn in a
// fixed order (embedding, encoder, context, decoder).

use std::fmt;

use log::{debug, info};
use ndarray::{Array1, Array2, Array3, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::batch::{unbatchify, InstanceBatch};
use crate::config::PolicyConfig;
use crate::context::ContextRegistry;
use crate::decoder::{DecodeType, Decoder, RolloutOutput};
use crate::embedding::{EmbeddingRegistry, InitEmbedding};
use crate::encoder::{Encoder, GraphAttentionEncoder};
use crate::env::Environment;
use crate::error::{PomoError, Result};
use crate::likelihood::get_log_likelihood;

/// Caller-supplied phase label. Decoding behaviour is chosen by
/// `DecodeType`; the phase is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Val,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
            Phase::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Result<Phase> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Phase::Train),
            "val" | "valid" | "validation" => Ok(Phase::Val),
            "test" => Ok(Phase::Test),
            other => Err(PomoError::config(
                "phase",
                format!("unknown phase '{other}' (expected train|val|test)"),
            )),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one forward pass, grouped per instance.
#[derive(Debug, Clone)]
pub struct PolicyOutput {
    /// (B, P)
    pub reward: Array2<f32>,
    /// (B, P)
    pub log_likelihood: Array2<f32>,
    /// (B, P, S) when requested.
    pub actions: Option<Array3<usize>>,
}

impl PolicyOutput {
    pub fn batch_size(&self) -> usize {
        self.reward.nrows()
    }

    pub fn num_starts(&self) -> usize {
        self.reward.ncols()
    }

    /// Best replica per instance: (max reward, replica index). Ties go to
    /// the lowest index.
    pub fn best_of_pomo(&self) -> (Array1<f32>, Vec<usize>) {
        let mut best = Array1::from_elem(self.batch_size(), f32::NEG_INFINITY);
        let mut idx = vec![0; self.batch_size()];
        for (b, row) in self.reward.axis_iter(Axis(0)).enumerate() {
            for (p, &r) in row.iter().enumerate() {
                if r > best[b] {
                    best[b] = r;
                    idx[b] = p;
                }
            }
        }
        (best, idx)
    }

    /// Mean over instances of the best replica reward.
    pub fn mean_best_reward(&self) -> f32 {
        self.best_of_pomo().0.mean().unwrap_or(0.0)
    }
}

pub struct PomoPolicy {
    env: Box<dyn Environment>,
    config: PolicyConfig,
    init_embedding: Box<dyn InitEmbedding>,
    encoder: Box<dyn Encoder>,
    decoder: Decoder,
}

impl fmt::Debug for PomoPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PomoPolicy")
            .field("env", &self.env.name())
            .field("config", &self.config)
            .field("encoder", &self.encoder)
            .finish()
    }
}

impl PomoPolicy {
    pub fn new(
        env: Box<dyn Environment>,
        config: PolicyConfig,
        embeddings: &EmbeddingRegistry,
        contexts: &ContextRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let name = env.name().to_string();
        let mut rng = ChaCha8Rng::seed_from_u64(config.init_seed);

        let init_embedding = embeddings.build(&name, &config, &mut rng)?;
        let encoder = GraphAttentionEncoder::new(&config, &mut rng);
        let context = contexts.build(&name, &config, &mut rng)?;
        let decoder = Decoder::new(&config, context, &mut rng);

        info!(
            "POMO policy: env={} embedding_dim={} heads={} layers={} norm={} num_pomo={}",
            name,
            config.embedding_dim,
            config.n_heads,
            config.n_encode_layers,
            config.normalization.as_str(),
            config.num_pomo
        );

        Ok(Self {
            env,
            config,
            init_embedding,
            encoder: Box::new(encoder),
            decoder,
        })
    }

    /// Build with the bundled adapter registries.
    pub fn with_defaults(env: Box<dyn Environment>, config: PolicyConfig) -> Result<Self> {
        Self::new(
            env,
            config,
            &EmbeddingRegistry::with_defaults(),
            &ContextRegistry::with_defaults(),
        )
    }

    /// Replace the default graph attention encoder.
    pub fn with_encoder(mut self, encoder: Box<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_max_decode_steps(mut self, max_decode_steps: Option<usize>) -> Self {
        self.decoder = self.decoder.with_max_decode_steps(max_decode_steps);
        self
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn env(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub fn num_pomo(&self) -> usize {
        self.decoder.num_starts()
    }

    /// Embed, encode and decode without aggregating; trajectory-major outputs.
    pub fn rollout<R: Rng + ?Sized>(
        &self,
        batch: &InstanceBatch,
        decode_type: DecodeType,
        rng: &mut R,
    ) -> Result<RolloutOutput> {
        let embedding = self.init_embedding.embed(batch)?;
        let (encoded, graph) = self.encoder.encode(embedding.view())?;
        self.decoder
            .rollout(self.env.as_ref(), batch, &encoded, &graph, decode_type, rng)
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        batch: &InstanceBatch,
        phase: Phase,
        decode_type: DecodeType,
        return_actions: bool,
        rng: &mut R,
    ) -> Result<PolicyOutput> {
        debug!(
            "forward: phase={} decode={} batch={}",
            phase,
            decode_type,
            batch.batch_size()
        );
        let out = self.rollout(batch, decode_type, rng)?;
        let ll = get_log_likelihood(
            out.log_probs.view(),
            out.actions.view(),
            Some(out.step_mask.view()),
        )?;

        let p = out.num_starts;
        let reward = unbatchify(out.reward()?, p)?;
        let log_likelihood = unbatchify(&ll, p)?;
        let actions = if return_actions {
            Some(unbatchify(&out.actions, p)?)
        } else {
            None
        };
        Ok(PolicyOutput {
            reward,
            log_likelihood,
            actions,
        })
    }
}
