// src/embedding.rs
//
// Initial node embeddings, selected by environment name.
//
// The registry is an explicit table built at startup: callers may register
// extra adapters before constructing a policy. Unknown names fail with
// UnknownEnvironment listing what is registered.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{concatenate, s, Array3, Axis};
use rand_chacha::ChaCha8Rng;

use crate::batch::InstanceBatch;
use crate::config::PolicyConfig;
use crate::error::{PomoError, Result};
use crate::nn::Linear;

/// Maps raw instance features to (B, N, D) node embeddings.
pub trait InitEmbedding: fmt::Debug + Send + Sync {
    fn embed(&self, batch: &InstanceBatch) -> Result<Array3<f32>>;
}

/// Builds an embedding for a given architecture, drawing parameters from `rng`.
pub type EmbeddingFactory = fn(&PolicyConfig, &mut ChaCha8Rng) -> Box<dyn InitEmbedding>;

/// Linear projection of node coordinates.
#[derive(Debug, Clone)]
pub struct TspInitEmbedding {
    proj: Linear,
}

impl TspInitEmbedding {
    pub fn new(embedding_dim: usize, rng: &mut ChaCha8Rng) -> Self {
        Self {
            proj: Linear::new(2, embedding_dim, true, rng),
        }
    }
}

impl InitEmbedding for TspInitEmbedding {
    fn embed(&self, batch: &InstanceBatch) -> Result<Array3<f32>> {
        self.proj.forward3(batch.require("locs")?.view())
    }
}

/// Depot gets its own projection; customers embed coordinates plus demand.
#[derive(Debug, Clone)]
pub struct VrpInitEmbedding {
    depot: Linear,
    customers: Linear,
}

impl VrpInitEmbedding {
    pub fn new(embedding_dim: usize, rng: &mut ChaCha8Rng) -> Self {
        Self {
            depot: Linear::new(2, embedding_dim, true, rng),
            customers: Linear::new(3, embedding_dim, true, rng),
        }
    }
}

impl InitEmbedding for VrpInitEmbedding {
    fn embed(&self, batch: &InstanceBatch) -> Result<Array3<f32>> {
        let locs = batch.require("locs")?;
        let demand = batch.require("demand")?;
        if batch.num_nodes() < 2 {
            return Err(PomoError::shape("vrp embedding nodes", ">= 2", batch.num_nodes()));
        }
        let depot = self.depot.forward3(locs.slice(s![.., ..1, ..]))?;
        let feats = concatenate(
            Axis(2),
            &[locs.slice(s![.., 1.., ..]), demand.slice(s![.., 1.., ..])],
        )?;
        let customers = self.customers.forward3(feats.view())?;
        Ok(concatenate(Axis(1), &[depot.view(), customers.view()])?)
    }
}

fn tsp_factory(cfg: &PolicyConfig, rng: &mut ChaCha8Rng) -> Box<dyn InitEmbedding> {
    Box::new(TspInitEmbedding::new(cfg.embedding_dim, rng))
}

fn vrp_factory(cfg: &PolicyConfig, rng: &mut ChaCha8Rng) -> Box<dyn InitEmbedding> {
    Box::new(VrpInitEmbedding::new(cfg.embedding_dim, rng))
}

/// Name -> embedding factory.
#[derive(Clone, Default)]
pub struct EmbeddingRegistry {
    factories: BTreeMap<String, EmbeddingFactory>,
}

impl fmt::Debug for EmbeddingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl EmbeddingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapters for the bundled environments.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("tsp", tsp_factory);
        reg.register("cvrp", vrp_factory);
        reg.register("sdvrp", vrp_factory);
        reg
    }

    pub fn register(&mut self, name: &str, factory: EmbeddingFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn build(
        &self,
        name: &str,
        cfg: &PolicyConfig,
        rng: &mut ChaCha8Rng,
    ) -> Result<Box<dyn InitEmbedding>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PomoError::UnknownEnvironment {
                name: name.to_string(),
                known: self.names(),
            })?;
        Ok(factory(cfg, rng))
    }
}
