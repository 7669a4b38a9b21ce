// src/context.rs
//
// Step context adapters, selected by environment name.
//
// A context maps (node representations, trajectory state) to one query
// vector per trajectory that the decoder adds to the projected graph
// embedding before attending over nodes.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{concatenate, Array1, Array2, ArrayView3, Axis};
use rand_chacha::ChaCha8Rng;

use crate::config::PolicyConfig;
use crate::env::TrajectoryState;
use crate::error::{PomoError, Result};
use crate::nn::{uniform_matrix, Linear};

pub trait EnvContext: fmt::Debug + Send + Sync {
    /// `embeddings`: (T, N, D) tiled node representations. Returns (T, D).
    fn context(&self, embeddings: ArrayView3<'_, f32>, state: &TrajectoryState) -> Result<Array2<f32>>;
}

pub type ContextFactory = fn(&PolicyConfig, &mut ChaCha8Rng) -> Box<dyn EnvContext>;

/// Rows `emb[t, idx[t], :]`.
pub fn gather_by_index(embeddings: ArrayView3<'_, f32>, idx: &[usize]) -> Result<Array2<f32>> {
    let (t, n, d) = embeddings.dim();
    if idx.len() != t {
        return Err(PomoError::shape("gather index length", t, idx.len()));
    }
    let mut out = Array2::zeros((t, d));
    for (row, (&i, mut dst)) in idx.iter().zip(out.outer_iter_mut()).enumerate() {
        if i >= n {
            return Err(PomoError::shape("gather index", format!("< {n}"), i));
        }
        dst.assign(&embeddings.slice(ndarray::s![row, i, ..]));
    }
    Ok(out)
}

/// `[first node, current node]` embeddings; a learned placeholder stands in
/// before the first move.
#[derive(Debug, Clone)]
pub struct TspContext {
    placeholder: Array1<f32>,
    proj: Linear,
}

impl TspContext {
    pub fn new(embedding_dim: usize, rng: &mut ChaCha8Rng) -> Self {
        let placeholder = uniform_matrix(1, 2 * embedding_dim, 1.0, rng).row(0).to_owned();
        Self {
            placeholder,
            proj: Linear::new(2 * embedding_dim, embedding_dim, false, rng),
        }
    }
}

impl EnvContext for TspContext {
    fn context(&self, embeddings: ArrayView3<'_, f32>, state: &TrajectoryState) -> Result<Array2<f32>> {
        let t = embeddings.dim().0;
        let features = match (&state.first_node, &state.current_node) {
            (Some(first), Some(current)) if state.step > 0 => concatenate(
                Axis(1),
                &[
                    gather_by_index(embeddings, first)?.view(),
                    gather_by_index(embeddings, current)?.view(),
                ],
            )?,
            _ => {
                let mut rows = Array2::zeros((t, self.placeholder.len()));
                for mut r in rows.outer_iter_mut() {
                    r.assign(&self.placeholder);
                }
                rows
            }
        };
        self.proj.forward(features.view())
    }
}

/// `[current node embedding, remaining capacity]`.
#[derive(Debug, Clone)]
pub struct VrpContext {
    proj: Linear,
}

impl VrpContext {
    pub fn new(embedding_dim: usize, rng: &mut ChaCha8Rng) -> Self {
        Self {
            proj: Linear::new(embedding_dim + 1, embedding_dim, false, rng),
        }
    }
}

impl EnvContext for VrpContext {
    fn context(&self, embeddings: ArrayView3<'_, f32>, state: &TrajectoryState) -> Result<Array2<f32>> {
        let t = embeddings.dim().0;
        let current = state
            .current_node
            .clone()
            .unwrap_or_else(|| vec![0; t]);
        let node = gather_by_index(embeddings, &current)?;
        let capacity = state.instance.require("capacity")?;
        let used = state.scalar(crate::env::cvrp::USED_CAPACITY)?;
        let remaining = Array2::from_shape_fn((t, 1), |(row, _)| capacity[[row, 0, 0]] - used[row]);
        let features = concatenate(Axis(1), &[node.view(), remaining.view()])?;
        self.proj.forward(features.view())
    }
}

fn tsp_factory(cfg: &PolicyConfig, rng: &mut ChaCha8Rng) -> Box<dyn EnvContext> {
    Box::new(TspContext::new(cfg.embedding_dim, rng))
}

fn vrp_factory(cfg: &PolicyConfig, rng: &mut ChaCha8Rng) -> Box<dyn EnvContext> {
    Box::new(VrpContext::new(cfg.embedding_dim, rng))
}

/// Name -> context factory.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    factories: BTreeMap<String, ContextFactory>,
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("tsp", tsp_factory);
        reg.register("cvrp", vrp_factory);
        reg.register("sdvrp", vrp_factory);
        reg
    }

    pub fn register(&mut self, name: &str, factory: ContextFactory) {
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
    ) -> Result<Box<dyn EnvContext>> {
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
