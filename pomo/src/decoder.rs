// src/decoder.rs
//
// Autoregressive multi-start decoder.
//
// A rollout moves Initialized -> Stepping -> Terminated:
// - start(): reset the environment with P replicas per instance, tile the
//   precomputed node projections once (block-major layout)
// - step(): one action per trajectory; the first step is forced to the
//   environment's start nodes when P > 1
// - finish(): stack per-step log-distributions, actions and the validity
//   mask, read the terminal reward
//
// Invariants enforced per step:
// - a masked node never gets probability mass and is never selected
// - a done trajectory emits padding (step_mask = false, zero distribution,
//   last node repeated) and its state is left untouched by the environment
// - a live trajectory with every action masked is a MaskingViolation
// - the rollout terminates within the step limit or fails

use std::fmt;

use log::debug;
use ndarray::{s, stack, Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::batch::{batchify, unbatchify, InstanceBatch};
use crate::config::PolicyConfig;
use crate::context::EnvContext;
use crate::env::{Environment, TrajectoryState};
use crate::error::{PomoError, Result};
use crate::nn::{masked_log_softmax, multi_head, Linear};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeType {
    Sampling,
    Greedy,
}

impl DecodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeType::Sampling => "sampling",
            DecodeType::Greedy => "greedy",
        }
    }

    pub fn parse(s: &str) -> Result<DecodeType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sampling" | "sample" => Ok(DecodeType::Sampling),
            "greedy" => Ok(DecodeType::Greedy),
            other => Err(PomoError::config(
                "decode_type",
                format!("unknown decode type '{other}' (expected sampling|greedy)"),
            )),
        }
    }
}

impl fmt::Display for DecodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    Initialized,
    Stepping,
    Terminated,
}

/// Pick one node from a step log-distribution.
///
/// Greedy takes the feasible argmax (lowest index on ties). Sampling draws
/// from `exp(log_p)`, where masked entries carry exactly zero weight. The
/// chosen node is re-checked against the mask either way.
pub fn select_action<R: Rng + ?Sized>(
    log_p: ArrayView1<'_, f32>,
    mask: ArrayView1<'_, bool>,
    decode_type: DecodeType,
    rng: &mut R,
    trajectory: usize,
    step: usize,
) -> Result<usize> {
    if log_p.len() != mask.len() {
        return Err(PomoError::shape("step distribution width", mask.len(), log_p.len()));
    }
    if log_p
        .iter()
        .zip(mask.iter())
        .any(|(&v, &m)| !m && v.is_nan())
    {
        return Err(PomoError::NumericDegeneracy {
            context: format!("NaN log-probability for trajectory {trajectory} at step {step}"),
        });
    }

    let chosen = match decode_type {
        DecodeType::Greedy => log_p
            .iter()
            .enumerate()
            .filter(|&(j, v)| !mask[j] && v.is_finite())
            .fold(None, |best: Option<(usize, f32)>, (j, &v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((j, v)),
            })
            .map(|(j, _)| j),
        DecodeType::Sampling => {
            let weights: Vec<f32> = log_p
                .iter()
                .zip(mask.iter())
                .map(|(&v, &m)| if m { 0.0 } else { v.exp() })
                .collect();
            match WeightedIndex::new(&weights) {
                Ok(dist) => Some(dist.sample(rng)),
                Err(_) => None,
            }
        }
    };

    let a = chosen.ok_or_else(|| PomoError::MaskingViolation {
        trajectory,
        step,
        message: "no feasible action with positive probability".to_string(),
    })?;
    if mask[a] {
        return Err(PomoError::MaskingViolation {
            trajectory,
            step,
            message: format!("selected masked node {a}"),
        });
    }
    Ok(a)
}

/// Per-step outputs of a finished rollout over T = P * B trajectories.
#[derive(Debug, Clone)]
pub struct RolloutOutput {
    /// (T, S, N); zero rows at padded steps.
    pub log_probs: Array3<f32>,
    /// (T, S)
    pub actions: Array2<usize>,
    /// (T, S); `false` marks padding after a trajectory finished.
    pub step_mask: Array2<bool>,
    /// Terminal state, `reward` filled in.
    pub state: TrajectoryState,
    pub num_starts: usize,
}

/// Rollout outputs regrouped per instance: leading axes (B, P).
#[derive(Debug, Clone)]
pub struct PomoRollout {
    pub log_probs: Array4<f32>,
    pub actions: Array3<usize>,
    pub step_mask: Array3<bool>,
    pub reward: Array2<f32>,
}

impl RolloutOutput {
    pub fn num_trajectories(&self) -> usize {
        self.actions.nrows()
    }

    pub fn num_steps(&self) -> usize {
        self.actions.ncols()
    }

    pub fn reward(&self) -> Result<&Array1<f32>> {
        self.state
            .reward
            .as_ref()
            .ok_or_else(|| PomoError::config("rollout", "reward read before termination"))
    }

    /// Split the block-major trajectory axis into (B, P).
    pub fn reshape_pomo(&self) -> Result<PomoRollout> {
        let p = self.num_starts;
        Ok(PomoRollout {
            log_probs: unbatchify(&self.log_probs, p)?,
            actions: unbatchify(&self.actions, p)?,
            step_mask: unbatchify(&self.step_mask, p)?,
            reward: unbatchify(self.reward()?, p)?,
        })
    }
}

/// Pointer decoder with a multi-head glimpse.
#[derive(Debug)]
pub struct Decoder {
    embedding_dim: usize,
    n_heads: usize,
    num_starts: usize,
    mask_inner: bool,
    tanh_clipping: f32,
    max_decode_steps: Option<usize>,
    /// D -> 3D: glimpse keys, glimpse values, logit keys.
    project_node: Linear,
    project_fixed: Linear,
    project_out: Linear,
    context: Box<dyn EnvContext>,
}

impl Decoder {
    pub fn new(cfg: &PolicyConfig, context: Box<dyn EnvContext>, rng: &mut ChaCha8Rng) -> Self {
        let d = cfg.embedding_dim;
        Self {
            embedding_dim: d,
            n_heads: cfg.n_heads,
            num_starts: cfg.num_pomo,
            mask_inner: cfg.mask_inner,
            tanh_clipping: cfg.tanh_clipping,
            max_decode_steps: None,
            project_node: Linear::new(d, 3 * d, false, rng),
            project_fixed: Linear::new(d, d, false, rng),
            project_out: Linear::new(d, d, false, rng),
            context,
        }
    }

    /// Override the environment's step limit.
    pub fn with_max_decode_steps(mut self, max_decode_steps: Option<usize>) -> Self {
        self.max_decode_steps = max_decode_steps;
        self
    }

    pub fn num_starts(&self) -> usize {
        self.num_starts
    }

    /// Reset the environment and precompute everything that does not change
    /// across steps.
    pub fn start<'a>(
        &'a self,
        env: &'a dyn Environment,
        batch: &InstanceBatch,
        embeddings: &Array3<f32>,
        graph: &Array2<f32>,
    ) -> Result<Rollout<'a>> {
        let (b, n, d) = embeddings.dim();
        if b != batch.batch_size() || n != batch.num_nodes() {
            return Err(PomoError::shape(
                "encoder output (batch, nodes)",
                format!("({}, {})", batch.batch_size(), batch.num_nodes()),
                format!("({b}, {n})"),
            ));
        }
        if d != self.embedding_dim {
            return Err(PomoError::shape("encoder output width", self.embedding_dim, d));
        }
        if graph.dim() != (b, d) {
            return Err(PomoError::shape(
                "graph embedding",
                format!("({b}, {d})"),
                format!("{:?}", graph.dim()),
            ));
        }

        let p = self.num_starts;
        let state = env.reset(batch, p)?;
        if state.num_trajectories() != b * p {
            return Err(PomoError::shape(
                "environment trajectories",
                b * p,
                state.num_trajectories(),
            ));
        }

        let node = self.project_node.forward3(embeddings.view())?;
        let glimpse_key = batchify(&node.slice(s![.., .., ..d]).to_owned(), p)?;
        let glimpse_val = batchify(&node.slice(s![.., .., d..2 * d]).to_owned(), p)?;
        let logit_key = batchify(&node.slice(s![.., .., 2 * d..]).to_owned(), p)?;
        let fixed = batchify(&self.project_fixed.forward(graph.view())?, p)?;
        let limit = self
            .max_decode_steps
            .unwrap_or_else(|| env.step_limit(&state));

        debug!(
            "rollout start: env={} batch={} starts={} nodes={} limit={}",
            env.name(),
            b,
            p,
            n,
            limit
        );

        Ok(Rollout {
            decoder: self,
            env,
            state,
            phase: DecoderPhase::Initialized,
            embeddings: batchify(embeddings, p)?,
            glimpse_key,
            glimpse_val,
            logit_key,
            fixed,
            limit,
            log_probs: Vec::new(),
            actions: Vec::new(),
            step_mask: Vec::new(),
        })
    }

    /// Run a rollout to termination.
    pub fn rollout<R: Rng + ?Sized>(
        &self,
        env: &dyn Environment,
        batch: &InstanceBatch,
        embeddings: &Array3<f32>,
        graph: &Array2<f32>,
        decode_type: DecodeType,
        rng: &mut R,
    ) -> Result<RolloutOutput> {
        let mut rollout = self.start(env, batch, embeddings, graph)?;
        while rollout.step(decode_type, rng)? != DecoderPhase::Terminated {}
        rollout.finish()
    }

    /// Log-distribution over nodes for one live trajectory, `None` when
    /// every node is masked.
    fn step_log_probs(
        &self,
        query: ArrayView1<'_, f32>,
        glimpse_key: ArrayView2<'_, f32>,
        glimpse_val: ArrayView2<'_, f32>,
        logit_key: ArrayView2<'_, f32>,
        mask: ArrayView1<'_, bool>,
    ) -> Result<Option<Array1<f32>>> {
        let q = query.insert_axis(Axis(0));
        let inner_mask = self.mask_inner.then_some(mask);
        let heads = multi_head(q, glimpse_key, glimpse_val, self.n_heads, inner_mask);
        let glimpse = self.project_out.forward(heads.view())?;

        let scale = 1.0 / (self.embedding_dim as f32).sqrt();
        let mut logits = logit_key.dot(&glimpse.row(0)) * scale;
        if self.tanh_clipping > 0.0 {
            let c = self.tanh_clipping;
            logits.mapv_inplace(|v| c * v.tanh());
        }
        Ok(masked_log_softmax(logits.view(), Some(mask)))
    }
}

/// An in-flight rollout.
pub struct Rollout<'a> {
    decoder: &'a Decoder,
    env: &'a dyn Environment,
    state: TrajectoryState,
    phase: DecoderPhase,
    embeddings: Array3<f32>,
    glimpse_key: Array3<f32>,
    glimpse_val: Array3<f32>,
    logit_key: Array3<f32>,
    fixed: Array2<f32>,
    limit: usize,
    log_probs: Vec<Array2<f32>>,
    actions: Vec<Vec<usize>>,
    step_mask: Vec<Vec<bool>>,
}

impl<'a> Rollout<'a> {
    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    pub fn state(&self) -> &TrajectoryState {
        &self.state
    }

    pub fn steps_taken(&self) -> usize {
        self.actions.len()
    }

    /// Decode one step for every trajectory.
    pub fn step<R: Rng + ?Sized>(&mut self, decode_type: DecodeType, rng: &mut R) -> Result<DecoderPhase> {
        match self.phase {
            DecoderPhase::Terminated => return Ok(DecoderPhase::Terminated),
            DecoderPhase::Initialized => self.phase = DecoderPhase::Stepping,
            DecoderPhase::Stepping => {}
        }
        if self.state.all_done() {
            self.phase = DecoderPhase::Terminated;
            return Ok(self.phase);
        }
        let step = self.actions.len();
        if step >= self.limit {
            return Err(PomoError::StepLimitExceeded { limit: self.limit });
        }

        let t = self.state.num_trajectories();
        let n = self.state.num_nodes();
        let mut dist = Array2::<f32>::zeros((t, n));
        let mut actions = vec![0usize; t];
        let mut valid = vec![false; t];

        let num_starts = self.decoder.num_starts;
        if step == 0 && num_starts > 1 {
            let starts = self.env.start_nodes(&self.state, num_starts)?;
            if starts.len() != t {
                return Err(PomoError::shape("start nodes", t, starts.len()));
            }
            for (row, &a) in starts.iter().enumerate() {
                if a >= n || self.state.action_mask[[row, a]] {
                    return Err(PomoError::MaskingViolation {
                        trajectory: row,
                        step,
                        message: format!("forced start node {a} is infeasible"),
                    });
                }
                let mut r = dist.row_mut(row);
                r.fill(f32::NEG_INFINITY);
                r[a] = 0.0;
                actions[row] = a;
                valid[row] = true;
            }
        } else {
            let ctx = self
                .decoder
                .context
                .context(self.embeddings.view(), &self.state)?;
            let query = &self.fixed + &ctx;
            for row in 0..t {
                if !self.state.is_live(row) {
                    actions[row] = self
                        .state
                        .current_node
                        .as_ref()
                        .map_or(0, |cur| cur[row]);
                    continue;
                }
                let mask = self.state.action_mask.row(row);
                let log_p = self
                    .decoder
                    .step_log_probs(
                        query.row(row),
                        self.glimpse_key.index_axis(Axis(0), row),
                        self.glimpse_val.index_axis(Axis(0), row),
                        self.logit_key.index_axis(Axis(0), row),
                        mask,
                    )?
                    .ok_or_else(|| PomoError::MaskingViolation {
                        trajectory: row,
                        step,
                        message: "every action is masked for a live trajectory".to_string(),
                    })?;
                actions[row] = select_action(log_p.view(), mask, decode_type, rng, row, step)?;
                dist.row_mut(row).assign(&log_p);
                valid[row] = true;
            }
        }

        self.env.step(&mut self.state, &actions)?;
        self.log_probs.push(dist);
        self.actions.push(actions);
        self.step_mask.push(valid);

        if self.state.all_done() {
            debug!("rollout terminated after {} steps", self.actions.len());
            self.phase = DecoderPhase::Terminated;
        }
        Ok(self.phase)
    }

    /// Collect outputs; only valid once terminated.
    pub fn finish(self) -> Result<RolloutOutput> {
        if self.phase != DecoderPhase::Terminated {
            return Err(PomoError::config(
                "rollout",
                format!("finish called in phase {:?}", self.phase),
            ));
        }
        let mut state = self.state;
        let t = state.num_trajectories();
        let n = state.num_nodes();
        let steps = self.actions.len();

        let log_probs = if steps == 0 {
            Array3::zeros((t, 0, n))
        } else {
            let views: Vec<_> = self.log_probs.iter().map(|a| a.view()).collect();
            stack(Axis(1), &views)?
        };
        let actions = Array2::from_shape_fn((t, steps), |(row, s)| self.actions[s][row]);
        let step_mask = Array2::from_shape_fn((t, steps), |(row, s)| self.step_mask[s][row]);

        let reward = self.env.reward(&state)?;
        if reward.len() != t {
            return Err(PomoError::shape("reward length", t, reward.len()));
        }
        state.reward = Some(reward);

        Ok(RolloutOutput {
            log_probs,
            actions,
            step_mask,
            state,
            num_starts: self.decoder.num_starts,
        })
    }
}
