//! POMO policy rollout engine.
//!
//! This crate runs a constructive routing policy over batches of problem
//! instances: every instance is decoded from several forced starting nodes
//! at once (multi-start / POMO replicas), optionally after expanding the
//! batch with symmetry-preserving coordinate transforms. The binary
//! (`src/main.rs`) is a thin evaluation harness around these components.
//!
//! # Architecture
//!
//! - **Batches** (`batch`): named (batch, node, dim) feature tensors and the
//!   block-major replica layout shared by augmentation and multi-start.
//!
//! - **Augmentation** (`augmentation`): dihedral group of order 8 and random
//!   rotation/reflection transforms, min-max normalisation, and the
//!   `StateAugmentation` pipeline that keeps the identity copy exact.
//!
//! - **Environment** (`env`): the `Environment` trait the decoder consumes,
//!   plus bundled TSP and CVRP implementations and seeded generators.
//!
//! - **Model** (`embedding`, `encoder`, `context`, `decoder`, `nn`): init
//!   embeddings and step contexts looked up by environment name in explicit
//!   registries, a graph attention encoder, and the multi-start pointer
//!   decoder with feasibility masking and padding.
//!
//! - **Likelihood** (`likelihood`): per-trajectory log-likelihood that
//!   ignores padding steps.
//!
//! - **Policy** (`policy`, `eval`): the orchestrator tying it together and
//!   best-of-(augmentation x start) evaluation.
//!
//! Configuration is plain serde structs (`config`) loadable from YAML with
//! `POMO_*` environment overrides. Errors are a single `PomoError` enum.

pub mod augmentation;
pub mod batch;
pub mod config;
pub mod context;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod env;
pub mod error;
pub mod eval;
pub mod likelihood;
pub mod nn;
pub mod policy;

// --- Re-exports for ergonomic external use ---------------------------------

pub use augmentation::{AugmentFn, AugmentTransform, StateAugmentation};
pub use batch::{batchify, unbatchify, InstanceBatch};
pub use config::{AugmentationConfig, Normalization, PolicyConfig, RolloutConfig, RunConfig};
pub use context::{ContextRegistry, EnvContext};
pub use decoder::{DecodeType, Decoder, DecoderPhase, RolloutOutput};
pub use embedding::{EmbeddingRegistry, InitEmbedding};
pub use encoder::{Encoder, GraphAttentionEncoder};
pub use env::{CvrpEnv, Environment, TrajectoryState, TspEnv};
pub use error::{PomoError, Result};
pub use eval::{evaluate_augmented, AugmentedEvaluation};
pub use likelihood::get_log_likelihood;
pub use policy::{Phase, PolicyOutput, PomoPolicy};
