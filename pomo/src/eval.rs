// src/eval.rs
//
// Augmented greedy evaluation.
//
// Each instance is expanded into A augmented copies, every copy is decoded
// greedily from P starts, and the best of the A * P rewards is kept. The
// identity slice (augmentation 0) gives the no-augmentation baseline.

use log::info;
use ndarray::{Array1, Array3, Axis};
use rand::RngCore;
use serde::Serialize;

use crate::augmentation::StateAugmentation;
use crate::batch::{unbatchify, InstanceBatch};
use crate::decoder::DecodeType;
use crate::error::Result;
use crate::policy::{Phase, PomoPolicy};

#[derive(Debug, Clone)]
pub struct AugmentedEvaluation {
    /// (B, A, P)
    pub reward: Array3<f32>,
    /// Best over augmentations and starts, per instance.
    pub best_reward: Array1<f32>,
    /// (augmentation, start) of the best reward, per instance.
    pub best_index: Vec<(usize, usize)>,
    /// Best over starts of the identity slice only.
    pub no_aug_reward: Array1<f32>,
}

/// Scalar summary of an evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub instances: usize,
    pub num_augment: usize,
    pub num_starts: usize,
    pub mean_best_reward: f32,
    pub mean_no_aug_reward: f32,
}

impl AugmentedEvaluation {
    pub fn summary(&self) -> EvaluationSummary {
        let (b, a, p) = self.reward.dim();
        EvaluationSummary {
            instances: b,
            num_augment: a,
            num_starts: p,
            mean_best_reward: self.best_reward.mean().unwrap_or(0.0),
            mean_no_aug_reward: self.no_aug_reward.mean().unwrap_or(0.0),
        }
    }
}

pub fn evaluate_augmented(
    policy: &PomoPolicy,
    batch: &InstanceBatch,
    augmentation: &StateAugmentation,
    rng: &mut dyn RngCore,
) -> Result<AugmentedEvaluation> {
    let a = augmentation.num_augment();
    let augmented = augmentation.apply(batch, rng)?;
    let out = policy.forward(&augmented, Phase::Test, DecodeType::Greedy, false, rng)?;

    // (A * B, P) -> (B, A, P)
    let reward = unbatchify(&out.reward, a)?;
    let (b, _, _) = reward.dim();

    let mut best_reward = Array1::from_elem(b, f32::NEG_INFINITY);
    let mut best_index = vec![(0, 0); b];
    let mut no_aug_reward = Array1::from_elem(b, f32::NEG_INFINITY);
    for (inst, grid) in reward.axis_iter(Axis(0)).enumerate() {
        for ((k, p), &r) in grid.indexed_iter() {
            if r > best_reward[inst] {
                best_reward[inst] = r;
                best_index[inst] = (k, p);
            }
            if k == 0 && r > no_aug_reward[inst] {
                no_aug_reward[inst] = r;
            }
        }
    }

    info!(
        "augmented eval: {} instances x {} augmentations ({}) x {} starts, mean best {:.4}, identity {:.4}",
        b,
        a,
        augmentation.transform_name(),
        out.num_starts(),
        best_reward.mean().unwrap_or(0.0),
        no_aug_reward.mean().unwrap_or(0.0)
    );

    Ok(AugmentedEvaluation {
        reward,
        best_reward,
        best_index,
        no_aug_reward,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AugmentationConfig, PolicyConfig};
    use crate::env::{generate_tsp, TspEnv};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_augmented_eval_shapes_and_dominance() {
        let policy = PomoPolicy::with_defaults(
            Box::new(TspEnv::new()),
            PolicyConfig::small().with_num_pomo(3),
        )
        .unwrap();
        let aug = StateAugmentation::new(&AugmentationConfig::dihedral8()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let batch = generate_tsp(2, 5, &mut rng).unwrap();

        let eval = evaluate_augmented(&policy, &batch, &aug, &mut rng).unwrap();
        assert_eq!(eval.reward.dim(), (2, 8, 3));
        for b in 0..2 {
            assert!(eval.best_reward[b] >= eval.no_aug_reward[b]);
            let (k, p) = eval.best_index[b];
            assert_eq!(eval.reward[[b, k, p]], eval.best_reward[b]);
        }
        let summary = eval.summary();
        assert_eq!(summary.num_augment, 8);
        assert_eq!(summary.instances, 2);
    }

    #[test]
    fn test_identity_baseline_matches_plain_greedy() {
        let policy = PomoPolicy::with_defaults(
            Box::new(TspEnv::new()),
            PolicyConfig::small().with_num_pomo(4),
        )
        .unwrap();
        let aug = StateAugmentation::new(&AugmentationConfig::dihedral8()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let batch = generate_tsp(2, 10, &mut rng).unwrap();

        let plain = policy
            .forward(&batch, Phase::Test, DecodeType::Greedy, false, &mut rng)
            .unwrap();
        let (plain_best, _) = plain.best_of_pomo();
        let eval = evaluate_augmented(&policy, &batch, &aug, &mut rng).unwrap();
        for b in 0..2 {
            assert!((eval.no_aug_reward[b] - plain_best[b]).abs() < 1e-5);
        }
    }
}
