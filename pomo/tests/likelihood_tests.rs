// tests/likelihood_tests.rs
//
// Log-likelihood aggregation over padded rollouts.

use ndarray::{array, Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use pomo::decoder::DecodeType;
use pomo::env::{generate_cvrp, CvrpEnv};
use pomo::likelihood::{gather_log_probs, get_log_likelihood};
use pomo::policy::Phase;
use pomo::{PolicyConfig, PomoError, PomoPolicy};

#[test]
fn test_padding_steps_contribute_nothing() {
    // 5 steps over 3 nodes; steps 3..5 are padding holding garbage
    let mut log_p = Array3::<f32>::zeros((1, 5, 3));
    log_p[[0, 0, 1]] = -0.25;
    log_p[[0, 1, 2]] = -1.5;
    log_p[[0, 2, 0]] = f32::NAN;
    log_p[[0, 3, 0]] = f32::NEG_INFINITY;
    log_p[[0, 4, 0]] = f32::NAN;
    let actions = array![[1usize, 2, 0, 0, 0]];
    let valid = array![[true, true, false, false, false]];

    let ll = get_log_likelihood(log_p.view(), actions.view(), Some(valid.view())).unwrap();
    assert_eq!(ll.len(), 1);
    assert!((ll[0] - (-1.75)).abs() < 1e-6);
}

#[test]
fn test_without_mask_every_step_counts() {
    let log_p = Array3::from_shape_fn((2, 2, 2), |(t, s, j)| -((t + s + j) as f32) * 0.5);
    let actions = array![[0usize, 1], [1, 0]];
    let ll = get_log_likelihood(log_p.view(), actions.view(), None).unwrap();
    // row 0: -0.0 + -1.0; row 1: -1.0 + -1.0
    assert_eq!(ll, array![-1.0_f32, -2.0]);
}

#[test]
fn test_degenerate_valid_step_is_reported() {
    let mut log_p = Array3::<f32>::zeros((1, 2, 2));
    log_p[[0, 1, 1]] = f32::NAN;
    let actions = array![[0usize, 1]];
    let valid = Array2::from_elem((1, 2), true);
    let err = get_log_likelihood(log_p.view(), actions.view(), Some(valid.view())).unwrap_err();
    assert!(matches!(err, PomoError::NumericDegeneracy { .. }));
}

#[test]
fn test_policy_likelihood_matches_rollout_sum() {
    let cfg = PolicyConfig::small().with_num_pomo(3);
    let policy = PomoPolicy::with_defaults(Box::new(CvrpEnv::new()), cfg).unwrap();
    let batch = generate_cvrp(2, 6, &mut ChaCha8Rng::seed_from_u64(12)).unwrap();

    let rollout = policy
        .rollout(&batch, DecodeType::Sampling, &mut ChaCha8Rng::seed_from_u64(3))
        .unwrap();
    let out = policy
        .forward(
            &batch,
            Phase::Train,
            DecodeType::Sampling,
            true,
            &mut ChaCha8Rng::seed_from_u64(3),
        )
        .unwrap();

    let selected = gather_log_probs(rollout.log_probs.view(), rollout.actions.view()).unwrap();
    for (row, (values, valid)) in selected
        .axis_iter(Axis(0))
        .zip(rollout.step_mask.axis_iter(Axis(0)))
        .enumerate()
    {
        let expected: f32 = values
            .iter()
            .zip(valid.iter())
            .filter(|&(_, &v)| v)
            .map(|(&lp, _)| lp)
            .sum();
        let (p, b) = (row / 2, row % 2);
        assert!((out.log_likelihood[[b, p]] - expected).abs() < 1e-5);
    }
    assert_eq!(out.actions.unwrap().dim().2, rollout.num_steps());
}
