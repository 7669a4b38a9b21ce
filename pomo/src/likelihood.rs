// src/likelihood.rs
//
// Log-likelihood aggregation over rollout steps.
//
// Padding steps contribute exactly zero, whatever value they hold (NaN and
// -inf included). A non-finite value at a valid step is reported, not
// summed.

use ndarray::{Array1, Array2, ArrayView2, ArrayView3};

use crate::error::{PomoError, Result};

/// `out[t, s] = log_p[t, s, actions[t, s]]`.
pub fn gather_log_probs(log_p: ArrayView3<'_, f32>, actions: ArrayView2<'_, usize>) -> Result<Array2<f32>> {
    let (t, s, n) = log_p.dim();
    if actions.dim() != (t, s) {
        return Err(PomoError::shape(
            "actions",
            format!("({t}, {s})"),
            format!("{:?}", actions.dim()),
        ));
    }
    if let Some(&bad) = actions.iter().find(|&&a| a >= n) {
        return Err(PomoError::shape("action index", format!("< {n}"), bad));
    }
    Ok(Array2::from_shape_fn((t, s), |(row, step)| {
        log_p[[row, step, actions[[row, step]]]]
    }))
}

/// Sum per-step log-probabilities over valid steps, per trajectory.
pub fn sum_step_log_probs(
    selected: ArrayView2<'_, f32>,
    valid: Option<ArrayView2<'_, bool>>,
) -> Result<Array1<f32>> {
    if let Some(v) = &valid {
        if v.dim() != selected.dim() {
            return Err(PomoError::shape(
                "step mask",
                format!("{:?}", selected.dim()),
                format!("{:?}", v.dim()),
            ));
        }
    }
    let mut out = Array1::zeros(selected.nrows());
    for (row, values) in selected.outer_iter().enumerate() {
        let mut total = 0.0_f32;
        for (step, &lp) in values.iter().enumerate() {
            let counted = valid.as_ref().map_or(true, |v| v[[row, step]]);
            if !counted {
                continue;
            }
            if !lp.is_finite() {
                return Err(PomoError::NumericDegeneracy {
                    context: format!(
                        "log-probability {lp} at valid step {step} of trajectory {row}"
                    ),
                });
            }
            total += lp;
        }
        out[row] = total;
    }
    Ok(out)
}

/// Total log-likelihood of the chosen actions per trajectory.
///
/// `log_p`: (T, S, N), `actions`: (T, S), `valid`: (T, S) with `false` on
/// padding steps.
pub fn get_log_likelihood(
    log_p: ArrayView3<'_, f32>,
    actions: ArrayView2<'_, usize>,
    valid: Option<ArrayView2<'_, bool>>,
) -> Result<Array1<f32>> {
    let selected = gather_log_probs(log_p, actions)?;
    sum_step_log_probs(selected.view(), valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_gather_picks_chosen_entries() {
        let log_p = Array3::from_shape_fn((1, 2, 3), |(_, s, j)| -((s * 3 + j) as f32));
        let actions = array![[2, 0]];
        let g = gather_log_probs(log_p.view(), actions.view()).unwrap();
        assert_eq!(g, array![[-2.0, -3.0]]);
    }

    #[test]
    fn test_no_mask_sums_everything() {
        let selected = array![[-1.0_f32, -2.0], [-0.5, 0.0]];
        let ll = sum_step_log_probs(selected.view(), None).unwrap();
        assert_eq!(ll, array![-3.0, -0.5]);
    }

    #[test]
    fn test_padding_values_ignored() {
        let selected = array![[-1.0_f32, f32::NAN, f32::NEG_INFINITY]];
        let valid = array![[true, false, false]];
        let ll = sum_step_log_probs(selected.view(), Some(valid.view())).unwrap();
        assert_eq!(ll[0], -1.0);
    }

    #[test]
    fn test_non_finite_valid_step_reported() {
        let selected = array![[-1.0_f32, f32::NEG_INFINITY]];
        let valid = array![[true, true]];
        let err = sum_step_log_probs(selected.view(), Some(valid.view())).unwrap_err();
        assert!(matches!(err, PomoError::NumericDegeneracy { .. }));
    }

    #[test]
    fn test_shape_mismatch() {
        let log_p = Array3::<f32>::zeros((2, 3, 4));
        let actions = Array2::<usize>::zeros((2, 2));
        assert!(get_log_likelihood(log_p.view(), actions.view(), None).is_err());
        let actions = Array2::<usize>::from_elem((2, 3), 4);
        assert!(get_log_likelihood(log_p.view(), actions.view(), None).is_err());
    }
}
