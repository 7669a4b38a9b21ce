// src/nn.rs
//
// Inference-only building blocks for the encoder and decoder.
//
// Parameters are initialised from a seeded ChaCha8Rng, so two policies built
// with the same config produce identical outputs.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, Zip};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::Normalization;
use crate::error::{PomoError, Result};

const NORM_EPS: f32 = 1e-5;

/// Sample a (rows, cols) matrix uniformly in [-bound, bound].
pub fn uniform_matrix(rows: usize, cols: usize, bound: f32, rng: &mut ChaCha8Rng) -> Array2<f32> {
    if bound <= 0.0 {
        return Array2::zeros((rows, cols));
    }
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..=bound))
}

/// Affine map `x W + b` with `W` stored as (in, out).
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    /// Uniform(-1/sqrt(in), 1/sqrt(in)) initialisation.
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, rng: &mut ChaCha8Rng) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        let weight = uniform_matrix(in_dim, out_dim, bound, rng);
        let bias = bias.then(|| Array1::from_shape_fn(out_dim, |_| rng.gen_range(-bound..=bound)));
        Self { weight, bias }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_dim() {
            return Err(PomoError::shape("linear input width", self.in_dim(), x.ncols()));
        }
        let mut out = x.dot(&self.weight);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        Ok(out)
    }

    /// Apply to the last axis of a (batch, node, in) tensor.
    pub fn forward3(&self, x: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (b, n, d) = x.dim();
        let flat = x.as_standard_layout().into_owned().into_shape_with_order((b * n, d))?;
        let out = self.forward(flat.view())?;
        Ok(out.into_shape_with_order((b, n, self.out_dim()))?)
    }
}

/// Row-wise softmax; entries with `mask[j] == true` get probability 0.
///
/// Returns `None` when every entry is masked.
pub fn masked_softmax(logits: ArrayView1<'_, f32>, mask: Option<ArrayView1<'_, bool>>) -> Option<Array1<f32>> {
    let log_p = masked_log_softmax(logits, mask)?;
    Some(log_p.mapv(f32::exp))
}

/// Log-softmax where masked entries are exactly `-inf`.
pub fn masked_log_softmax(
    logits: ArrayView1<'_, f32>,
    mask: Option<ArrayView1<'_, bool>>,
) -> Option<Array1<f32>> {
    let is_masked = |j: usize| mask.as_ref().map(|m| m[j]).unwrap_or(false);
    let max = logits
        .iter()
        .enumerate()
        .filter(|(j, _)| !is_masked(*j))
        .map(|(_, &v)| v)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }
    let sum: f32 = logits
        .iter()
        .enumerate()
        .filter(|(j, _)| !is_masked(*j))
        .map(|(_, &v)| (v - max).exp())
        .sum();
    let log_z = max + sum.ln();
    Some(Array1::from_shape_fn(logits.len(), |j| {
        if is_masked(j) {
            f32::NEG_INFINITY
        } else {
            logits[j] - log_z
        }
    }))
}

/// Scaled dot-product attention for one head.
///
/// `q`: (Lq, d), `k`/`v`: (Lk, d). Masked keys are excluded; a query row
/// whose keys are all masked yields a zero output row.
pub fn attention(
    q: ArrayView2<'_, f32>,
    k: ArrayView2<'_, f32>,
    v: ArrayView2<'_, f32>,
    key_mask: Option<ArrayView1<'_, bool>>,
) -> Array2<f32> {
    let scale = 1.0 / (q.ncols().max(1) as f32).sqrt();
    let scores = q.dot(&k.t()) * scale;
    let mut weights = Array2::<f32>::zeros(scores.raw_dim());
    for (row, mut w) in scores.outer_iter().zip(weights.outer_iter_mut()) {
        if let Some(p) = masked_softmax(row, key_mask) {
            w.assign(&p);
        }
    }
    weights.dot(&v)
}

/// Multi-head attention with separate Q/K/V projections and an output
/// projection.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    n_heads: usize,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
}

impl MultiHeadAttention {
    pub fn new(embed_dim: usize, n_heads: usize, rng: &mut ChaCha8Rng) -> Self {
        Self {
            n_heads,
            wq: Linear::new(embed_dim, embed_dim, false, rng),
            wk: Linear::new(embed_dim, embed_dim, false, rng),
            wv: Linear::new(embed_dim, embed_dim, false, rng),
            wo: Linear::new(embed_dim, embed_dim, false, rng),
        }
    }

    /// Self-attention over the nodes of one instance: (N, D) -> (N, D).
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let q = self.wq.forward(x)?;
        let k = self.wk.forward(x)?;
        let v = self.wv.forward(x)?;
        let heads = multi_head(q.view(), k.view(), v.view(), self.n_heads, None);
        self.wo.forward(heads.view())
    }
}

/// Split the last axis into `n_heads` chunks, attend per head, concatenate.
pub fn multi_head(
    q: ArrayView2<'_, f32>,
    k: ArrayView2<'_, f32>,
    v: ArrayView2<'_, f32>,
    n_heads: usize,
    key_mask: Option<ArrayView1<'_, bool>>,
) -> Array2<f32> {
    let d = q.ncols();
    let dh = d / n_heads;
    let mut out = Array2::<f32>::zeros((q.nrows(), d));
    for h in 0..n_heads {
        let (lo, hi) = (h * dh, (h + 1) * dh);
        let head = attention(
            q.slice(s![.., lo..hi]),
            k.slice(s![.., lo..hi]),
            v.slice(s![.., lo..hi]),
            key_mask,
        );
        out.slice_mut(s![.., lo..hi]).assign(&head);
    }
    out
}

/// Normalization over a (batch, node, dim) tensor, with identity affine
/// parameters.
///
/// `Batch` uses fixed running statistics (mean 0, variance 1 unless set), so
/// an instance's output never depends on the rest of the batch. `Instance`
/// and `Layer` compute statistics from the input itself.
#[derive(Debug, Clone)]
pub struct Norm {
    kind: Normalization,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
}

impl Norm {
    pub fn new(kind: Normalization, dim: usize) -> Self {
        Self {
            kind,
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            running_mean: Array1::zeros(dim),
            running_var: Array1::ones(dim),
        }
    }

    /// Replace the running statistics used by `Normalization::Batch`.
    pub fn with_running_stats(mut self, mean: Array1<f32>, var: Array1<f32>) -> Result<Self> {
        let d = self.gamma.len();
        if mean.len() != d || var.len() != d {
            return Err(PomoError::shape(
                "running statistics",
                format!("({d},)"),
                format!("({},), ({},)", mean.len(), var.len()),
            ));
        }
        self.running_mean = mean;
        self.running_var = var;
        Ok(self)
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut out = x.clone();
        match self.kind {
            Normalization::None => return out,
            Normalization::Batch => {
                for mut row in out.lanes_mut(Axis(2)) {
                    normalize_lane(&mut row, &self.running_mean, &self.running_var);
                }
            }
            Normalization::Instance => {
                // per instance, per feature, over nodes
                for mut inst in out.outer_iter_mut() {
                    let (mean, var) = mean_var(inst.view(), Axis(0));
                    for mut row in inst.outer_iter_mut() {
                        normalize_lane(&mut row, &mean, &var);
                    }
                }
            }
            Normalization::Layer => {
                for mut row in out.lanes_mut(Axis(2)) {
                    let mean = row.mean().unwrap_or(0.0);
                    let var = row.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
                    let denom = (var + NORM_EPS).sqrt();
                    row.mapv_inplace(|v| (v - mean) / denom);
                }
            }
        }
        for mut row in out.lanes_mut(Axis(2)) {
            row *= &self.gamma;
            row += &self.beta;
        }
        out
    }
}

fn mean_var(x: ArrayView2<'_, f32>, axis: Axis) -> (Array1<f32>, Array1<f32>) {
    let mean = x
        .mean_axis(axis)
        .unwrap_or_else(|| Array1::zeros(x.len_of(Axis(1 - axis.index()))));
    let centered = &x - &mean.view().insert_axis(axis);
    let var = centered
        .mapv(|v| v * v)
        .mean_axis(axis)
        .unwrap_or_else(|| Array1::zeros(mean.len()));
    (mean, var)
}

fn normalize_lane(row: &mut ndarray::ArrayViewMut1<'_, f32>, mean: &Array1<f32>, var: &Array1<f32>) {
    Zip::from(row).and(mean).and(var).for_each(|v, &m, &s2| {
        *v = (*v - m) / (s2 + NORM_EPS).sqrt();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_linear_shapes_and_determinism() {
        let mut rng1 = ChaCha8Rng::seed_from_u64(7);
        let mut rng2 = ChaCha8Rng::seed_from_u64(7);
        let l1 = Linear::new(3, 5, true, &mut rng1);
        let l2 = Linear::new(3, 5, true, &mut rng2);
        assert_eq!(l1.weight, l2.weight);

        let x = Array3::<f32>::ones((2, 4, 3));
        let y = l1.forward3(x.view()).unwrap();
        assert_eq!(y.dim(), (2, 4, 5));
        assert!(l1.forward(Array2::<f32>::zeros((1, 2)).view()).is_err());
    }

    #[test]
    fn test_masked_log_softmax_zero_mass_on_masked() {
        let logits = array![1.0_f32, 2.0, 3.0, 4.0];
        let mask = array![false, true, false, true];
        let log_p = masked_log_softmax(logits.view(), Some(mask.view())).unwrap();
        assert_eq!(log_p[1], f32::NEG_INFINITY);
        assert_eq!(log_p[3], f32::NEG_INFINITY);
        let p = log_p.mapv(f32::exp);
        assert_eq!(p[1], 0.0);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[0]);
    }

    #[test]
    fn test_masked_log_softmax_all_masked() {
        let logits = array![1.0_f32, 2.0];
        let mask = array![true, true];
        assert!(masked_log_softmax(logits.view(), Some(mask.view())).is_none());
    }

    #[test]
    fn test_attention_ignores_masked_keys() {
        let q = array![[1.0_f32, 0.0]];
        let k = array![[1.0_f32, 0.0], [0.0, 1.0]];
        let v = array![[10.0_f32, 0.0], [0.0, 10.0]];
        let mask = array![false, true];
        let out = attention(q.view(), k.view(), v.view(), Some(mask.view()));
        assert!((out[[0, 0]] - 10.0).abs() < 1e-5);
        assert!(out[[0, 1]].abs() < 1e-5);
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = Array3::from_shape_fn((2, 3, 4), |(b, n, d)| (b * 12 + n * 4 + d) as f32);
        let y = Norm::new(Normalization::Layer, 4).forward(&x);
        for row in y.lanes(Axis(2)) {
            assert!(row.mean().unwrap().abs() < 1e-5);
        }
    }

    #[test]
    fn test_instance_norm_per_instance() {
        let x = Array3::from_shape_fn((2, 5, 3), |(b, n, d)| (b as f32 + 1.0) * (n + d) as f32);
        let y = Norm::new(Normalization::Instance, 3).forward(&x);
        for inst in y.outer_iter() {
            let mean = inst.mean_axis(Axis(0)).unwrap();
            assert!(mean.iter().all(|m| m.abs() < 1e-5));
        }
    }

    #[test]
    fn test_batch_norm_independent_of_batch() {
        let x = Array3::from_shape_fn((3, 4, 2), |(b, n, d)| (b * 8 + n * 2 + d) as f32);
        let norm = Norm::new(Normalization::Batch, 2)
            .with_running_stats(array![1.0, 2.0], array![4.0, 1.0])
            .unwrap();
        let full = norm.forward(&x);
        let alone = norm.forward(&x.slice(s![1..2, .., ..]).to_owned());
        assert_eq!(full.slice(s![1..2, .., ..]), alone);
        let expected = (x[[0, 1, 0]] - 1.0) / (4.0 + NORM_EPS).sqrt();
        assert!((full[[0, 1, 0]] - expected).abs() < 1e-6);
        assert!(norm.clone().with_running_stats(array![0.0], array![1.0]).is_err());
        assert_eq!(Norm::new(Normalization::None, 2).forward(&x), x);
    }
}
