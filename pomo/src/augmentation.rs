// src/augmentation.rs
//
// Symmetry augmentation of 2-D coordinate features.
//
// Provides:
// - Dihedral-8: the 8 fixed images of the unit square (rotations + reflections)
// - Symmetric: a random rotation per row, plus a reflection for half the draws
// - Global min-max normalization with a zero-range guard
// - StateAugmentation: expands an InstanceBatch A times along the batch axis
//
// Layout: augmented row `k * B + b` is copy `k` of instance `b`. Copy 0 is the
// untransformed original when `first_aug_identity` is set.

use std::f32::consts::{PI, TAU};
use std::fmt;

use log::{info, warn};
use ndarray::{s, Array3, ArrayView3, Axis};
use rand::{Rng, RngCore};

use crate::batch::InstanceBatch;
use crate::config::AugmentationConfig;
use crate::error::{PomoError, Result};

/// Number of images produced by the dihedral transform.
pub const DIHEDRAL_ORDER: usize = 8;

/// Feature augmented when the config names none.
pub const DEFAULT_AUGMENT_FEATURE: &str = "locs";

fn check_xy(xy: &ArrayView3<'_, f32>, what: &str) -> Result<()> {
    let d = xy.len_of(Axis(2));
    if d != 2 {
        return Err(PomoError::shape(format!("{what} coordinate dim"), 2, d));
    }
    Ok(())
}

/// Image `k` of the point `(x, y)` under the dihedral group of the unit square.
///
/// Order: (x,y), (1-x,y), (x,1-y), (1-x,1-y), (y,x), (1-y,x), (y,1-x), (1-y,1-x).
#[inline]
pub fn dihedral_image(k: usize, x: f32, y: f32) -> (f32, f32) {
    match k {
        0 => (x, y),
        1 => (1.0 - x, y),
        2 => (x, 1.0 - y),
        3 => (1.0 - x, 1.0 - y),
        4 => (y, x),
        5 => (1.0 - y, x),
        6 => (y, 1.0 - x),
        7 => (1.0 - y, 1.0 - x),
        _ => unreachable!("dihedral image index {k} out of range"),
    }
}

/// Index of the image that undoes image `k`.
///
/// The two quarter-turns (5 and 6) invert each other; every other image is an
/// involution.
pub fn dihedral_inverse(k: usize) -> usize {
    match k {
        5 => 6,
        6 => 5,
        k if k < DIHEDRAL_ORDER => k,
        _ => unreachable!("dihedral image index {k} out of range"),
    }
}

/// Apply a single dihedral image to every point of a (batch, node, 2) tensor.
pub fn apply_dihedral(k: usize, xy: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
    check_xy(&xy, "dihedral")?;
    if k >= DIHEDRAL_ORDER {
        return Err(PomoError::config(
            "dihedral image",
            format!("index {k} out of range 0..{DIHEDRAL_ORDER}"),
        ));
    }
    Ok(Array3::from_shape_fn(xy.raw_dim(), |(b, n, c)| {
        let (u, v) = dihedral_image(k, xy[[b, n, 0]], xy[[b, n, 1]]);
        if c == 0 {
            u
        } else {
            v
        }
    }))
}

/// Stack the 8 dihedral images of `xy` along the batch axis: (B,N,2) -> (8B,N,2).
pub fn dihedral_8_augmentation(xy: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
    check_xy(&xy, "dihedral")?;
    let (b, n, _) = xy.dim();
    let mut out = Array3::<f32>::zeros((DIHEDRAL_ORDER * b, n, 2));
    for k in 0..DIHEDRAL_ORDER {
        let image = apply_dihedral(k, xy)?;
        out.slice_mut(s![k * b..(k + 1) * b, .., ..]).assign(&image);
    }
    Ok(out)
}

/// Dihedral augmentation of an input that may already be tiled 8 times.
///
/// With `reduce`, only the first `rows / 8` rows are used as the source so
/// the output keeps the input's batch size.
pub fn dihedral_8_augmentation_wrapper(xy: ArrayView3<'_, f32>, reduce: bool) -> Result<Array3<f32>> {
    if reduce {
        let rows = xy.len_of(Axis(0));
        if rows % DIHEDRAL_ORDER != 0 {
            return Err(PomoError::shape(
                "dihedral input rows",
                format!("a multiple of {DIHEDRAL_ORDER}"),
                rows,
            ));
        }
        dihedral_8_augmentation(xy.slice(s![..rows / DIHEDRAL_ORDER, .., ..]))
    } else {
        dihedral_8_augmentation(xy)
    }
}

/// Rotate each row about `(offset, offset)` by `phi[row]`; rows with
/// `phi > 2*pi` additionally swap their axes.
pub fn symmetric_transform(xy: ArrayView3<'_, f32>, phi: &[f32], offset: f32) -> Result<Array3<f32>> {
    check_xy(&xy, "symmetric")?;
    let (b, n, _) = xy.dim();
    if phi.len() != b {
        return Err(PomoError::shape("rotation angles", b, phi.len()));
    }

    let mut out = Array3::<f32>::zeros((b, n, 2));
    for (row, &angle) in phi.iter().enumerate() {
        let (sin, cos) = angle.sin_cos();
        let reflect = angle > TAU;
        for node in 0..n {
            let x = xy[[row, node, 0]] - offset;
            let y = xy[[row, node, 1]] - offset;
            let x_prime = cos * x - sin * y;
            let y_prime = sin * x + cos * y;
            let (u, v) = if reflect {
                (y_prime, x_prime)
            } else {
                (x_prime, y_prime)
            };
            out[[row, node, 0]] = u + offset;
            out[[row, node, 1]] = v + offset;
        }
    }
    Ok(out)
}

/// Random rotation/reflection of every row of an already-tiled tensor.
///
/// One angle in `[0, 4*pi)` is drawn per row: below `2*pi` it is a pure
/// rotation, above it the rotation is followed by an axis swap. Unless
/// `first_augment` is set, the first `rows / num_augment` rows get angle 0.
pub fn symmetric_augmentation(
    xy: ArrayView3<'_, f32>,
    num_augment: usize,
    first_augment: bool,
    offset: f32,
    rng: &mut dyn RngCore,
) -> Result<Array3<f32>> {
    if num_augment == 0 {
        return Err(PomoError::config("num_augment", "must be >= 1"));
    }
    let rows = xy.len_of(Axis(0));
    let mut phi: Vec<f32> = (0..rows).map(|_| rng.gen::<f32>() * 4.0 * PI).collect();
    if !first_augment {
        for angle in phi.iter_mut().take(rows / num_augment) {
            *angle = 0.0;
        }
    }
    symmetric_transform(xy, &phi, offset)
}

/// Rescale the whole tensor to [0, 1] using its global min and max.
///
/// A zero or non-finite range is reported as `NumericDegeneracy`.
pub fn min_max_normalize(x: &Array3<f32>) -> Result<Array3<f32>> {
    let min = x.fold(f32::INFINITY, |m, &v| m.min(v));
    let max = x.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Err(PomoError::NumericDegeneracy {
            context: format!("min-max normalization over range [{min}, {max}]"),
        });
    }
    Ok(x.mapv(|v| (v - min) / range))
}

/// A coordinate transform usable by `StateAugmentation`.
///
/// `augment` receives the batch already tiled `num_augment` times and must
/// return a tensor of the same shape.
pub trait AugmentTransform: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn augment(
        &self,
        xy: ArrayView3<'_, f32>,
        num_augment: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Array3<f32>>;

    /// Some transforms only make sense for one copy count.
    fn required_num_augment(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Dihedral8;

impl AugmentTransform for Dihedral8 {
    fn name(&self) -> &str {
        "dihedral8"
    }

    fn augment(
        &self,
        xy: ArrayView3<'_, f32>,
        _num_augment: usize,
        _rng: &mut dyn RngCore,
    ) -> Result<Array3<f32>> {
        dihedral_8_augmentation_wrapper(xy, true)
    }

    fn required_num_augment(&self) -> Option<usize> {
        Some(DIHEDRAL_ORDER)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Symmetric {
    pub offset: f32,
}

impl Default for Symmetric {
    fn default() -> Self {
        Self { offset: 0.5 }
    }
}

impl AugmentTransform for Symmetric {
    fn name(&self) -> &str {
        "symmetric"
    }

    fn augment(
        &self,
        xy: ArrayView3<'_, f32>,
        num_augment: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Array3<f32>> {
        symmetric_augmentation(xy, num_augment, false, self.offset, rng)
    }
}

/// Built-in transform names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugmentFn {
    Dihedral8,
    Symmetric,
}

impl AugmentFn {
    pub fn parse(name: &str) -> Result<AugmentFn> {
        match name.trim().to_ascii_lowercase().as_str() {
            "dihedral8" => Ok(AugmentFn::Dihedral8),
            "symmetric" => Ok(AugmentFn::Symmetric),
            other => Err(PomoError::config(
                "augment_fn",
                format!("unknown augment_fn '{other}' (expected dihedral8|symmetric)"),
            )),
        }
    }

    pub fn build(self, offset: f32) -> Box<dyn AugmentTransform> {
        match self {
            AugmentFn::Dihedral8 => Box::new(Dihedral8),
            AugmentFn::Symmetric => Box::new(Symmetric { offset }),
        }
    }
}

/// Expands a batch `num_augment` times via a symmetry transform.
#[derive(Debug)]
pub struct StateAugmentation {
    transform: Box<dyn AugmentTransform>,
    num_augment: usize,
    feats: Vec<String>,
    normalize: bool,
    first_aug_identity: bool,
}

impl StateAugmentation {
    /// Build from config, resolving `augment_fn` by name.
    pub fn new(config: &AugmentationConfig) -> Result<Self> {
        config.validate()?;
        let transform = AugmentFn::parse(&config.augment_fn)?.build(config.offset);
        Self::with_transform(config, transform)
    }

    /// Build with a caller-supplied transform; `config.augment_fn` is ignored.
    pub fn with_transform(
        config: &AugmentationConfig,
        transform: Box<dyn AugmentTransform>,
    ) -> Result<Self> {
        config.validate_structure()?;
        if let Some(required) = transform.required_num_augment() {
            if config.num_augment != required {
                return Err(PomoError::config(
                    "num_augment",
                    format!(
                        "the `{}` augmentation requires num_augment == {required}, got {}",
                        transform.name(),
                        config.num_augment
                    ),
                ));
            }
        }

        let feats = match &config.feats {
            Some(feats) => feats.clone(),
            None => {
                info!("Default augment feature: `{DEFAULT_AUGMENT_FEATURE}`");
                vec![DEFAULT_AUGMENT_FEATURE.to_string()]
            }
        };

        Ok(Self {
            transform,
            num_augment: config.num_augment,
            feats,
            normalize: config.normalize,
            first_aug_identity: config.first_aug_identity,
        })
    }

    pub fn num_augment(&self) -> usize {
        self.num_augment
    }

    pub fn feats(&self) -> &[String] {
        &self.feats
    }

    pub fn transform_name(&self) -> &str {
        self.transform.name()
    }

    /// Return a batch of size `num_augment * B` holding the augmented copies.
    ///
    /// Order per feature: transform, then normalize, then restore the
    /// identity slice (rows `0..B`) to the raw input values.
    pub fn apply(&self, batch: &InstanceBatch, rng: &mut dyn RngCore) -> Result<InstanceBatch> {
        let b = batch.batch_size();
        let mut augmented = batch.batchify(self.num_augment)?;

        for feat in &self.feats {
            let original = batch.require(feat)?;
            let tiled = augmented.require(feat)?;
            let mut out = self.transform.augment(tiled.view(), self.num_augment, rng)?;
            if out.dim() != tiled.dim() {
                return Err(PomoError::shape(
                    format!("`{}` output for '{feat}'", self.transform.name()),
                    format!("{:?}", tiled.dim()),
                    format!("{:?}", out.dim()),
                ));
            }

            if self.normalize {
                match min_max_normalize(&out) {
                    Ok(normalized) => out = normalized,
                    Err(err) => warn!("skipping normalization of '{feat}': {err}"),
                }
            }

            if self.first_aug_identity {
                out.slice_mut(s![..b, .., ..]).assign(original);
            }

            if batch.is_global(feat) {
                augmented.insert_global(feat, out)?;
            } else {
                augmented.insert(feat, out)?;
            }
        }

        Ok(augmented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn random_locs(b: usize, n: usize, seed: u64) -> Array3<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array3::from_shape_fn((b, n, 2), |_| rng.gen::<f32>())
    }

    fn max_abs_diff(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
        (a - b).fold(0.0_f32, |m, &v| m.max(v.abs()))
    }

    #[test]
    fn test_dihedral_shape_and_order() {
        let xy = random_locs(3, 5, 1);
        let aug = dihedral_8_augmentation(xy.view()).unwrap();
        assert_eq!(aug.dim(), (24, 5, 2));

        // block 0 is the identity, block 4 swaps axes
        assert_eq!(aug.slice(s![0..3, .., ..]), xy);
        for b in 0..3 {
            for n in 0..5 {
                assert_eq!(aug[[12 + b, n, 0]], xy[[b, n, 1]]);
                assert_eq!(aug[[12 + b, n, 1]], xy[[b, n, 0]]);
            }
        }
    }

    #[test]
    fn test_dihedral_inverse_round_trip() {
        let xy = random_locs(4, 7, 2);
        let aug = dihedral_8_augmentation(xy.view()).unwrap();
        for k in 0..DIHEDRAL_ORDER {
            let image = aug.slice(s![k * 4..(k + 1) * 4, .., ..]);
            let back = apply_dihedral(dihedral_inverse(k), image).unwrap();
            assert!(max_abs_diff(&back, &xy) < 1e-6, "image {k} did not invert");
        }
    }

    #[test]
    fn test_dihedral_identity_slot_twice() {
        let xy = random_locs(2, 6, 3);
        let first = dihedral_8_augmentation(xy.view()).unwrap();
        let again = dihedral_8_augmentation(first.slice(s![0..2, .., ..])).unwrap();
        assert_eq!(again.slice(s![0..2, .., ..]), xy);
    }

    #[test]
    fn test_dihedral_rejects_non_2d_coords() {
        let xyz = Array3::<f32>::zeros((1, 3, 3));
        assert!(dihedral_8_augmentation(xyz.view()).is_err());
    }

    #[test]
    fn test_wrapper_reduce_keeps_batch_size() {
        let xy = random_locs(2, 4, 4);
        let tiled = crate::batch::batchify(&xy, 8).unwrap();
        let out = dihedral_8_augmentation_wrapper(tiled.view(), true).unwrap();
        assert_eq!(out.dim(), tiled.dim());
        assert!(dihedral_8_augmentation_wrapper(xy.view(), true).is_err());
    }

    #[test]
    fn test_symmetric_zero_angle_is_identity() {
        let xy = random_locs(2, 5, 5);
        let out = symmetric_transform(xy.view(), &[0.0, 0.0], 0.5).unwrap();
        assert!(max_abs_diff(&out, &xy) < 1e-6);
    }

    #[test]
    fn test_symmetric_reflection_above_two_pi() {
        // rotation by 2*pi + tiny angle ~ identity, then axis swap
        let xy = random_locs(1, 4, 6);
        let out = symmetric_transform(xy.view(), &[TAU + 1e-4], 0.5).unwrap();
        for n in 0..4 {
            assert!((out[[0, n, 0]] - xy[[0, n, 1]]).abs() < 1e-3);
            assert!((out[[0, n, 1]] - xy[[0, n, 0]]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_symmetric_augmentation_first_block_unrotated() {
        let xy = random_locs(3, 5, 7);
        let tiled = crate::batch::batchify(&xy, 4).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let out = symmetric_augmentation(tiled.view(), 4, false, 0.5, &mut rng).unwrap();
        let first = out.slice(s![0..3, .., ..]).to_owned();
        assert!(max_abs_diff(&first, &xy) < 1e-6);
    }

    #[test]
    fn test_min_max_normalize() {
        let x = Array3::from_shape_vec((1, 2, 2), vec![1.0, 3.0, 5.0, 2.0]).unwrap();
        let y = min_max_normalize(&x).unwrap();
        assert_eq!(y.as_slice().unwrap(), &[0.0, 0.5, 1.0, 0.25]);
    }

    #[test]
    fn test_min_max_normalize_constant_is_degenerate() {
        let x = Array3::from_elem((2, 3, 2), 0.7_f32);
        match min_max_normalize(&x) {
            Err(PomoError::NumericDegeneracy { .. }) => {}
            other => panic!("expected NumericDegeneracy, got {other:?}"),
        }
    }

    #[test]
    fn test_augment_fn_parse() {
        assert_eq!(AugmentFn::parse("dihedral8").unwrap(), AugmentFn::Dihedral8);
        assert_eq!(AugmentFn::parse("Symmetric").unwrap(), AugmentFn::Symmetric);
        assert!(AugmentFn::parse("unknown").unwrap_err().is_configuration());
    }

    #[test]
    fn test_dihedral_requires_eight() {
        let cfg = AugmentationConfig {
            num_augment: 4,
            ..AugmentationConfig::dihedral8()
        };
        assert!(StateAugmentation::new(&cfg).unwrap_err().is_configuration());
        assert!(StateAugmentation::new(&AugmentationConfig::dihedral8()).is_ok());
    }

    #[test]
    fn test_default_feature_is_locs() {
        let aug = StateAugmentation::new(&AugmentationConfig::default()).unwrap();
        assert_eq!(aug.feats(), &["locs".to_string()]);
        assert_eq!(aug.transform_name(), "symmetric");
    }

    #[test]
    fn test_identity_slice_holds_raw_values_when_normalizing() {
        // coordinates outside [0,1] so normalization changes them
        let xy = random_locs(2, 5, 8).mapv(|v| v * 10.0 - 3.0);
        let batch = InstanceBatch::new("locs", xy.clone());
        let cfg = AugmentationConfig {
            normalize: true,
            ..AugmentationConfig::symmetric(4)
        };
        let aug = StateAugmentation::new(&cfg).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(10);
        let out = aug.apply(&batch, &mut rng).unwrap();
        let locs = out.get("locs").unwrap();
        assert_eq!(locs.slice(s![0..2, .., ..]), xy);
        let rest = locs.slice(s![2.., .., ..]);
        assert!(rest.iter().all(|&v| (-1e-6..=1.0 + 1e-6).contains(&v)));
    }

    #[test]
    fn test_constant_feature_skips_normalization() {
        let xy = Array3::from_elem((1, 3, 2), 0.5_f32);
        let batch = InstanceBatch::new("locs", xy);
        let cfg = AugmentationConfig {
            normalize: true,
            ..AugmentationConfig::dihedral8()
        };
        let aug = StateAugmentation::new(&cfg).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let out = aug.apply(&batch, &mut rng).unwrap();
        // all images of the square's centre are the centre; no NaN leaked
        assert!(out.get("locs").unwrap().iter().all(|&v| v == 0.5));
    }
}
