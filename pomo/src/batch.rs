// src/batch.rs
//
// Instance batches and replica layout.
//
// An InstanceBatch maps feature names to dense (batch, node, dim) arrays.
// Replication (augmentation copies, multi-start replicas) is block-major:
// row `k * B + b` is replica `k` of instance `b`.

use std::collections::BTreeMap;

use ndarray::{concatenate, Array, Array3, ArrayView, Axis, Dimension, RemoveAxis};

use crate::error::{PomoError, Result};

/// A batch of problem instances.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceBatch {
    batch_size: usize,
    num_nodes: usize,
    features: BTreeMap<String, Array3<f32>>,
    /// Features with a node axis of length 1 (per-instance scalars).
    globals: BTreeMap<String, Array3<f32>>,
}

impl InstanceBatch {
    /// Create a batch from its first node-indexed feature.
    pub fn new(name: &str, values: Array3<f32>) -> Self {
        let (b, n, _) = values.dim();
        let mut features = BTreeMap::new();
        features.insert(name.to_string(), values);
        Self {
            batch_size: b,
            num_nodes: n,
            features,
            globals: BTreeMap::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Insert (or replace) a node-indexed feature.
    pub fn insert(&mut self, name: &str, values: Array3<f32>) -> Result<()> {
        let (b, n, _) = values.dim();
        if b != self.batch_size {
            return Err(PomoError::shape(
                format!("feature '{name}' batch dim"),
                self.batch_size,
                b,
            ));
        }
        if n != self.num_nodes {
            return Err(PomoError::shape(
                format!("feature '{name}' node dim"),
                self.num_nodes,
                n,
            ));
        }
        self.features.insert(name.to_string(), values);
        Ok(())
    }

    /// Insert a per-instance feature of shape (batch, 1, dim).
    pub fn insert_global(&mut self, name: &str, values: Array3<f32>) -> Result<()> {
        let (b, n, _) = values.dim();
        if b != self.batch_size {
            return Err(PomoError::shape(
                format!("global '{name}' batch dim"),
                self.batch_size,
                b,
            ));
        }
        if n != 1 {
            return Err(PomoError::shape(format!("global '{name}' node dim"), 1, n));
        }
        self.globals.insert(name.to_string(), values);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Array3<f32>> {
        self.features.get(name).or_else(|| self.globals.get(name))
    }

    /// True when `name` is a per-instance global rather than a node feature.
    pub fn is_global(&self, name: &str) -> bool {
        !self.features.contains_key(name) && self.globals.contains_key(name)
    }

    /// Like `get` but a missing feature is a precondition failure.
    pub fn require(&self, name: &str) -> Result<&Array3<f32>> {
        self.get(name).ok_or_else(|| {
            PomoError::shape(
                "instance batch features",
                format!("a feature named '{name}'"),
                format!("{:?}", self.feature_names()),
            )
        })
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.features
            .keys()
            .chain(self.globals.keys())
            .map(String::as_str)
            .collect()
    }

    /// Tile every feature `n` times along the batch axis.
    pub fn batchify(&self, n: usize) -> Result<InstanceBatch> {
        if n == 0 {
            return Err(PomoError::config("batchify", "repeat count must be >= 1"));
        }
        let tile = |m: &BTreeMap<String, Array3<f32>>| -> Result<BTreeMap<String, Array3<f32>>> {
            m.iter()
                .map(|(k, v)| Ok((k.clone(), batchify(v, n)?)))
                .collect()
        };
        Ok(InstanceBatch {
            batch_size: self.batch_size * n,
            num_nodes: self.num_nodes,
            features: tile(&self.features)?,
            globals: tile(&self.globals)?,
        })
    }
}

/// Repeat `x` `n` times along axis 0, block-major.
pub fn batchify<A, D>(x: &Array<A, D>, n: usize) -> Result<Array<A, D>>
where
    A: Clone,
    D: Dimension + RemoveAxis,
{
    let views: Vec<ArrayView<A, D>> = (0..n).map(|_| x.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Split a block-major `(n * B, rest..)` array into `(B, n, rest..)`.
///
/// `out[b, k, ..] == x[k * B + b, ..]`.
pub fn unbatchify<A, D>(x: &Array<A, D>, n: usize) -> Result<Array<A, D::Larger>>
where
    A: Clone,
    D: Dimension,
{
    let rows = x.len_of(Axis(0));
    if n == 0 || rows % n != 0 {
        return Err(PomoError::shape(
            "unbatchify leading dim",
            format!("a multiple of {n}"),
            rows,
        ));
    }
    let b = rows / n;
    let mut shape: Vec<usize> = Vec::with_capacity(x.ndim() + 1);
    shape.push(n);
    shape.push(b);
    shape.extend_from_slice(&x.shape()[1..]);

    let split = x
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(shape)?
        .into_dimensionality::<D::Larger>()?;
    let mut swapped = split;
    swapped.swap_axes(0, 1);
    Ok(swapped.as_standard_layout().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn locs(b: usize, n: usize) -> Array3<f32> {
        Array3::from_shape_fn((b, n, 2), |(i, j, k)| (i * 100 + j * 10 + k) as f32)
    }

    #[test]
    fn test_insert_checks_batch_and_node_dims() {
        let mut batch = InstanceBatch::new("locs", locs(3, 5));
        assert!(batch.insert("demand", Array3::zeros((3, 5, 1))).is_ok());
        assert!(batch.insert("demand", Array3::zeros((2, 5, 1))).is_err());
        assert!(batch.insert("demand", Array3::zeros((3, 4, 1))).is_err());
        assert!(batch.insert_global("capacity", Array3::ones((3, 1, 1))).is_ok());
        assert!(batch.insert_global("capacity", Array3::ones((3, 2, 1))).is_err());
        assert_eq!(batch.feature_names(), vec!["demand", "locs", "capacity"]);
    }

    #[test]
    fn test_require_missing_feature() {
        let batch = InstanceBatch::new("locs", locs(1, 2));
        assert!(batch.require("locs").is_ok());
        assert!(batch.require("demand").is_err());
    }

    #[test]
    fn test_batchify_block_layout() {
        let x = locs(2, 3);
        let y = batchify(&x, 3).unwrap();
        assert_eq!(y.dim(), (6, 3, 2));
        for k in 0..3 {
            for b in 0..2 {
                assert_eq!(y.index_axis(Axis(0), k * 2 + b), x.index_axis(Axis(0), b));
            }
        }
    }

    #[test]
    fn test_unbatchify_inverts_layout() {
        let x: Array2<f32> = array![[0.0], [1.0], [10.0], [11.0], [20.0], [21.0]];
        // rows: replica k, instance b -> value 10k + b
        let y = unbatchify(&x, 3).unwrap();
        assert_eq!(y.dim(), (2, 3, 1));
        for b in 0..2 {
            for k in 0..3 {
                assert_eq!(y[[b, k, 0]], (10 * k + b) as f32);
            }
        }
    }

    #[test]
    fn test_unbatchify_rejects_ragged() {
        let x: Array2<f32> = Array2::zeros((5, 2));
        assert!(unbatchify(&x, 2).is_err());
    }

    #[test]
    fn test_batch_batchify_keeps_globals() {
        let mut batch = InstanceBatch::new("locs", locs(2, 4));
        batch
            .insert_global("capacity", Array3::from_elem((2, 1, 1), 5.0))
            .unwrap();
        let tiled = batch.batchify(4).unwrap();
        assert_eq!(tiled.batch_size(), 8);
        assert_eq!(tiled.num_nodes(), 4);
        assert_eq!(tiled.get("capacity").unwrap().dim(), (8, 1, 1));
    }
}
