// src/env/generator.rs
//
// Seeded instance generators.
//
// Deterministic given the RNG: the same ChaCha8 seed always produces the
// same batch. Coordinates are uniform in the unit square.

use ndarray::Array3;
use rand::Rng;

use crate::batch::InstanceBatch;
use crate::error::{PomoError, Result};

/// Inclusive integer demand range before normalisation by capacity.
pub const MIN_DEMAND: u32 = 1;
pub const MAX_DEMAND: u32 = 9;

/// Vehicle capacity used for a CVRP instance with `num_customers` customers.
pub fn vrp_capacity_for(num_customers: usize) -> f32 {
    match num_customers {
        0..=10 => 20.0,
        11..=20 => 30.0,
        21..=50 => 40.0,
        _ => 50.0,
    }
}

fn uniform_locs<R: Rng + ?Sized>(batch_size: usize, num_nodes: usize, rng: &mut R) -> Array3<f32> {
    let mut locs = Array3::zeros((batch_size, num_nodes, 2));
    for v in locs.iter_mut() {
        *v = rng.gen::<f32>();
    }
    locs
}

/// Random TSP batch with `locs` (B, N, 2).
pub fn generate_tsp<R: Rng + ?Sized>(
    batch_size: usize,
    num_nodes: usize,
    rng: &mut R,
) -> Result<InstanceBatch> {
    if batch_size == 0 || num_nodes == 0 {
        return Err(PomoError::config(
            "generate_tsp",
            "batch_size and num_nodes must be >= 1",
        ));
    }
    Ok(InstanceBatch::new(
        "locs",
        uniform_locs(batch_size, num_nodes, rng),
    ))
}

/// Random CVRP batch with a depot plus `num_customers` customers.
///
/// Demands are drawn from `MIN_DEMAND..=MAX_DEMAND` and divided by the
/// capacity, so `capacity` is stored as 1.0.
pub fn generate_cvrp<R: Rng + ?Sized>(
    batch_size: usize,
    num_customers: usize,
    rng: &mut R,
) -> Result<InstanceBatch> {
    if batch_size == 0 || num_customers == 0 {
        return Err(PomoError::config(
            "generate_cvrp",
            "batch_size and num_customers must be >= 1",
        ));
    }
    let n = num_customers + 1;
    let capacity = vrp_capacity_for(num_customers);
    let mut demand = Array3::zeros((batch_size, n, 1));
    for b in 0..batch_size {
        for j in 1..n {
            demand[[b, j, 0]] = rng.gen_range(MIN_DEMAND..=MAX_DEMAND) as f32 / capacity;
        }
    }

    let mut batch = InstanceBatch::new("locs", uniform_locs(batch_size, n, rng));
    batch.insert("demand", demand)?;
    batch.insert_global("capacity", Array3::ones((batch_size, 1, 1)))?;
    Ok(batch)
}
