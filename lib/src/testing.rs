//! Seeded random weights shared by the unit tests

use crate::weights::{LayerRecord, TensorRecord};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

pub(crate) fn rng(seed: u64) -> Pcg32 {
    Pcg32::seed_from_u64(seed)
}

pub(crate) fn tensor(rng: &mut Pcg32, shape: Vec<usize>, scale: f32) -> TensorRecord {
    let len = shape.iter().product();
    let data = (0..len).map(|_| rng.gen_range(-scale..scale)).collect();
    TensorRecord { shape, data }
}

/// A `k`x`k` convolution with unit padding and a bias
pub(crate) fn conv_record(rng: &mut Pcg32, input: usize, output: usize, k: usize) -> LayerRecord {
    let scale = 1.0 / ((input * k * k) as f32).sqrt();
    let weight = tensor(rng, vec![output, input, k, k], scale);
    let bias = tensor(rng, vec![output], 0.1);
    LayerRecord::conv2d(weight, Some(bias), 1, k / 2)
}
