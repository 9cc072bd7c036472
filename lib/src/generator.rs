//! Feed-forward ResNet generator, as used by CycleGAN style checkpoints.
//!
//! The layout is a 7x7 stem, two strided downsampling convolutions, a stack
//! of residual blocks, two transposed convolutions back to the input size and
//! a 7x7 head squashed by `tanh`. Every normalization is an instance norm
//! without learned parameters, so only convolutions carry weights.

use crate::{
    errors::InvalidRange,
    tensor::{self, ImageTensor, Window},
    weights::StateDict,
    Error,
};
use ndarray::{Array1, Array2, Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path};

const INSTANCE_NORM_EPS: f32 = 1e-5;

/// Hyper-parameters of the generator, they must match the checkpoints
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorArch {
    pub input_channels: usize,
    pub output_channels: usize,
    /// Filters of the first convolution, doubled by each downsampling
    pub ngf: usize,
    /// Number of residual blocks
    pub n_blocks: usize,
}

impl Default for GeneratorArch {
    fn default() -> Self {
        Self {
            input_channels: 3,
            output_channels: 3,
            ngf: 64,
            n_blocks: 9,
        }
    }
}

struct Slot {
    prefix: String,
    shape: [usize; 4],
    transposed: bool,
}

impl Slot {
    fn conv(prefix: String, out: usize, input: usize, k: usize) -> Self {
        Self {
            prefix,
            shape: [out, input, k, k],
            transposed: false,
        }
    }

    fn transposed(prefix: String, input: usize, out: usize, k: usize) -> Self {
        Self {
            prefix,
            shape: [input, out, k, k],
            transposed: true,
        }
    }

    fn out_channels(&self) -> usize {
        if self.transposed {
            self.shape[1]
        } else {
            self.shape[0]
        }
    }
}

impl GeneratorArch {
    pub fn validate(&self) -> Result<(), Error> {
        let counts = [
            ("input-channels", self.input_channels),
            ("output-channels", self.output_channels),
            ("ngf", self.ngf),
        ];

        for &(name, value) in counts.iter() {
            if value == 0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 1.0,
                    max: 4096.0,
                    value: 0.0,
                    name,
                }));
            }
        }

        Ok(())
    }

    /// Every convolution in evaluation order, named the way checkpoints name
    /// the `nn.Sequential` entries
    fn slots(&self) -> Vec<Slot> {
        let ngf = self.ngf;
        let n = self.n_blocks;
        let mut slots = Vec::with_capacity(2 * n + 6);

        slots.push(Slot::conv("model.1".to_owned(), ngf, self.input_channels, 7));
        slots.push(Slot::conv("model.4".to_owned(), ngf * 2, ngf, 3));
        slots.push(Slot::conv("model.7".to_owned(), ngf * 4, ngf * 2, 3));

        for b in 0..n {
            for inner in &[1, 5] {
                slots.push(Slot::conv(
                    format!("model.{}.conv_block.{}", 10 + b, inner),
                    ngf * 4,
                    ngf * 4,
                    3,
                ));
            }
        }

        slots.push(Slot::transposed(format!("model.{}", 10 + n), ngf * 4, ngf * 2, 3));
        slots.push(Slot::transposed(format!("model.{}", 13 + n), ngf * 2, ngf, 3));
        slots.push(Slot::conv(
            format!("model.{}", 17 + n),
            self.output_channels,
            ngf,
            7,
        ));

        slots
    }

    /// Name and shape of every tensor a checkpoint must provide
    pub fn parameters(&self) -> Vec<(String, Vec<usize>)> {
        self.slots()
            .into_iter()
            .flat_map(|slot| {
                let bias = vec![slot.out_channels()];
                vec![
                    (format!("{}.weight", slot.prefix), slot.shape.to_vec()),
                    (format!("{}.bias", slot.prefix), bias),
                ]
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
struct Unit {
    weight: Array2<f32>,
    bias: Array1<f32>,
    window: Window,
}

impl Unit {
    fn conv(&self, x: ArrayView4<'_, f32>) -> Result<Array4<f32>, Error> {
        tensor::conv2d(x, &self.weight, Some(&self.bias), self.window)
    }

    fn conv_transpose(&self, x: ArrayView4<'_, f32>) -> Result<Array4<f32>, Error> {
        tensor::conv_transpose2d(x, &self.weight, Some(&self.bias), self.window, 1)
    }
}

fn norm_relu(x: Array4<f32>) -> Array4<f32> {
    tensor::relu(tensor::instance_norm(x.view(), INSTANCE_NORM_EPS).view())
}

/// A loaded, frozen generator
#[derive(Clone, Debug)]
pub struct ResnetGenerator {
    arch: GeneratorArch,
    stem: Unit,
    down: Vec<Unit>,
    blocks: Vec<(Unit, Unit)>,
    up: Vec<Unit>,
    head: Unit,
}

impl ResnetGenerator {
    pub fn load<P: AsRef<Path>>(path: P, arch: GeneratorArch) -> Result<Self, Error> {
        let path = path.as_ref();
        let dict = StateDict::load(path)?;
        Self::from_state_dict(&dict, arch).map_err(|e| e.at_path(path))
    }

    /// Builds the generator from a checkpoint. Every expected tensor must be
    /// present with the exact shape, anything else in the checkpoint is
    /// ignored.
    pub fn from_state_dict(dict: &StateDict, arch: GeneratorArch) -> Result<Self, Error> {
        arch.validate()?;

        let slots = arch.slots();
        let mut used = HashSet::with_capacity(slots.len() * 2);
        let mut units = Vec::with_capacity(slots.len());

        for slot in &slots {
            let weight_name = format!("{}.weight", slot.prefix);
            let bias_name = format!("{}.bias", slot.prefix);

            let weight = dict.get(&weight_name)?;
            if weight.shape != slot.shape {
                return Err(Error::weights(
                    None,
                    format!(
                        "'{}' has shape {:?}, but {:?} was expected",
                        weight_name, weight.shape, slot.shape
                    ),
                ));
            }

            let (matrix, _) = weight.to_kernel_matrix(&weight_name)?;
            let bias = dict.get(&bias_name)?.to_vector(&bias_name, slot.out_channels())?;

            used.insert(weight_name);
            used.insert(bias_name);

            let k = slot.shape[2];
            let window = match k {
                7 => Window::new(7, 1, 0),
                _ if slot.transposed => Window::new(3, 2, 1),
                _ => Window::new(3, 1, 0),
            };

            units.push(Unit {
                weight: matrix,
                bias,
                window,
            });
        }

        let ignored = dict.tensors.keys().filter(|k| !used.contains(*k)).count();
        if ignored > 0 {
            tracing::debug!(ignored, "checkpoint carries tensors the generator doesn't use");
        }

        let mut units = units.into_iter();
        let mut next = || {
            units
                .next()
                .ok_or_else(|| Error::weights(None, "generator layout is incomplete"))
        };

        let stem = next()?;
        let mut down = vec![next()?, next()?];
        for unit in &mut down {
            unit.window = Window::new(3, 2, 1);
        }

        let mut blocks = Vec::with_capacity(arch.n_blocks);
        for _ in 0..arch.n_blocks {
            blocks.push((next()?, next()?));
        }

        let up = vec![next()?, next()?];
        let head = next()?;

        Ok(Self {
            arch,
            stem,
            down,
            blocks,
            up,
            head,
        })
    }

    pub fn arch(&self) -> &GeneratorArch {
        &self.arch
    }

    /// Runs the generator on an input in `[-1, 1]`, the output is in `[-1, 1]`
    pub fn forward(&self, input: &ImageTensor) -> Result<ImageTensor, Error> {
        let mut x = self
            .stem
            .conv(tensor::reflection_pad(input.view(), 3).view())?;
        x = norm_relu(x);

        for unit in &self.down {
            x = norm_relu(unit.conv(x.view())?);
        }

        for (first, second) in &self.blocks {
            let y = norm_relu(first.conv(tensor::reflection_pad(x.view(), 1).view())?);
            let y = second.conv(tensor::reflection_pad(y.view(), 1).view())?;
            let y = tensor::instance_norm(y.view(), INSTANCE_NORM_EPS);
            x = x + y;
        }

        for unit in &self.up {
            x = norm_relu(unit.conv_transpose(x.view())?);
        }

        let x = self.head.conv(tensor::reflection_pad(x.view(), 3).view())?;
        ImageTensor::new(tensor::tanh(x.view()))
    }
}
