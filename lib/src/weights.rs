//! On-disk representation of network weights.
//!
//! Weights are plain `serde` data encoded with `bincode`. Two containers
//! exist: a [`StateDict`] maps parameter names to tensors for a network whose
//! architecture is known in code, while a [`BackboneArchive`] carries the
//! layer sequence itself, which is what a shrunk backbone is saved as.

use crate::Error;
use bincode::Options;
use ndarray::{Array1, Array2};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// A dense `f32` tensor in row-major order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, Error> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::weights(
                None,
                format!(
                    "tensor of shape {:?} needs {} values, but {} were provided",
                    shape,
                    expected,
                    data.len()
                ),
            ));
        }

        Ok(Self { shape, data })
    }

    /// Checks the shape against `expected` and returns the data as a vector
    pub(crate) fn to_vector(&self, name: &str, expected: usize) -> Result<Array1<f32>, Error> {
        if self.shape != [expected] || self.data.len() != expected {
            return Err(Error::weights(
                None,
                format!(
                    "'{}' has shape {:?}, but [{}] was expected",
                    name, self.shape, expected
                ),
            ));
        }

        Ok(Array1::from(self.data.clone()))
    }

    /// Interprets a `(d0, d1, k, k)` tensor as a `(d0, d1 * k * k)` matrix.
    /// Returns the matrix along with `(d0, d1, k)`.
    pub(crate) fn to_kernel_matrix(
        &self,
        name: &str,
    ) -> Result<(Array2<f32>, (usize, usize, usize)), Error> {
        let (d0, d1, kh, kw) = match self.shape.as_slice() {
            [d0, d1, kh, kw] => (*d0, *d1, *kh, *kw),
            _ => {
                return Err(Error::weights(
                    None,
                    format!("'{}' has shape {:?}, but a 4D kernel was expected", name, self.shape),
                ))
            }
        };

        if kh != kw {
            return Err(Error::weights(
                None,
                format!("'{}' has a non-square {}x{} kernel", name, kh, kw),
            ));
        }

        let matrix = Array2::from_shape_vec((d0, d1 * kh * kw), self.data.clone()).map_err(|e| {
            Error::weights(None, format!("'{}' could not be reshaped: {}", name, e))
        })?;

        Ok((matrix, (d0, d1, kh)))
    }
}

/// Named parameters of a network, keyed like `features.0.weight`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub tensors: BTreeMap<String, TensorRecord>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, tensor: TensorRecord) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&TensorRecord, Error> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::weights(None, format!("missing tensor '{}'", name)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        read_bincode(path.as_ref())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        write_bincode(path.as_ref(), self)
    }
}

/// One layer of a serialized backbone.
///
/// `kind` is kept as the free-form name the layer was exported with, it is
/// only interpreted when the backbone is walked by the feature graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub kind: String,
    #[serde(default)]
    pub kernel_size: usize,
    #[serde(default)]
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
    #[serde(default)]
    pub eps: f32,
    #[serde(default)]
    pub tensors: BTreeMap<String, TensorRecord>,
}

impl LayerRecord {
    /// A layer without hyper-parameters or tensors, eg. `ReLU`
    pub fn bare<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            kernel_size: 0,
            stride: 0,
            padding: 0,
            eps: 0.0,
            tensors: BTreeMap::new(),
        }
    }

    pub fn conv2d(weight: TensorRecord, bias: Option<TensorRecord>, stride: usize, padding: usize) -> Self {
        let mut record = Self::bare("Conv2d");
        record.kernel_size = weight.shape.last().copied().unwrap_or(0);
        record.stride = stride;
        record.padding = padding;
        record.tensors.insert("weight".to_owned(), weight);
        if let Some(bias) = bias {
            record.tensors.insert("bias".to_owned(), bias);
        }
        record
    }

    pub fn relu() -> Self {
        Self::bare("ReLU")
    }

    pub fn max_pool2d(kernel_size: usize, stride: usize) -> Self {
        let mut record = Self::bare("MaxPool2d");
        record.kernel_size = kernel_size;
        record.stride = stride;
        record
    }

    pub fn batch_norm2d(
        running_mean: TensorRecord,
        running_var: TensorRecord,
        weight: TensorRecord,
        bias: TensorRecord,
        eps: f32,
    ) -> Self {
        let mut record = Self::bare("BatchNorm2d");
        record.eps = eps;
        record.tensors.insert("running_mean".to_owned(), running_mean);
        record.tensors.insert("running_var".to_owned(), running_var);
        record.tensors.insert("weight".to_owned(), weight);
        record.tensors.insert("bias".to_owned(), bias);
        record
    }

    pub(crate) fn tensor(&self, name: &str) -> Result<&TensorRecord, Error> {
        self.tensors.get(name).ok_or_else(|| {
            Error::weights(None, format!("{} layer is missing '{}'", self.kind, name))
        })
    }
}

/// A whole (possibly truncated) backbone, layer by layer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackboneArchive {
    pub layers: Vec<LayerRecord>,
}

impl BackboneArchive {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        read_bincode(path.as_ref())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        write_bincode(path.as_ref(), self)
    }
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let file = File::open(path).map_err(|e| Error::weights(Some(path.to_owned()), e.to_string()))?;

    // A file can't describe more bytes than it holds, this keeps corrupt
    // length prefixes from turning into huge allocations
    let limit = file.metadata()?.len();
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(limit)
        .deserialize_from(BufReader::new(file))
        .map_err(|e| Error::weights(Some(path.to_owned()), e.to_string()))
}

fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize_into(BufWriter::new(file), value)
        .map_err(|e| Error::weights(Some(path.to_owned()), e.to_string()))
}
