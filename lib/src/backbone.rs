use crate::{
    errors::UnsupportedLayer,
    tensor::{self, Window},
    weights::{BackboneArchive, LayerRecord, StateDict, TensorRecord},
    Error,
};
use ndarray::{Array1, Array2, Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::path::Path;

const BATCH_NORM_EPS: f32 = 1e-5;

/// How a backbone weights file is laid out
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneFormat {
    /// A `BackboneArchive`, usually only the first few layers of VGG19
    #[serde(alias = "shrunk_object")]
    TruncatedObject,
    /// A `StateDict` with every `features.*` parameter of VGG19
    #[serde(alias = "full_statedict")]
    FullStateDict,
}

impl Default for BackboneFormat {
    fn default() -> Self {
        Self::TruncatedObject
    }
}

/// The four layer kinds the feature graph knows how to walk
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Conv,
    Activation,
    Pool,
    Norm,
}

impl LayerKind {
    /// Prefix used when synthesizing layer names, eg. `relu` in `relu_3`
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Conv => "conv",
            Self::Activation => "relu",
            Self::Pool => "pool",
            Self::Norm => "bn",
        }
    }
}

/// A classified backbone layer, `index` is its position in the backbone
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FeatureLayerSpec {
    pub kind: LayerKind,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct Conv2d {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    in_channels: usize,
    window: Window,
}

impl Conv2d {
    fn from_record(record: &LayerRecord) -> Result<Self, Error> {
        let (weight, (out_channels, in_channels, kernel)) =
            record.tensor("weight")?.to_kernel_matrix("weight")?;
        let bias = match record.tensors.get("bias") {
            Some(bias) => Some(bias.to_vector("bias", out_channels)?),
            None => None,
        };

        Ok(Self {
            weight,
            bias,
            in_channels,
            window: Window::new(kernel, record.stride.max(1), record.padding),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    fn to_record(&self) -> LayerRecord {
        let k = self.window.kernel;
        let weight = TensorRecord {
            shape: vec![self.out_channels(), self.in_channels, k, k],
            data: self.weight.iter().copied().collect(),
        };
        let bias = self.bias.as_ref().map(|b| TensorRecord {
            shape: vec![b.len()],
            data: b.to_vec(),
        });

        LayerRecord::conv2d(weight, bias, self.window.stride, self.window.padding)
    }
}

#[derive(Clone, Debug)]
pub struct MaxPool2d {
    window: Window,
}

/// Batch normalization in inference mode, using the running statistics
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    mean: Array1<f32>,
    var: Array1<f32>,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl BatchNorm2d {
    fn from_record(record: &LayerRecord) -> Result<Self, Error> {
        let mean = record.tensor("running_mean")?;
        let channels = mean.data.len();
        let mean = mean.to_vector("running_mean", channels)?;
        let var = record.tensor("running_var")?.to_vector("running_var", channels)?;

        let gamma = match record.tensors.get("weight") {
            Some(w) => w.to_vector("weight", channels)?,
            None => Array1::ones(channels),
        };
        let beta = match record.tensors.get("bias") {
            Some(b) => b.to_vector("bias", channels)?,
            None => Array1::zeros(channels),
        };

        let eps = if record.eps > 0.0 {
            record.eps
        } else {
            BATCH_NORM_EPS
        };

        Ok(Self {
            mean,
            var,
            gamma,
            beta,
            eps,
        })
    }

    /// Per-channel `(scale, shift)` so that `y = x * scale + shift`
    fn affine(&self) -> (Vec<f32>, Vec<f32>) {
        let scale: Vec<f32> = self
            .gamma
            .iter()
            .zip(self.var.iter())
            .map(|(g, v)| g / (v + self.eps).sqrt())
            .collect();
        let shift = self
            .beta
            .iter()
            .zip(self.mean.iter())
            .zip(scale.iter())
            .map(|((b, m), s)| b - m * s)
            .collect();
        (scale, shift)
    }

    fn check_channels(&self, x: &ArrayView4<'_, f32>) -> Result<(), Error> {
        let (n, c, h, w) = x.dim();
        if c != self.mean.len() {
            return Err(Error::shape_mismatch(
                "batch norm input",
                &[n, self.mean.len(), h, w],
                &[n, c, h, w],
            ));
        }
        Ok(())
    }

    fn to_record(&self) -> LayerRecord {
        let vector = |a: &Array1<f32>| TensorRecord {
            shape: vec![a.len()],
            data: a.to_vec(),
        };

        LayerRecord::batch_norm2d(
            vector(&self.mean),
            vector(&self.var),
            vector(&self.gamma),
            vector(&self.beta),
            self.eps,
        )
    }
}

/// A single frozen layer of a backbone
#[derive(Clone, Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    Relu,
    MaxPool2d(MaxPool2d),
    BatchNorm2d(BatchNorm2d),
    /// A layer that was loaded but has no evaluation rule, eg. dropout
    Unsupported { index: usize, record: LayerRecord },
}

impl Layer {
    /// Builds a layer from its serialized form. Unknown kinds are kept as
    /// `Layer::Unsupported`, rejecting them is up to whoever walks the backbone.
    pub fn from_record(index: usize, record: &LayerRecord) -> Result<Self, Error> {
        let layer = match record.kind.to_ascii_lowercase().as_str() {
            "conv2d" | "conv" => Self::Conv2d(Conv2d::from_record(record)?),
            "relu" => Self::Relu,
            "maxpool2d" | "maxpool" | "pool" => Self::MaxPool2d(MaxPool2d {
                window: Window::new(
                    record.kernel_size.max(1),
                    if record.stride == 0 {
                        record.kernel_size.max(1)
                    } else {
                        record.stride
                    },
                    record.padding,
                ),
            }),
            "batchnorm2d" | "batchnorm" | "bn" => {
                Self::BatchNorm2d(BatchNorm2d::from_record(record)?)
            }
            _ => Self::Unsupported {
                index,
                record: record.clone(),
            },
        };

        Ok(layer)
    }

    /// Classifies the layer, failing for anything outside the four kinds
    /// the feature graph can evaluate
    pub fn kind(&self) -> Result<LayerKind, Error> {
        match self {
            Self::Conv2d(_) => Ok(LayerKind::Conv),
            Self::Relu => Ok(LayerKind::Activation),
            Self::MaxPool2d(_) => Ok(LayerKind::Pool),
            Self::BatchNorm2d(_) => Ok(LayerKind::Norm),
            Self::Unsupported { index, record } => Err(Error::UnsupportedLayer(UnsupportedLayer {
                index: *index,
                kind: record.kind.clone(),
            })),
        }
    }

    pub fn forward(&self, x: ArrayView4<'_, f32>) -> Result<Array4<f32>, Error> {
        match self {
            Self::Conv2d(conv) => {
                tensor::conv2d(x, &conv.weight, conv.bias.as_ref(), conv.window)
            }
            Self::Relu => Ok(tensor::relu(x)),
            Self::MaxPool2d(pool) => Ok(tensor::max_pool(x, pool.window)),
            Self::BatchNorm2d(bn) => {
                bn.check_channels(&x)?;
                let (scale, shift) = bn.affine();
                Ok(tensor::channel_affine(x, &scale, &shift))
            }
            Self::Unsupported { .. } => self.kind().map(|_| x.to_owned()),
        }
    }

    /// Gradient of the layer output with respect to `input`, given the
    /// gradient with respect to the output
    pub fn backward(
        &self,
        input: ArrayView4<'_, f32>,
        grad: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>, Error> {
        match self {
            Self::Conv2d(conv) => {
                let (_, _, h, w) = input.dim();
                Ok(tensor::conv2d_input_grad(grad, &conv.weight, conv.window, (h, w)))
            }
            Self::Relu => Ok(tensor::relu_grad(input, grad)),
            Self::MaxPool2d(pool) => Ok(tensor::max_pool_grad(input, grad, pool.window)),
            Self::BatchNorm2d(bn) => {
                let (scale, _) = bn.affine();
                let zeros = vec![0.0; scale.len()];
                Ok(tensor::channel_affine(grad, &scale, &zeros))
            }
            Self::Unsupported { .. } => self.kind().map(|_| grad.to_owned()),
        }
    }

    fn to_record(&self) -> LayerRecord {
        match self {
            Self::Conv2d(conv) => conv.to_record(),
            Self::Relu => LayerRecord::relu(),
            Self::MaxPool2d(pool) => {
                let mut record = LayerRecord::max_pool2d(pool.window.kernel, pool.window.stride);
                record.padding = pool.window.padding;
                record
            }
            Self::BatchNorm2d(bn) => bn.to_record(),
            Self::Unsupported { record, .. } => record.clone(),
        }
    }
}

/// Stage of the VGG19 feature stack
enum Vgg {
    Conv,
    Pool,
}

/// Configuration "E" of the VGG paper, 16 convolutions in 5 blocks. The
/// channel widths are taken from the weights themselves.
const VGG19_FEATURES: &[Vgg] = &[
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Pool,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Pool,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Pool,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Pool,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Conv,
    Vgg::Pool,
];

/// A pretrained, frozen convolutional feature extractor.
///
/// A backbone is only ever read after it has been loaded, so a single
/// instance can be shared by any number of concurrent style transfers.
#[derive(Clone, Debug)]
pub struct Backbone {
    layers: Vec<Layer>,
}

impl Backbone {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Loads a backbone from disk in the specified format
    pub fn load<P: AsRef<Path>>(path: P, format: BackboneFormat) -> Result<Self, Error> {
        let path = path.as_ref();
        let backbone = match format {
            BackboneFormat::TruncatedObject => {
                Self::from_archive(&BackboneArchive::load(path)?)
            }
            BackboneFormat::FullStateDict => Self::vgg19_from_state_dict(&StateDict::load(path)?),
        };

        backbone.map_err(|e| e.at_path(path))
    }

    pub fn from_archive(archive: &BackboneArchive) -> Result<Self, Error> {
        let layers = archive
            .layers
            .iter()
            .enumerate()
            .map(|(i, record)| Layer::from_record(i, record))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { layers })
    }

    /// Builds the VGG19 feature stack from `features.{i}.weight` and
    /// `features.{i}.bias` entries. Any other entries, eg. the classifier,
    /// are ignored.
    pub fn vgg19_from_state_dict(dict: &StateDict) -> Result<Self, Error> {
        let mut layers = Vec::with_capacity(37);
        let mut channels = 3;

        for stage in VGG19_FEATURES {
            match stage {
                Vgg::Conv => {
                    let i = layers.len();
                    let weight = dict.get(&format!("features.{}.weight", i))?.clone();
                    let bias = dict.get(&format!("features.{}.bias", i))?.clone();

                    let conv = Conv2d::from_record(&LayerRecord::conv2d(weight, Some(bias), 1, 1))?;
                    if conv.in_channels != channels || conv.window.kernel != 3 {
                        return Err(Error::weights(
                            None,
                            format!(
                                "features.{}.weight must be a 3x3 kernel over {} channels",
                                i, channels
                            ),
                        ));
                    }

                    channels = conv.out_channels();
                    layers.push(Layer::Conv2d(conv));
                    layers.push(Layer::Relu);
                }
                Vgg::Pool => layers.push(Layer::MaxPool2d(MaxPool2d {
                    window: Window::new(2, 2, 0),
                })),
            }
        }

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Classifies every layer in order, failing on the first one that
    /// the feature graph can't evaluate
    pub fn feature_specs(&self) -> Result<Vec<FeatureLayerSpec>, Error> {
        self.layers
            .iter()
            .enumerate()
            .map(|(index, layer)| layer.kind().map(|kind| FeatureLayerSpec { kind, index }))
            .collect()
    }

    /// Returns a copy of the first `count` layers
    pub fn truncated(&self, count: usize) -> Self {
        Self {
            layers: self.layers.iter().take(count).cloned().collect(),
        }
    }

    /// Converts the backbone into its `truncated-object` representation
    pub fn to_archive(&self) -> BackboneArchive {
        BackboneArchive {
            layers: self.layers.iter().map(Layer::to_record).collect(),
        }
    }
}
