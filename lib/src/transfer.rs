use crate::{
    backbone::{Backbone, BackboneFormat},
    codec::{self, Fit, ImageSource, OutputFormat},
    device::{self, DevicePreference, DeviceProbe, Resolution, Selection, SystemProbe},
    errors::InvalidRange,
    graph::{FeatureGraph, LossWeights, Normalization},
    lbfgs::LbfgsConfig,
    optimize::{self, TransferProgress},
    tensor::ImageTensor,
    Error,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything that configures a style transfer engine, usually loaded from
/// a configuration file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParams {
    /// Weights of the backbone, the engine can't be built without them
    pub backbone_path: Option<PathBuf>,
    pub backbone_format: BackboneFormat,
    pub device: DevicePreference,
    #[serde(flatten)]
    pub resolution: Resolution,
    pub normalization_mean: Vec<f32>,
    pub normalization_std: Vec<f32>,
    pub content_layers: Vec<String>,
    pub style_layers: Vec<String>,
    /// Number of outer L-BFGS steps
    pub num_steps: usize,
    pub style_weight: f32,
    pub content_weight: f32,
    pub lbfgs: LbfgsConfig,
    pub output: OutputFormat,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            backbone_path: None,
            backbone_format: BackboneFormat::default(),
            device: DevicePreference::Auto,
            resolution: Resolution::default(),
            normalization_mean: vec![0.485, 0.456, 0.406],
            normalization_std: vec![0.229, 0.224, 0.225],
            content_layers: vec!["conv_4".to_owned()],
            style_layers: (1..=5).map(|i| format!("conv_{}", i)).collect(),
            num_steps: 200,
            style_weight: 1_000_000.0,
            content_weight: 1.0,
            lbfgs: LbfgsConfig::default(),
            output: OutputFormat::default(),
        }
    }
}

/// Optimization based style transfer.
///
/// The engine owns the frozen backbone, every call to `run` builds its own
/// feature graph and probes, so a single engine can serve any number of
/// threads at once.
///
/// # Example
/// ```no_run
/// let engine = restyle::StyleTransfer::builder()
///     .backbone_path("models/vgg19_shrunk.bin", restyle::BackboneFormat::TruncatedObject)
///     .num_steps(100)
///     .build().expect("failed to build style transfer");
///
/// let jpeg = engine
///     .run_encoded(&"imgs/style.jpg", &"imgs/content.jpg")
///     .expect("style transfer failed");
/// std::fs::write("result.jpg", jpeg).expect("failed to save result");
/// ```
#[derive(Debug)]
pub struct StyleTransfer {
    backbone: Backbone,
    normalization: Normalization,
    selection: Selection,
    params: TransferParams,
}

impl StyleTransfer {
    /// Creates a new builder with default parameters.
    pub fn builder<'p>() -> StyleTransferBuilder<'p> {
        StyleTransferBuilder::default()
    }

    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn params(&self) -> &TransferParams {
        &self.params
    }

    /// Fuses the content of `content` with the style of `style`, the result
    /// is a `[0, 1]` tensor at the working resolution.
    pub fn run<'a, S, C>(
        &self,
        style: S,
        content: C,
        progress: Option<Box<dyn TransferProgress + '_>>,
    ) -> Result<ImageTensor, Error>
    where
        S: Into<ImageSource<'a>>,
        C: Into<ImageSource<'a>>,
    {
        let fit = Fit::Stretch(self.selection.image_size);
        let style = codec::decode(style.into(), fit)?;
        let content = codec::decode(content.into(), fit)?;

        let (graph, mut probes) = FeatureGraph::build(
            &self.backbone,
            self.normalization.clone(),
            &style,
            &content,
            &self.params.content_layers,
            &self.params.style_layers,
        )?;

        tracing::debug!(
            nodes = graph.len(),
            num_steps = self.params.num_steps,
            "starting style transfer"
        );

        optimize::refine(
            &graph,
            &mut probes,
            &content,
            self.params.num_steps,
            LossWeights {
                style: self.params.style_weight,
                content: self.params.content_weight,
            },
            self.params.lbfgs,
            progress,
        )
    }

    /// Like `run`, but compresses the result with the configured format
    pub fn run_encoded<'a, S, C>(&self, style: S, content: C) -> Result<Vec<u8>, Error>
    where
        S: Into<ImageSource<'a>>,
        C: Into<ImageSource<'a>>,
    {
        let output = self.run(style, content, None)?;
        codec::encode(&output, self.params.output)
    }
}

/// Builds a style transfer engine by setting parameters, calling `build`
/// validates them and loads the backbone
#[derive(Default)]
pub struct StyleTransferBuilder<'p> {
    params: TransferParams,
    backbone: Option<Backbone>,
    probe: Option<&'p dyn DeviceProbe>,
}

impl<'p> StyleTransferBuilder<'p> {
    /// Creates a new `StyleTransferBuilder`, can also be created via
    /// `StyleTransfer::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every parameter at once, eg. with ones read from a file
    pub fn params(mut self, params: TransferParams) -> Self {
        self.params = params;
        self
    }

    /// Loads the backbone from `path` when the engine is built
    pub fn backbone_path<P: Into<PathBuf>>(mut self, path: P, format: BackboneFormat) -> Self {
        self.params.backbone_path = Some(path.into());
        self.params.backbone_format = format;
        self
    }

    /// Uses an already loaded backbone instead of reading one from disk
    pub fn backbone(mut self, backbone: Backbone) -> Self {
        self.backbone = Some(backbone);
        self
    }

    pub fn device(mut self, preference: DevicePreference) -> Self {
        self.params.device = preference;
        self
    }

    /// Overrides how the presence of an accelerator is detected
    pub fn device_probe(mut self, probe: &'p dyn DeviceProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// The working resolution used when no device specific one is set
    ///
    /// Default: 256
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.resolution.image_size = size;
        self
    }

    pub fn image_size_gpu(mut self, size: u32) -> Self {
        self.params.resolution.image_size_gpu = Some(size);
        self
    }

    pub fn image_size_cpu(mut self, size: u32) -> Self {
        self.params.resolution.image_size_cpu = Some(size);
        self
    }

    /// Per-channel mean and std the backbone expects its inputs to be
    /// normalized with
    ///
    /// Default: the ImageNet statistics
    pub fn normalization(mut self, mean: Vec<f32>, std: Vec<f32>) -> Self {
        self.params.normalization_mean = mean;
        self.params.normalization_std = std;
        self
    }

    /// Names of the layers whose features must stay close to the content
    ///
    /// Default: `conv_4`
    pub fn content_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.content_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Names of the layers whose Gram matrices must match the style
    ///
    /// Default: `conv_1` to `conv_5`
    pub fn style_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.style_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Number of outer optimization steps, 0 returns the content unchanged
    ///
    /// Default: 200
    pub fn num_steps(mut self, steps: usize) -> Self {
        self.params.num_steps = steps;
        self
    }

    /// Default: 1000000
    pub fn style_weight(mut self, weight: f32) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// Default: 1
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.content_weight = weight;
        self
    }

    pub fn lbfgs(mut self, config: LbfgsConfig) -> Self {
        self.params.lbfgs = config;
        self
    }

    /// Default: JPEG with a quality of 75
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.params.output = format;
        self
    }

    /// Creates a `StyleTransfer`, or returns an error if invalid parameters
    /// were specified or the backbone couldn't be loaded.
    pub fn build(self) -> Result<StyleTransfer, Error> {
        self.check_parameters_validity()?;

        let normalization = Normalization::new(
            self.params.normalization_mean.clone(),
            self.params.normalization_std.clone(),
        )?;

        let selection = match self.probe {
            Some(probe) => device::select(&self.params.device, &self.params.resolution, probe)?,
            None => device::select(&self.params.device, &self.params.resolution, &SystemProbe)?,
        };

        let backbone = match self.backbone {
            Some(backbone) => backbone,
            None => match &self.params.backbone_path {
                Some(path) => Backbone::load(path, self.params.backbone_format)?,
                None => return Err(Error::weights(None, "no backbone path was configured")),
            },
        };

        tracing::info!(
            device = %selection.device,
            image_size = selection.image_size,
            layers = backbone.len(),
            "style transfer engine initialized"
        );

        Ok(StyleTransfer {
            backbone,
            normalization,
            selection,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let weights = [
            ("style-weight", self.params.style_weight),
            ("content-weight", self.params.content_weight),
        ];

        for &(name, value) in weights.iter() {
            if value < 0.0 || !value.is_finite() {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 0.0,
                    max: f32::MAX,
                    value,
                    name,
                }));
            }
        }

        let lbfgs = &self.params.lbfgs;
        if lbfgs.max_iter == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: 1024.0,
                value: lbfgs.max_iter as f32,
                name: "lbfgs-max-iter",
            }));
        }

        if lbfgs.history_size == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: 1024.0,
                value: lbfgs.history_size as f32,
                name: "lbfgs-history-size",
            }));
        }

        if lbfgs.lr <= 0.0 || !lbfgs.lr.is_finite() {
            return Err(Error::InvalidRange(InvalidRange {
                min: f32::EPSILON,
                max: f32::MAX,
                value: lbfgs.lr,
                name: "lbfgs-lr",
            }));
        }

        self.params.resolution.validate()
    }
}

/// A style image shipped alongside the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultStyle {
    pub path: PathBuf,
    /// File stem with underscores as spaces and an upper-cased first letter
    pub display_name: String,
}

fn display_name(stem: &str) -> String {
    let spaced = stem.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => spaced,
    }
}

/// Lists the `.png`, `.jpg` and `.jpeg` images in `dir`, sorted by file name
pub fn default_styles<P: AsRef<Path>>(dir: P) -> Result<Vec<DefaultStyle>, Error> {
    let mut styles = Vec::new();

    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                ext == "png" || ext == "jpg" || ext == "jpeg"
            })
            .unwrap_or(false);

        if !is_image {
            continue;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        styles.push(DefaultStyle {
            display_name: display_name(&stem),
            path,
        });
    }

    styles.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(styles)
}
