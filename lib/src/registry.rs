use crate::{
    codec::{self, Fit, ImageSource, OutputFormat},
    device::{self, DevicePreference, DeviceProbe, Resolution, Selection, SystemProbe},
    errors::Engine,
    generator::{GeneratorArch, ResnetGenerator},
    tensor::ImageTensor,
    Error,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A style as declared in the configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleDecl {
    /// Stable identifier callers select the style with
    pub key: String,
    pub display_name: String,
    /// Checkpoint file name inside the models directory
    #[serde(default)]
    pub model_file: Option<String>,
}

impl StyleDecl {
    pub fn new<K, D, F>(key: K, display_name: D, model_file: F) -> Self
    where
        K: Into<String>,
        D: Into<String>,
        F: Into<String>,
    {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            model_file: Some(model_file.into()),
        }
    }
}

/// Configuration of the generator engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorParams {
    pub models_dir: PathBuf,
    pub device: DevicePreference,
    #[serde(flatten)]
    pub resolution: Resolution,
    #[serde(flatten)]
    pub arch: GeneratorArch,
    pub output: OutputFormat,
    pub styles: Vec<StyleDecl>,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            device: DevicePreference::Auto,
            resolution: Resolution::default(),
            arch: GeneratorArch::default(),
            output: OutputFormat::default(),
            styles: Vec::new(),
        }
    }
}

/// Key and display name of a style that can be used
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyleInfo {
    pub key: String,
    pub display_name: String,
}

/// A declared style along with its generator, if it could be loaded
#[derive(Debug)]
pub struct StyleRegistryEntry {
    pub key: String,
    pub display_name: String,
    pub model_file: Option<PathBuf>,
    generator: Option<ResnetGenerator>,
}

impl StyleRegistryEntry {
    pub fn is_loaded(&self) -> bool {
        self.generator.is_some()
    }
}

/// Resolves a declared model file inside `models_dir`, only the base name of
/// the declared file is used so a declaration can't point outside of it
pub fn resolve_model_path(models_dir: &Path, model_file: &str) -> Option<PathBuf> {
    Path::new(model_file)
        .file_name()
        .map(|name| models_dir.join(name))
}

/// A registry of generators keyed by style.
///
/// Generators are loaded once when the engine is created. Styles whose
/// checkpoint is missing or broken are logged and stay in the catalogue, but
/// can't be used.
#[derive(Debug)]
pub struct GeneratorEngine {
    entries: Vec<StyleRegistryEntry>,
    selection: Selection,
    output: OutputFormat,
}

impl GeneratorEngine {
    pub fn new(params: &GeneratorParams) -> Result<Self, Error> {
        Self::with_probe(params, &SystemProbe)
    }

    pub fn with_probe(params: &GeneratorParams, probe: &dyn DeviceProbe) -> Result<Self, Error> {
        params.arch.validate()?;
        let selection = device::select(&params.device, &params.resolution, probe)?;

        let mut entries: Vec<StyleRegistryEntry> = Vec::with_capacity(params.styles.len());
        for decl in &params.styles {
            if entries.iter().any(|e| e.key == decl.key) {
                tracing::warn!(style = %decl.key, "style is declared more than once, skipping");
                continue;
            }

            let model_file = decl
                .model_file
                .as_deref()
                .and_then(|file| resolve_model_path(&params.models_dir, file));

            let generator = match &model_file {
                None => {
                    tracing::warn!(style = %decl.key, "no usable model file declared, skipping");
                    None
                }
                Some(path) if !path.exists() => {
                    tracing::warn!(style = %decl.key, path = %path.display(), "model file not found");
                    None
                }
                Some(path) => match ResnetGenerator::load(path, params.arch) {
                    Ok(generator) => {
                        tracing::info!(style = %decl.key, "loaded generator");
                        Some(generator)
                    }
                    Err(err) => {
                        tracing::error!(style = %decl.key, error = %err, "failed to load generator");
                        None
                    }
                },
            };

            entries.push(StyleRegistryEntry {
                key: decl.key.clone(),
                display_name: decl.display_name.clone(),
                model_file,
                generator,
            });
        }

        let engine = Self {
            entries,
            selection,
            output: params.output,
        };

        tracing::info!(
            device = %selection.device,
            image_size = selection.image_size,
            loaded = engine.loaded().count(),
            declared = engine.entries.len(),
            "generator engine initialized"
        );

        Ok(engine)
    }

    fn loaded(&self) -> impl Iterator<Item = &StyleRegistryEntry> {
        self.entries.iter().filter(|e| e.is_loaded())
    }

    /// Whether at least one style could be loaded
    pub fn is_usable(&self) -> bool {
        self.loaded().next().is_some()
    }

    /// Every declared style, loaded or not
    pub fn entries(&self) -> &[StyleRegistryEntry] {
        &self.entries
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// The loaded styles, in the order they were declared
    pub fn available_styles(&self) -> Vec<StyleInfo> {
        self.loaded()
            .map(|e| StyleInfo {
                key: e.key.clone(),
                display_name: e.display_name.clone(),
            })
            .collect()
    }

    /// Runs the generator of `style_key` on `src`. The result always has the
    /// working resolution, regardless of the size of the input.
    pub fn stylize(&self, src: ImageSource<'_>, style_key: &str) -> Result<ImageTensor, Error> {
        if !self.is_usable() {
            return Err(Error::NotInitialized(Engine::Generator));
        }

        let generator = self
            .entries
            .iter()
            .find(|e| e.key == style_key)
            .and_then(|e| e.generator.as_ref())
            .ok_or_else(|| Error::UnknownStyle(style_key.to_owned()))?;

        let input = codec::decode(src, Fit::CenterCrop(self.selection.image_size))?;
        let output = generator.forward(&codec::to_signed(input))?;
        Ok(codec::from_signed(output))
    }

    /// Like `stylize`, but compresses the result with the configured format
    pub fn stylize_encoded(&self, src: ImageSource<'_>, style_key: &str) -> Result<Vec<u8>, Error> {
        let output = self.stylize(src, style_key)?;
        codec::encode(&output, self.output)
    }
}
