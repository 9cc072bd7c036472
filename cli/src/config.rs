use restyle::{GeneratorParams, TransferParams};
use serde::Deserialize;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// The file read when `--config` isn't given, if it exists
pub(crate) const DEFAULT_CONFIG: &str = "restyle.toml";

/// Contents of a `restyle.toml` file, a missing section disables the engine
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) transfer: Option<TransferParams>,
    pub(crate) generator: Option<GeneratorParams>,
    /// Directory holding the bundled style images
    pub(crate) styles_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub(crate) enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Toml { path: PathBuf, source: toml::de::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read {}: {}", path.display(), source),
            Self::Toml { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Toml { source, .. } => Some(source),
        }
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl Config {
    /// Loads `path`, or the default config file when no path is given.
    /// Without either, every engine keeps its default parameters.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG);
                if !default.exists() {
                    tracing::debug!("no configuration file found, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.clone(),
            source,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.resolve_paths(base);

        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Makes every relative path relative to `base` instead of the working
    /// directory
    fn resolve_paths(&mut self, base: &Path) {
        if let Some(transfer) = &mut self.transfer {
            if let Some(backbone) = &mut transfer.backbone_path {
                resolve(base, backbone);
            }
        }

        if let Some(generator) = &mut self.generator {
            resolve(base, &mut generator.models_dir);
        }

        if let Some(dir) = &mut self.styles_dir {
            resolve(base, dir);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use restyle::{BackboneFormat, DevicePreference, OutputFormat};

    const SAMPLE: &str = r#"
styles_dir = "imgs/styles"

[transfer]
backbone_path = "models/vgg19.bin"
backbone_format = "full_statedict"
device = "cuda"
image_size_cpu = 128
num_steps = 50
output = { format = "png" }

[transfer.lbfgs]
history_size = 10

[generator]
models_dir = "checkpoints"
n_blocks = 6
output = { format = "jpeg", quality = 90 }

[[generator.styles]]
key = "monet"
display_name = "Monet"
model_file = "style_monet.bin"

[[generator.styles]]
key = "cezanne"
display_name = "Cezanne"
"#;

    #[test]
    fn parses_every_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restyle.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(Some(&path)).unwrap();

        let transfer = config.transfer.unwrap();
        assert_eq!(
            transfer.backbone_path.as_deref(),
            Some(dir.path().join("models/vgg19.bin").as_path())
        );
        assert_eq!(transfer.backbone_format, BackboneFormat::FullStateDict);
        assert_eq!(transfer.device, DevicePreference::Gpu);
        assert_eq!(transfer.resolution.image_size, 256);
        assert_eq!(transfer.resolution.image_size_cpu, Some(128));
        assert_eq!(transfer.num_steps, 50);
        assert_eq!(transfer.lbfgs.history_size, 10);
        assert_eq!(transfer.lbfgs.max_iter, 20);
        assert_eq!(transfer.output, OutputFormat::Png);
        assert_eq!(transfer.content_layers, vec!["conv_4"]);

        let generator = config.generator.unwrap();
        assert_eq!(generator.models_dir, dir.path().join("checkpoints"));
        assert_eq!(generator.arch.n_blocks, 6);
        assert_eq!(generator.arch.ngf, 64);
        assert_eq!(generator.output, OutputFormat::Jpeg { quality: 90 });
        assert_eq!(generator.styles.len(), 2);
        assert_eq!(generator.styles[1].model_file, None);

        assert_eq!(config.styles_dir, Some(dir.path().join("imgs/styles")));
    }

    #[test]
    fn missing_sections_stay_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.transfer.is_none());
        assert!(config.generator.is_none());
    }

    #[test]
    fn unknown_keys_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.toml");
        std::fs::write(&path, "[tranfser]\nnum_steps = 3\n").unwrap();

        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Toml { .. })
        ));
    }
}
