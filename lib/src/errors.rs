use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) what: &'static str,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {:?}, but {:?} was expected",
            self.what, self.actual, self.expected
        )
    }
}

/// A backbone layer whose kind can't be evaluated by the feature graph
#[derive(Debug)]
pub struct UnsupportedLayer {
    pub index: usize,
    pub kind: String,
}

impl fmt::Display for UnsupportedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unrecognized layer '{}' at position {} of the backbone",
            self.kind, self.index
        )
    }
}

#[derive(Debug)]
pub struct WeightsError {
    pub path: Option<PathBuf>,
    pub reason: String,
}

impl fmt::Display for WeightsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(
                f,
                "could not load weights from '{}': {}",
                path.display(),
                self.reason
            ),
            None => write!(f, "could not load weights: {}", self.reason),
        }
    }
}

/// Failure inside an evaluation of the optimization loop
#[derive(Debug)]
pub struct OptimizationError {
    /// The outer step during which the failure happened
    pub step: usize,
    pub source: Box<Error>,
}

impl fmt::Display for OptimizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "optimization failed at step {}: {}", self.step, self.source)
    }
}

/// The engine a `NotInitialized` error refers to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Engine {
    Transfer,
    Generator,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => f.write_str("style transfer"),
            Self::Generator => f.write_str("generator"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// The engine has no usable backbone or generator, the feature is disabled
    NotInitialized(Engine),
    /// The backbone contains a layer the feature graph can't classify
    UnsupportedLayer(UnsupportedLayer),
    /// The input could not be interpreted as an image
    Decode(image::ImageError),
    /// The result could not be compressed into the output format
    Encode(image::ImageError),
    /// The requested style key is not one of the loaded generators
    UnknownStyle(String),
    /// Something went wrong while refining the working image
    Optimization(OptimizationError),
    /// A weights file is missing, unreadable, or doesn't fit the architecture
    Weights(WeightsError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// Normalization mean and std must each have one entry per channel
    InvalidNormalization(usize, usize),
    /// Two tensors that must agree on their shape didn't
    ShapeMismatch(ShapeMismatch),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(err) | Self::Encode(err) => Some(err),
            Self::Optimization(err) => Some(err.source.as_ref()),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized(engine) => write!(
                f,
                "the {} engine is not initialized, check the logs for load failures",
                engine
            ),
            Self::UnsupportedLayer(ul) => write!(f, "{}", ul),
            Self::Decode(ie) => write!(f, "failed to decode image: {}", ie),
            Self::Encode(ie) => write!(f, "failed to encode image: {}", ie),
            Self::UnknownStyle(key) => {
                write!(f, "style '{}' is not a valid or loaded style", key)
            }
            Self::Optimization(oe) => write!(f, "{}", oe),
            Self::Weights(we) => write!(f, "{}", we),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::InvalidNormalization(mean, std) => write!(
                f,
                "normalization needs 3 means and 3 stds, but {} means and {} stds were provided",
                mean, std
            ),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::Io(io) => write!(f, "{}", io),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl Error {
    pub(crate) fn weights<S: Into<String>>(path: Option<PathBuf>, reason: S) -> Self {
        Self::Weights(WeightsError {
            path,
            reason: reason.into(),
        })
    }

    /// Attaches the file a weights error originated from, if it has none yet
    pub(crate) fn at_path(self, file: &std::path::Path) -> Self {
        match self {
            Self::Weights(WeightsError { path: None, reason }) => Self::Weights(WeightsError {
                path: Some(file.to_owned()),
                reason,
            }),
            other => other,
        }
    }

    pub(crate) fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch(ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}
