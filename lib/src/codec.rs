use crate::{tensor::ImageTensor, Error};
use image::{imageops::FilterType, DynamicImage, ImageOutputFormat, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::{io::Cursor, path::Path, str::FromStr};

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file contents and extension, see `image::open` for details
    Path(&'a Path),
    /// An already decoded image
    Image(DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<DynamicImage> for ImageSource<'a> {
    fn from(img: DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::Memory(data)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<DynamicImage, Error> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
    .map_err(Error::Decode)
}

/// How a decoded image is brought to the square working resolution
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fit {
    /// Resize both axes to `size`, ignoring the aspect ratio
    Stretch(u32),
    /// Resize the shorter side to `size` and cut the centered square
    CenterCrop(u32),
}

fn fit_image(img: &RgbImage, fit: Fit) -> RgbImage {
    match fit {
        Fit::Stretch(size) => {
            if img.width() == size && img.height() == size {
                img.clone()
            } else {
                image::imageops::resize(img, size, size, FilterType::Triangle)
            }
        }
        Fit::CenterCrop(size) => {
            let (w, h) = img.dimensions();
            let shorter = u64::from(w.min(h).max(1));
            let scale = |len: u32| {
                let scaled = (u64::from(len) * u64::from(size) + shorter / 2) / shorter;
                (scaled as u32).max(size)
            };
            let (rw, rh) = (scale(w), scale(h));

            let resized = if (rw, rh) == (w, h) {
                img.clone()
            } else {
                image::imageops::resize(img, rw, rh, FilterType::Triangle)
            };
            let (x, y) = ((rw - size) / 2, (rh - size) / 2);
            image::imageops::crop_imm(&resized, x, y, size, size).to_image()
        }
    }
}

/// Converts an 8-bit RGB image into a tensor with values in `[0, 1]`
pub fn image_to_tensor(img: &RgbImage) -> ImageTensor {
    let (w, h) = img.dimensions();
    let data = Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        f32::from(img.get_pixel(x as u32, y as u32)[c]) / 255.0
    });
    ImageTensor(data)
}

/// Converts a tensor with values in `[0, 1]` into an 8-bit RGB image, out of
/// range values are clamped. Only the first 3 channels are used.
pub fn tensor_to_image(tensor: &ImageTensor) -> Result<RgbImage, Error> {
    let (c, h, w) = tensor.dims();
    if c < 3 {
        return Err(Error::shape_mismatch("output image", &[1, 3, h, w], &[1, c, h, w]));
    }

    let data = tensor.as_array();
    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |ch: usize| {
            let v = data[[0, ch, y as usize, x as usize]];
            (v.max(0.0).min(1.0) * 255.0).round() as u8
        };
        image::Rgb([px(0), px(1), px(2)])
    }))
}

/// Decodes `src` into a `(1, 3, size, size)` tensor in `[0, 1]`
pub fn decode(src: ImageSource<'_>, fit: Fit) -> Result<ImageTensor, Error> {
    let img = load_dynamic_image(src)?.to_rgb8();
    Ok(image_to_tensor(&fit_image(&img, fit)))
}

/// Maps `[0, 1]` values into the `[-1, 1]` range generators work in
pub fn to_signed(mut tensor: ImageTensor) -> ImageTensor {
    tensor.0.mapv_inplace(|v| v * 2.0 - 1.0);
    tensor
}

/// Maps generator outputs in `[-1, 1]` back into `[0, 1]`
pub fn from_signed(mut tensor: ImageTensor) -> ImageTensor {
    tensor.0.mapv_inplace(|v| v * 0.5 + 0.5);
    tensor
}

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

fn default_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

/// The raster format results are compressed to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg {
        #[serde(default = "default_quality")]
        quality: u8,
    },
    Png,
    Bmp,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl OutputFormat {
    /// The usual file extension for the format
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg { .. } => "jpg",
            Self::Png => "png",
            Self::Bmp => "bmp",
        }
    }

    /// Guesses the format from a file extension, `None` if it isn't one of
    /// the supported formats
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::default()),
            "png" => Ok(Self::Png),
            "bmp" => Ok(Self::Bmp),
            other => Err(format!("unsupported output format '{}'", other)),
        }
    }
}

impl From<OutputFormat> for ImageOutputFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Jpeg { quality } => ImageOutputFormat::Jpeg(quality.max(1).min(100)),
            OutputFormat::Png => ImageOutputFormat::Png,
            OutputFormat::Bmp => ImageOutputFormat::Bmp,
        }
    }
}

/// Clamps `tensor` into `[0, 1]` and compresses it
pub fn encode(tensor: &ImageTensor, format: OutputFormat) -> Result<Vec<u8>, Error> {
    let img = DynamicImage::ImageRgb8(tensor_to_image(tensor)?);

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::from(format))
        .map_err(Error::Encode)?;

    Ok(bytes)
}
