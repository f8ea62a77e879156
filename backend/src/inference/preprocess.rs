use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use std::fmt;
use std::str::FromStr;

/// Side length of the square input the classifier expects.
pub const INPUT_SIZE: u32 = 224;
pub const CHANNELS: usize = 3;

// ImageNet statistics, the ones the backbone was pretrained with.
pub const MEAN: [f32; CHANNELS] = [0.485, 0.456, 0.406];
pub const STD: [f32; CHANNELS] = [0.229, 0.224, 0.225];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("no image data")]
    Empty,
    #[error("image has no pixels ({width}x{height})")]
    NoPixels { width: u32, height: u32 },
    #[error("{0}")]
    Decode(#[from] image::ImageError),
}

/// How colour is mapped onto the three input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    /// Luminance replicated across all channels, matching the training transform.
    #[default]
    Grayscale,
    /// Red, green and blue kept as separate channels.
    Rgb,
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "grayscale" | "gray" | "luma" => Ok(ColorMode::Grayscale),
            "rgb" | "color" => Ok(ColorMode::Rgb),
            other => Err(format!("unknown color mode '{}'", other)),
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorMode::Grayscale => f.write_str("grayscale"),
            ColorMode::Rgb => f.write_str("rgb"),
        }
    }
}

/// Turns encoded image bytes into a normalized `1 x 224 x 224 x 3` batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preprocessor {
    color_mode: ColorMode,
}

impl Preprocessor {
    pub fn new(color_mode: ColorMode) -> Self {
        Self { color_mode }
    }

    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    pub fn preprocess(&self, bytes: &[u8]) -> Result<Array4<f32>, PreprocessError> {
        let image = decode(bytes)?;
        Ok(self.normalize(&image))
    }

    /// Stretches the image to the input box and standardizes every channel.
    pub fn normalize(&self, image: &DynamicImage) -> Array4<f32> {
        // to_rgb8 drops alpha and expands palette and grayscale sources
        let rgb = image.to_rgb8();
        let resized = resize_to_input(rgb);

        let side = INPUT_SIZE as usize;
        let mut batch = Array4::<f32>::zeros((1, side, side, CHANNELS));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let values = match self.color_mode {
                ColorMode::Rgb => pixel.0,
                ColorMode::Grayscale => [luma(pixel.0); CHANNELS],
            };
            for (c, value) in values.iter().enumerate() {
                let scaled = f32::from(*value) / 255.0;
                batch[[0, y as usize, x as usize, c]] = (scaled - MEAN[c]) / STD[c];
            }
        }
        batch
    }
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::Empty);
    }
    let image = image::load_from_memory(bytes)?;
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(PreprocessError::NoPixels { width, height });
    }
    Ok(image)
}

fn resize_to_input(image: RgbImage) -> RgbImage {
    if image.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
        return image;
    }
    imageops::resize(&image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
}

/// ITU-R 601-2 luma in 16-bit fixed point; the weights sum to 65536.
fn luma([r, g, b]: [u8; 3]) -> u8 {
    let weighted = u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471;
    ((weighted + 0x8000) >> 16) as u8
}
