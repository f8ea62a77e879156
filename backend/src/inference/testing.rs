//! Fixtures shared by the inference and route tests.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array4;
use std::io::Cursor;
use std::path::PathBuf;
use tch::nn::VarStore;
use tch::vision::resnet;
use tch::{Device, TchError};
use uuid::Uuid;

use super::classifier::{check_batch_shape, Classifier, ClassifierError, Scores};

pub fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), format)
        .expect("encode test image");
    bytes
}

/// A well-formed farbfeld header declaring a 0x0 image.
pub fn empty_farbfeld() -> Vec<u8> {
    let mut bytes = b"farbfeld".to_vec();
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes
}

pub fn temp_artifact(file_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("xray-{}-{}", Uuid::new_v4(), file_name))
}

/// Writes a randomly initialised ResNet-18 state dict and returns its path.
pub fn save_random_resnet(num_classes: i64) -> PathBuf {
    let path = temp_artifact("resnet18.safetensors");
    let vs = VarStore::new(Device::Cpu);
    let _net = resnet::resnet18(&vs.root(), num_classes);
    vs.save(&path).expect("save random resnet");
    path
}

/// Returns the same scores for every row.
pub struct FixedScores(pub Scores);

impl Classifier for FixedScores {
    fn classify(&self, batch: &Array4<f32>) -> Result<Vec<Scores>, ClassifierError> {
        check_batch_shape(batch)?;
        Ok(vec![self.0; batch.dim().0])
    }

    fn device_name(&self) -> String {
        "fixed".to_string()
    }
}

/// Fails every forward pass with a message that must never reach a client.
pub struct BrokenClassifier;

pub const BROKEN_DETAIL: &str = "CUDA error at /opt/libtorch/include/ATen/core.cpp:42";

impl Classifier for BrokenClassifier {
    fn classify(&self, _batch: &Array4<f32>) -> Result<Vec<Scores>, ClassifierError> {
        Err(ClassifierError::Forward(TchError::Torch(BROKEN_DETAIL.to_string())))
    }

    fn device_name(&self) -> String {
        "broken".to_string()
    }
}
