use ndarray::Array4;
use shared::ClassLabel;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tch::nn::{FuncT, ModuleT, VarStore};
use tch::vision::resnet;
use tch::{CModule, Device, Kind, TchError, Tensor};

use super::preprocess::{CHANNELS, INPUT_SIZE};

/// Output index -> label. This order is a property of the weights file and
/// must not be changed independently of it.
pub const CLASS_LABELS: [ClassLabel; 4] = [
    ClassLabel::Normal,
    ClassLabel::Pneumonia,
    ClassLabel::Unknown,
    ClassLabel::Tuberculosis,
];

pub const NUM_CLASSES: usize = CLASS_LABELS.len();

/// Raw, unnormalized scores for one image.
pub type Scores = [f32; NUM_CLASSES];

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("model artifact not found at {0}")]
    Missing(PathBuf),
    #[error("failed to read model artifact {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: TchError,
    },
    #[error("parameter `{0}` is missing from the model artifact")]
    MissingParameter(String),
    #[error("parameter `{name}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
    #[error("model emits {found} scores per image, expected {expected}")]
    OutputWidth { expected: usize, found: usize },
    #[error("probe forward pass failed: {0}")]
    Probe(#[source] ClassifierError),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("input batch has shape {0:?}, expected [N, 224, 224, 3]")]
    InputShape(Vec<usize>),
    #[error("forward pass failed: {0}")]
    Forward(#[from] TchError),
    #[error("model output has shape {0:?}, expected [N, 4]")]
    OutputShape(Vec<i64>),
    #[error("model produced no scores")]
    EmptyOutput,
    #[error("model produced non-finite scores {0:?}")]
    NonFinite(Vec<f32>),
}

/// Forward inference over a normalized `N x 224 x 224 x 3` batch.
///
/// Implementations hold immutable weights and are shared by every request.
pub trait Classifier: Send + Sync {
    fn classify(&self, batch: &Array4<f32>) -> Result<Vec<Scores>, ClassifierError>;

    /// Human readable placement, used in logs.
    fn device_name(&self) -> String;
}

pub fn check_batch_shape(batch: &Array4<f32>) -> Result<(), ClassifierError> {
    let (n, h, w, c) = batch.dim();
    let side = INPUT_SIZE as usize;
    if n == 0 || h != side || w != side || c != CHANNELS {
        return Err(ClassifierError::InputShape(batch.shape().to_vec()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactFormat {
    /// Named tensors keyed by torchvision parameter names.
    StateDict,
    TorchScript,
}

impl ArtifactFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") | Some("ot") => ArtifactFormat::StateDict,
            _ => ArtifactFormat::TorchScript,
        }
    }
}

enum Network {
    // The var store owns the parameters the closure reads.
    Native { _vs: VarStore, net: FuncT<'static> },
    Scripted(CModule),
}

/// ResNet-18 with a four-way head, running on libtorch.
pub struct TorchClassifier {
    network: Mutex<Network>,
    device: Device,
}

impl TorchClassifier {
    pub fn load(path: &Path, device: Device) -> Result<Self, ModelLoadError> {
        if !path.is_file() {
            return Err(ModelLoadError::Missing(path.to_path_buf()));
        }

        let network = match ArtifactFormat::from_path(path) {
            ArtifactFormat::StateDict => load_state_dict(path, device)?,
            ArtifactFormat::TorchScript => {
                let mut module = CModule::load_on_device(path, device).map_err(|source| {
                    ModelLoadError::Unreadable {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                module.set_eval();
                Network::Scripted(module)
            }
        };

        let classifier = Self {
            network: Mutex::new(network),
            device,
        };
        classifier.check_output_width()?;
        Ok(classifier)
    }

    fn check_output_width(&self) -> Result<(), ModelLoadError> {
        let side = INPUT_SIZE as i64;
        let probe = Tensor::zeros([1, CHANNELS as i64, side, side], (Kind::Float, self.device));
        let output = self.forward(&probe).map_err(ModelLoadError::Probe)?;
        let dims = output.size();
        let found = dims.last().copied().unwrap_or(0) as usize;
        if dims.len() != 2 || found != NUM_CLASSES {
            return Err(ModelLoadError::OutputWidth {
                expected: NUM_CLASSES,
                found,
            });
        }
        Ok(())
    }

    fn to_input(&self, batch: &Array4<f32>) -> Tensor {
        let (n, h, w, c) = batch.dim();
        // iter() walks in logical order whatever the memory layout
        let data: Vec<f32> = batch.iter().copied().collect();
        Tensor::from_slice(&data)
            .view([n as i64, h as i64, w as i64, c as i64])
            .permute([0, 3, 1, 2])
            .contiguous()
            .to_device(self.device)
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, ClassifierError> {
        // Weights are never written after load, so a poisoned lock is still usable.
        let network = self.network.lock().unwrap_or_else(PoisonError::into_inner);
        let output = tch::no_grad(|| match &*network {
            Network::Native { net, .. } => Ok(net.forward_t(input, false)),
            Network::Scripted(module) => module.forward_ts(&[input]),
        })?;
        Ok(output)
    }
}

impl Classifier for TorchClassifier {
    fn classify(&self, batch: &Array4<f32>) -> Result<Vec<Scores>, ClassifierError> {
        check_batch_shape(batch)?;
        let output = self.forward(&self.to_input(batch))?;

        let dims = output.size();
        if dims.len() != 2 || dims[0] != batch.dim().0 as i64 || dims[1] != NUM_CLASSES as i64 {
            return Err(ClassifierError::OutputShape(dims));
        }

        let flat = Vec::<f32>::try_from(
            output
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view([-1]),
        )?;

        Ok(flat
            .chunks_exact(NUM_CLASSES)
            .map(|row| {
                let mut scores = [0.0; NUM_CLASSES];
                scores.copy_from_slice(row);
                scores
            })
            .collect())
    }

    fn device_name(&self) -> String {
        format!("{:?}", self.device)
    }
}

fn load_state_dict(path: &Path, device: Device) -> Result<Network, ModelLoadError> {
    let unreadable = |source| ModelLoadError::Unreadable {
        path: path.to_path_buf(),
        source,
    };

    let mut vs = VarStore::new(device);
    let net = resnet::resnet18(&vs.root(), NUM_CLASSES as i64);

    let stored: HashMap<String, Tensor> = match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path),
        _ => Tensor::load_multi(path),
    }
    .map_err(unreadable)?
    .into_iter()
    .collect();

    let expected = vs.variables();
    verify_parameters(&expected, &stored)?;

    tch::no_grad(|| -> Result<(), TchError> {
        for (name, mut variable) in expected {
            if let Some(source) = stored.get(&name) {
                variable.f_copy_(source)?;
            }
        }
        Ok(())
    })
    .map_err(unreadable)?;

    vs.freeze();
    Ok(Network::Native { _vs: vs, net })
}

/// Every parameter of the built network must be present with the same shape.
/// Extra entries in the file (e.g. `num_batches_tracked`) are ignored.
fn verify_parameters(
    expected: &HashMap<String, Tensor>,
    stored: &HashMap<String, Tensor>,
) -> Result<(), ModelLoadError> {
    let mut names: Vec<&String> = expected.keys().collect();
    names.sort();

    for name in names {
        let found = stored
            .get(name)
            .ok_or_else(|| ModelLoadError::MissingParameter(name.clone()))?
            .size();
        let wanted = expected[name].size();
        if found != wanted {
            return Err(ModelLoadError::ShapeMismatch {
                name: name.clone(),
                expected: wanted,
                found,
            });
        }
    }
    Ok(())
}
