use shared::{ClassLabel, PredictionResponse, Probabilities};
use std::path::Path;
use std::sync::Arc;
use tch::Device;

use super::classifier::{
    Classifier, ClassifierError, Scores, TorchClassifier, CLASS_LABELS, NUM_CLASSES,
};
use super::preprocess::{PreprocessError, Preprocessor};

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error("Image file missing")]
    MissingImage,
    #[error("Invalid filename")]
    InvalidFilename,
    #[error("Image file is empty")]
    EmptyImage,
    #[error("Image file too large (limit is {limit} bytes)")]
    TooLarge { limit: usize },
    #[error("Invalid multipart upload: {0}")]
    Upload(String),
    #[error("Failed to decode image: {0}")]
    Decode(#[source] PreprocessError),
    #[error("Inference failed: {0}")]
    Inference(#[from] ClassifierError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PreprocessError> for PredictError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::Empty => PredictError::EmptyImage,
            other => PredictError::Decode(other),
        }
    }
}

impl PredictError {
    /// Message safe to hand back to a caller. Internal failures are collapsed
    /// so that no paths or library detail leave the process.
    pub fn client_message(&self) -> String {
        match self {
            PredictError::Inference(_) | PredictError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            PredictError::ModelUnavailable | PredictError::Inference(_) | PredictError::Internal(_)
        )
    }
}

enum ModelState {
    Ready(Arc<dyn Classifier>),
    Unavailable(String),
}

/// Preprocessor + classifier behind one request/response contract.
///
/// Built once at startup and shared by reference with every handler.
pub struct PredictionService {
    preprocessor: Preprocessor,
    model: ModelState,
}

impl PredictionService {
    pub fn new(preprocessor: Preprocessor, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            preprocessor,
            model: ModelState::Ready(classifier),
        }
    }

    /// A service whose model failed to load. Every prediction is refused
    /// without another load attempt.
    pub fn unavailable(preprocessor: Preprocessor, reason: impl Into<String>) -> Self {
        Self {
            preprocessor,
            model: ModelState::Unavailable(reason.into()),
        }
    }

    /// Loads the weights once. A load failure is logged and leaves the
    /// service running in the unavailable state.
    pub fn load(preprocessor: Preprocessor, path: &Path, device: Device) -> Self {
        match TorchClassifier::load(path, device) {
            Ok(classifier) => {
                log::info!("Model ready on {}", classifier.device_name());
                Self::new(preprocessor, Arc::new(classifier))
            }
            Err(e) => {
                log::error!("Failed to load model: {}", e);
                log::warn!("Serving without a model; every prediction will fail until restart");
                Self::unavailable(preprocessor, e.to_string())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.model, ModelState::Ready(_))
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.model {
            ModelState::Ready(_) => None,
            ModelState::Unavailable(reason) => Some(reason),
        }
    }

    pub fn predict(&self, image: &[u8]) -> Result<PredictionResponse, PredictError> {
        let classifier = match &self.model {
            ModelState::Ready(classifier) => classifier,
            ModelState::Unavailable(_) => return Err(PredictError::ModelUnavailable),
        };
        if image.is_empty() {
            return Err(PredictError::EmptyImage);
        }

        let batch = self.preprocessor.preprocess(image)?;
        let scores = classifier.classify(&batch)?;
        let first = scores.first().ok_or(ClassifierError::EmptyOutput)?;
        to_prediction(first).map_err(PredictError::from)
    }
}

fn to_prediction(scores: &Scores) -> Result<PredictionResponse, ClassifierError> {
    if !scores.iter().all(|s| s.is_finite()) {
        return Err(ClassifierError::NonFinite(scores.to_vec()));
    }

    let probabilities = softmax(scores);
    let predicted_class = CLASS_LABELS[argmax(&probabilities)];
    let probabilities = CLASS_LABELS
        .iter()
        .copied()
        .zip(probabilities)
        .collect::<Vec<(ClassLabel, f64)>>();

    Ok(PredictionResponse {
        predicted_class,
        probabilities: Probabilities::new(probabilities),
    })
}

/// Softmax in f64, shifted by the max score so large logits cannot overflow.
pub fn softmax(scores: &Scores) -> [f64; NUM_CLASSES] {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let mut out = [0.0; NUM_CLASSES];
    for (p, s) in out.iter_mut().zip(scores) {
        *p = (*s as f64 - max).exp();
    }
    let total: f64 = out.iter().sum();
    for p in out.iter_mut() {
        *p /= total;
    }
    out
}

/// Index of the largest value; the first one wins a tie.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, value) in values.iter().enumerate().skip(1) {
        if *value > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{
        empty_farbfeld, encode, save_random_resnet, solid_rgb, temp_artifact, BrokenClassifier,
        FixedScores, BROKEN_DETAIL,
    };
    use image::ImageFormat;

    fn service_with(scores: Scores) -> PredictionService {
        PredictionService::new(Preprocessor::default(), Arc::new(FixedScores(scores)))
    }

    fn black_png() -> Vec<u8> {
        encode(&solid_rgb(50, 50, [0, 0, 0]), ImageFormat::Png)
    }

    fn assert_invariants(result: &PredictionResponse) {
        let labels: Vec<ClassLabel> = result.probabilities.iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, CLASS_LABELS);
        assert!(result.probabilities.iter().all(|(_, p)| (0.0..=1.0).contains(p)));
        assert!((result.probabilities.total() - 1.0).abs() < 1e-6);

        let best = result
            .probabilities
            .iter()
            .fold(None::<(ClassLabel, f64)>, |best, &(label, p)| match best {
                Some((_, top)) if top >= p => best,
                _ => Some((label, p)),
            })
            .map(|(label, _)| label);
        assert_eq!(Some(result.predicted_class), best);
    }

    #[test]
    fn softmax_sums_to_one_even_for_large_logits() {
        for scores in [
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 2.0, 3.0, 4.0],
            [1000.0, -1000.0, 999.0, 0.5],
            [-80.0, -81.0, -79.5, -200.0],
        ] {
            let probabilities = softmax(&scores);
            assert!((probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-9);
            assert!(probabilities.iter().all(|p| p.is_finite() && (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn softmax_matches_closed_form() {
        let probabilities = softmax(&[0.0, 2.0_f32.ln(), 0.0, 0.0]);
        assert!((probabilities[0] - 0.2).abs() < 1e-6);
        assert!((probabilities[1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn argmax_prefers_first_of_equal_values() {
        assert_eq!(argmax(&[0.25, 0.25, 0.25, 0.25]), 0);
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), 1);
        assert_eq!(argmax(&[0.1, 0.2, 0.3, 0.4]), 3);
    }

    #[test]
    fn black_image_yields_all_four_labels() {
        let result = service_with([0.3, 2.5, -1.0, 0.7]).predict(&black_png()).unwrap();
        assert_eq!(result.predicted_class, ClassLabel::Pneumonia);
        assert_eq!(result.probabilities.len(), 4);
        assert_invariants(&result);
    }

    #[test]
    fn ties_resolve_to_label_order() {
        let result = service_with([1.0, 3.0, 3.0, 3.0]).predict(&black_png()).unwrap();
        assert_eq!(result.predicted_class, ClassLabel::Pneumonia);

        let result = service_with([0.0; 4]).predict(&black_png()).unwrap();
        assert_eq!(result.predicted_class, ClassLabel::Normal);
        assert_invariants(&result);
    }

    #[test]
    fn unavailable_model_refuses_every_request() {
        let service = PredictionService::unavailable(Preprocessor::default(), "missing weights");
        assert!(!service.is_ready());
        assert_eq!(service.unavailable_reason(), Some("missing weights"));
        for input in [black_png(), Vec::new(), b"junk".to_vec()] {
            assert!(matches!(service.predict(&input), Err(PredictError::ModelUnavailable)));
        }
    }

    #[test]
    fn failed_load_leaves_service_unavailable() {
        let path = temp_artifact("never-written.safetensors");
        let service = PredictionService::load(Preprocessor::default(), &path, Device::Cpu);
        assert!(!service.is_ready());
        assert!(service.unavailable_reason().unwrap().contains("not found"));

        let err = service.predict(&black_png()).unwrap_err();
        assert!(matches!(err, PredictError::ModelUnavailable));
        assert_eq!(err.client_message(), "Model not loaded");
    }

    #[test]
    fn corrupt_weights_leave_service_unavailable() {
        let path = temp_artifact("corrupt.safetensors");
        std::fs::write(&path, b"not a tensor file").unwrap();
        let service = PredictionService::load(Preprocessor::default(), &path, Device::Cpu);
        assert!(!service.is_ready());
        assert!(matches!(service.predict(&black_png()), Err(PredictError::ModelUnavailable)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn successful_load_is_ready() {
        let path = save_random_resnet(NUM_CLASSES as i64);
        let service = PredictionService::load(Preprocessor::default(), &path, Device::Cpu);
        assert!(service.is_ready());
        assert_invariants(&service.predict(&black_png()).unwrap());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn zero_sized_image_is_a_decode_error() {
        let err = service_with([0.0; 4]).predict(&empty_farbfeld()).unwrap_err();
        assert!(matches!(err, PredictError::Decode(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn input_failures_are_client_errors() {
        let service = service_with([0.0; 4]);

        let empty = service.predict(&[]).unwrap_err();
        assert!(matches!(empty, PredictError::EmptyImage));
        assert!(empty.is_client_error());

        let garbage = service.predict(b"GIF89a but not really").unwrap_err();
        assert!(matches!(garbage, PredictError::Decode(_)));
        assert!(garbage.is_client_error());
        assert!(garbage.client_message().starts_with("Failed to decode image: "));
    }

    #[test]
    fn inference_failures_do_not_leak_detail() {
        let service = PredictionService::new(Preprocessor::default(), Arc::new(BrokenClassifier));
        let err = service.predict(&black_png()).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
        assert!(!err.is_client_error());
        assert!(err.to_string().contains(BROKEN_DETAIL));
        assert_eq!(err.client_message(), "Internal server error");
    }

    #[test]
    fn non_finite_scores_are_internal_errors() {
        let err = service_with([0.0, f32::NAN, 1.0, 0.0]).predict(&black_png()).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
    }

    #[test]
    fn identical_uploads_give_identical_results() {
        let path = save_random_resnet(NUM_CLASSES as i64);
        let classifier = TorchClassifier::load(&path, Device::Cpu).unwrap();
        let service = PredictionService::new(Preprocessor::default(), Arc::new(classifier));

        let image = encode(&solid_rgb(128, 96, [60, 120, 180]), ImageFormat::Png);
        let first = service.predict(&image).unwrap();
        let second = service.predict(&image).unwrap();
        assert_eq!(first, second);
        assert_invariants(&first);
        std::fs::remove_file(&path).ok();
    }
}
