pub mod classifier;
pub mod device;
pub mod preprocess;
pub mod service;

#[cfg(test)]
pub mod testing;

pub use classifier::CLASS_LABELS;
pub use device::DevicePreference;
pub use preprocess::{ColorMode, Preprocessor};
pub use service::{PredictError, PredictionService};
