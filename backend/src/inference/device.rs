use std::fmt;
use std::str::FromStr;
use tch::{Cuda, Device};

/// Requested placement for the model, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// First CUDA device if present, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Mps,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "auto" | "" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda(0)),
            "mps" => Ok(DevicePreference::Mps),
            other => match other.strip_prefix("cuda:") {
                Some(index) => index
                    .parse()
                    .map(DevicePreference::Cuda)
                    .map_err(|_| format!("invalid CUDA device index '{}'", index)),
                None => Err(format!("unknown device '{}'", other)),
            },
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Auto => f.write_str("auto"),
            DevicePreference::Cpu => f.write_str("cpu"),
            DevicePreference::Cuda(index) => write!(f, "cuda:{}", index),
            DevicePreference::Mps => f.write_str("mps"),
        }
    }
}

impl DevicePreference {
    /// Picks the concrete device. An unavailable accelerator falls back to the CPU.
    pub fn resolve(self) -> Device {
        match self {
            DevicePreference::Auto => Device::cuda_if_available(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda(index) => {
                let count = if Cuda::is_available() { Cuda::device_count() } else { 0 };
                if (index as i64) < count {
                    Device::Cuda(index)
                } else {
                    log::warn!(
                        "CUDA device {} requested but {} device(s) available, using CPU",
                        index,
                        count
                    );
                    Device::Cpu
                }
            }
            DevicePreference::Mps => {
                if tch::utils::has_mps() {
                    Device::Mps
                } else {
                    log::warn!("MPS requested but not available, using CPU");
                    Device::Cpu
                }
            }
        }
    }
}
