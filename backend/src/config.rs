use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::inference::{ColorMode, DevicePreference};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MODEL_PATH: &str = "model.safetensors";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Optional YAML layer; every field can be overridden from the environment.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub model: ModelSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub max_upload_bytes: Option<usize>,
    pub allowed_origin: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub path: Option<PathBuf>,
    pub device: Option<String>,
    pub color_mode: Option<String>,
}

impl FileConfig {
    pub fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub max_upload_bytes: usize,
    pub allowed_origin: Option<String>,
    pub model_path: PathBuf,
    pub device: DevicePreference,
    pub color_mode: ColorMode,
}

impl AppConfig {
    /// Reads `CONFIG_PATH` (if set) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match env::var("CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => FileConfig::load(PathBuf::from(path))?,
            _ => FileConfig::default(),
        };
        Self::from_sources(file, |key| env::var(key).ok())
    }

    /// Environment values win over the file; the file wins over defaults.
    pub fn from_sources<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let FileConfig { server, model } = file;

        let host = lookup("HOST")
            .or(server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup("PORT") {
            Some(raw) => parse_value("PORT", &raw)?,
            None => server.port.unwrap_or(DEFAULT_PORT),
        };
        let workers = match lookup("WORKERS") {
            Some(raw) => Some(parse_value("WORKERS", &raw)?),
            None => server.workers,
        };
        if workers == Some(0) {
            return Err(ConfigError::Invalid {
                key: "WORKERS",
                reason: "must be at least 1".to_string(),
            });
        }
        let max_upload_bytes = match lookup("MAX_UPLOAD_BYTES") {
            Some(raw) => parse_value("MAX_UPLOAD_BYTES", &raw)?,
            None => server.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        };
        if max_upload_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_UPLOAD_BYTES",
                reason: "must be greater than zero".to_string(),
            });
        }
        let allowed_origin = lookup("ALLOWED_ORIGIN").or(server.allowed_origin);

        let model_path = lookup("MODEL_PATH")
            .map(PathBuf::from)
            .or(model.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH));
        let device = match lookup("DEVICE").or(model.device) {
            Some(raw) => parse_value("DEVICE", &raw)?,
            None => DevicePreference::default(),
        };
        let color_mode = match lookup("COLOR_MODE").or(model.color_mode) {
            Some(raw) => parse_value("COLOR_MODE", &raw)?,
            None => ColorMode::default(),
        };

        Ok(Self {
            host,
            port,
            workers,
            max_upload_bytes,
            allowed_origin,
            model_path,
            device,
            color_mode,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("'{}': {}", raw, e),
    })
}
