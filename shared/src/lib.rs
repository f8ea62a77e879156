use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

/// Diagnostic classes the chest X-ray model can emit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassLabel {
    Normal,
    Pneumonia,
    Unknown,
    Tuberculosis,
}

/// Per-class probabilities, kept in the order the model emits them.
///
/// Serializes as a JSON object keyed by label name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Probabilities(Vec<(ClassLabel, f64)>);

impl Probabilities {
    pub fn new(entries: Vec<(ClassLabel, f64)>) -> Self {
        Self(entries)
    }

    pub fn get(&self, label: ClassLabel) -> Option<f64> {
        self.0
            .iter()
            .find(|(candidate, _)| *candidate == label)
            .map(|(_, p)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ClassLabel, f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.iter().map(|(_, p)| p).sum()
    }
}

impl Serialize for Probabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, probability) in &self.0 {
            map.serialize_entry(label.as_ref(), probability)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Probabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProbabilitiesVisitor;

        impl<'de> Visitor<'de> for ProbabilitiesVisitor {
            type Value = Probabilities;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of class labels to probabilities")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, probability)) = access.next_entry::<String, f64>()? {
                    let label = ClassLabel::from_str(&key)
                        .map_err(|_| de::Error::custom(format!("unknown class label: {}", key)))?;
                    entries.push((label, probability));
                }
                Ok(Probabilities(entries))
            }
        }

        deserializer.deserialize_map(ProbabilitiesVisitor)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResponse {
    pub predicted_class: ClassLabel,
    pub probabilities: Probabilities,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub classes: Vec<ClassLabel>,
}
