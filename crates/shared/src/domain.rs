use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(PredictionId);

#[derive(Debug, Error)]
pub enum InvalidRecord {
    #[error("confidence score {0} is outside 0.0..=1.0")]
    ConfidenceOutOfRange(f64),
    #[error("user profile is malformed: {0}")]
    Profile(String),
}

/// Diagnostic label produced by the classifier.
///
/// Unknown labels are kept verbatim so a newer backend does not break older
/// clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PredictionClass {
    Normal,
    Pneumonia,
    Other(String),
}

impl PredictionClass {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Normal => "NORMAL",
            Self::Pneumonia => "PNEUMONIA",
            Self::Other(label) => label,
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl From<String> for PredictionClass {
    fn from(value: String) -> Self {
        match value.as_str() {
            "NORMAL" => Self::Normal,
            "PNEUMONIA" => Self::Pneumonia,
            _ => Self::Other(value),
        }
    }
}

impl From<PredictionClass> for String {
    fn from(value: PredictionClass) -> Self {
        match value {
            PredictionClass::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PredictionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile of the signed-in account. Fields the server adds beyond the known
/// ones are carried in `extra` and survive persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            username: None,
            full_name: None,
            extra: Map::new(),
        }
    }

    /// Builds a profile from client-submitted fields overlaid with whatever
    /// the server returned. Server fields win on conflict; a non-object server
    /// payload contributes nothing.
    pub fn from_parts(
        submitted: Map<String, Value>,
        server: Option<&Value>,
    ) -> Result<Self, InvalidRecord> {
        let mut merged = submitted;
        if let Some(Value::Object(fields)) = server {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(Value::Object(merged))
            .map_err(|err| InvalidRecord::Profile(err.to_string()))
    }

    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientInfo {
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub symptoms: Option<String>,
}

fn default_status() -> String {
    "completed".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: PredictionId,
    pub user_id: UserId,
    #[serde(default)]
    pub image_filename: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub patient_age: Option<u32>,
    #[serde(default)]
    pub patient_gender: Option<String>,
    #[serde(default)]
    pub patient_symptoms: Option<String>,
    pub prediction_class: PredictionClass,
    pub confidence_score: f64,
    /// Absent when the backend did not time the inference.
    #[serde(default, deserialize_with = "timing::deserialize_millis")]
    pub inference_time_ms: Option<u64>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, deserialize_with = "nullable::flag")]
    pub reviewed_by_doctor: bool,
    #[serde(default, deserialize_with = "nullable::flag")]
    pub is_flagged: bool,
    #[serde(default)]
    pub doctor_notes: Option<String>,
    #[serde(default)]
    pub doctor_diagnosis: Option<String>,
}

impl PredictionRecord {
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        check_confidence(self.confidence_score)
    }

    /// Confidence as a percentage rounded to two decimals.
    pub fn confidence_percent(&self) -> f64 {
        percent_two_decimals(self.confidence_score)
    }
}

/// One row of the history listing. The list endpoint returns this reduced
/// shape rather than full records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub id: PredictionId,
    pub prediction_class: PredictionClass,
    pub confidence_score: f64,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "nullable::flag")]
    pub is_flagged: bool,
    #[serde(default, deserialize_with = "nullable::flag")]
    pub reviewed_by_doctor: bool,
}

impl PredictionSummary {
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        check_confidence(self.confidence_score)
    }

    pub fn confidence_percent(&self) -> f64 {
        percent_two_decimals(self.confidence_score)
    }
}

impl From<&PredictionRecord> for PredictionSummary {
    fn from(record: &PredictionRecord) -> Self {
        Self {
            id: record.id,
            prediction_class: record.prediction_class.clone(),
            confidence_score: record.confidence_score,
            created_at: record.created_at,
            is_flagged: record.is_flagged,
            reviewed_by_doctor: record.reviewed_by_doctor,
        }
    }
}

fn check_confidence(score: f64) -> Result<(), InvalidRecord> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(InvalidRecord::ConfidenceOutOfRange(score));
    }
    Ok(())
}

fn percent_two_decimals(score: f64) -> f64 {
    (score * 10_000.0).round() / 100.0
}

mod timing {
    use serde::{de::Error, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Integer(u64),
        Float(f64),
    }

    pub fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Millis>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Millis::Integer(value)) => Ok(Some(value)),
            Some(Millis::Float(value)) if value.is_finite() && value >= 0.0 => {
                Ok(Some(value.round() as u64))
            }
            Some(Millis::Float(value)) => Err(D::Error::custom(format!(
                "inference time must be non-negative, got {value}"
            ))),
        }
    }
}

mod nullable {
    use serde::{Deserialize, Deserializer};

    /// Optional booleans arrive as `null` for rows nobody has touched yet.
    pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
    }
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        // the backend emits naive timestamps that are already UTC
        NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}"))),
        }
    }
}
