use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::PredictionSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub username: String,
    pub full_name: String,
}

/// Body of a successful login or registration. Every field is optional on
/// the wire; callers decide which absences are fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `{success, message, data}` wrapper used by the prediction endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: T,
}

/// Rows per history page when the caller does not ask for a size; matches
/// the server's own default.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPredictionsQuery {
    pub include_images: bool,
    pub skip: u32,
    pub limit: u32,
}

impl ListPredictionsQuery {
    pub fn first_page(include_images: bool) -> Self {
        Self {
            include_images,
            skip: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One page of the history listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPage {
    pub data: Vec<PredictionSummary>,
    #[serde(default)]
    pub total: u64,
    #[serde(default = "first_page_number")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub per_page: u32,
}

fn first_page_number() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

pub mod fields {
    pub const FILE: &str = "file";
    pub const PATIENT_AGE: &str = "patient_age";
    pub const PATIENT_GENDER: &str = "patient_gender";
    pub const PATIENT_SYMPTOMS: &str = "patient_symptoms";
}

pub mod routes {
    pub const LOGIN: &str = "api/v1/auth/login";
    pub const REGISTER: &str = "api/v1/auth/register";
    pub const PREDICT: &str = "api/v1/prediction/predict";
    pub const PREDICTIONS: &str = "api/v1/prediction/";

    pub fn prediction(id: i64) -> String {
        format!("api/v1/prediction/{id}")
    }

    pub fn flag(id: i64) -> String {
        format!("api/v1/prediction/{id}/flag")
    }
}
