use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure category a view layer can branch on without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Transport,
    AuthRejected,
    ServerFault,
    MalformedResponse,
    AuthorizationMissing,
    InvalidUpload,
}

/// One entry of a request-validation failure (`422`) body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default)]
    pub loc: Vec<Value>,
    pub msg: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Text(String),
    Issues(Vec<ValidationIssue>),
    Other(Value),
}

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub detail: Option<ErrorDetail>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub fn human_message(&self, fallback: &str) -> String {
        let from_detail = match &self.detail {
            Some(ErrorDetail::Text(text)) if !text.trim().is_empty() => Some(text.clone()),
            Some(ErrorDetail::Issues(issues)) if !issues.is_empty() => Some(
                issues
                    .iter()
                    .map(|issue| issue.msg.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => None,
        };

        from_detail
            .or_else(|| {
                self.message
                    .clone()
                    .filter(|message| !message.trim().is_empty())
            })
            .unwrap_or_else(|| fallback.to_string())
    }
}
