//! HTTP client for the auth and prediction endpoints.
//!
//! Controllers depend on the [`AuthApi`] and [`PredictionApi`] traits;
//! [`ApiClient`] is the reqwest-backed implementation of both.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Body, Client, Response,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{PatientInfo, PredictionId, PredictionRecord},
    error::ApiErrorBody,
    protocol::{
        fields, routes, AuthResponse, Envelope, ListPredictionsQuery, LoginRequest,
        PredictionPage, RegisterRequest,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    error::ClientError,
    upload::{percent, ProgressSink, UploadFile},
};

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ClientError>;
    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ClientError>;
}

#[async_trait]
pub trait PredictionApi: Send + Sync {
    async fn predict(
        &self,
        token: &str,
        upload: &UploadFile,
        patient: &PatientInfo,
        progress: ProgressSink,
    ) -> Result<PredictionRecord, ClientError>;
    async fn get_prediction(
        &self,
        token: &str,
        id: PredictionId,
    ) -> Result<PredictionRecord, ClientError>;
    async fn list_predictions(
        &self,
        token: &str,
        query: ListPredictionsQuery,
    ) -> Result<PredictionPage, ClientError>;
    async fn delete_prediction(&self, token: &str, id: PredictionId) -> Result<(), ClientError>;
    async fn flag_prediction(&self, token: &str, id: PredictionId) -> Result<(), ClientError>;
}

pub struct ApiClient {
    http: Client,
    base_url: Url,
    upload_chunk_size: usize,
}

impl ApiClient {
    pub fn new(settings: &ClientSettings) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build http client")?;

        Ok(Self {
            http,
            base_url: parse_base_url(&settings.api_base_url)?,
            upload_chunk_size: settings.upload_chunk_size.max(1),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|err| ClientError::Transport(format!("invalid request url '{path}': {err}")))
    }

    async fn post_auth<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        fallback: &str,
    ) -> Result<AuthResponse, ClientError> {
        let response = self.http.post(self.endpoint(path)?).json(body).send().await?;
        let response = check_status(response, fallback).await?;
        decode(response).await
    }

    fn progress_body(&self, bytes: &[u8], progress: ProgressSink) -> Body {
        let total = bytes.len() as u64;
        let chunks = bytes
            .chunks(self.upload_chunk_size)
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            progress.report(percent(sent, total));
            Ok::<_, std::io::Error>(chunk)
        }));
        Body::wrap_stream(stream)
    }
}

fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let mut base = raw.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).with_context(|| format!("invalid api base url '{raw}'"))
}

/// Maps non-2xx responses onto the error taxonomy, pulling the server's
/// message out of the body when there is one.
async fn check_status(response: Response, fallback: &str) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .json::<ApiErrorBody>()
        .await
        .unwrap_or_default();
    let message = body.human_message(fallback);
    debug!(status = status.as_u16(), %message, "api: request rejected");

    if status.is_client_error() {
        Err(ClientError::AuthRejected {
            status: status.as_u16(),
            message,
        })
    } else {
        Err(ClientError::ServerFault {
            status: status.as_u16(),
            message,
        })
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let raw = response.bytes().await?;
    serde_json::from_slice(&raw)
        .map_err(|err| ClientError::MalformedResponse(format!("unexpected response body: {err}")))
}

fn admit(record: PredictionRecord) -> Result<PredictionRecord, ClientError> {
    record
        .validate()
        .map_err(|err| ClientError::MalformedResponse(format!("prediction {}: {err}", record.id)))?;
    Ok(record)
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ClientError> {
        self.post_auth(routes::LOGIN, request, "Login failed").await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ClientError> {
        self.post_auth(routes::REGISTER, request, "Registration failed")
            .await
    }
}

#[async_trait]
impl PredictionApi for ApiClient {
    async fn predict(
        &self,
        token: &str,
        upload: &UploadFile,
        patient: &PatientInfo,
        progress: ProgressSink,
    ) -> Result<PredictionRecord, ClientError> {
        let body = self.progress_body(&upload.bytes, progress);
        let file_part = Part::stream_with_length(body, upload.size_bytes())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|err| ClientError::InvalidUpload(format!("invalid mime type: {err}")))?;

        let mut form = Form::new().part(fields::FILE, file_part);
        if let Some(age) = patient.age {
            form = form.text(fields::PATIENT_AGE, age.to_string());
        }
        if let Some(gender) = patient.gender.clone().filter(|g| !g.is_empty()) {
            form = form.text(fields::PATIENT_GENDER, gender);
        }
        if let Some(symptoms) = patient.symptoms.clone().filter(|s| !s.is_empty()) {
            form = form.text(fields::PATIENT_SYMPTOMS, symptoms);
        }

        let response = self
            .http
            .post(self.endpoint(routes::PREDICT)?)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response, "Prediction failed").await?;
        let envelope: Envelope<PredictionRecord> = decode(response).await?;
        if envelope.success == Some(false) {
            return Err(ClientError::MalformedResponse(
                envelope
                    .message
                    .unwrap_or_else(|| "Prediction failed".to_string()),
            ));
        }
        admit(envelope.data)
    }

    async fn get_prediction(
        &self,
        token: &str,
        id: PredictionId,
    ) -> Result<PredictionRecord, ClientError> {
        let response = self
            .http
            .get(self.endpoint(&routes::prediction(id.0))?)
            .bearer_auth(token)
            .send()
            .await?;
        let response = check_status(response, "Failed to load prediction").await?;
        let envelope: Envelope<PredictionRecord> = decode(response).await?;
        admit(envelope.data)
    }

    async fn list_predictions(
        &self,
        token: &str,
        query: ListPredictionsQuery,
    ) -> Result<PredictionPage, ClientError> {
        let response = self
            .http
            .get(self.endpoint(routes::PREDICTIONS)?)
            .query(&query)
            .bearer_auth(token)
            .send()
            .await?;
        let response = check_status(response, "Failed to load predictions").await?;
        let mut page: PredictionPage = decode(response).await?;

        page.data.retain(|row| match row.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!(id = %row.id, "api: dropping invalid history entry: {err}");
                false
            }
        });
        Ok(page)
    }

    async fn delete_prediction(&self, token: &str, id: PredictionId) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.endpoint(&routes::prediction(id.0))?)
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response, "Failed to delete prediction").await?;
        Ok(())
    }

    async fn flag_prediction(&self, token: &str, id: PredictionId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint(&routes::flag(id.0))?)
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response, "Failed to flag prediction").await?;
        Ok(())
    }
}
