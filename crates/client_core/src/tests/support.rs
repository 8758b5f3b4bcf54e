use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::{PatientInfo, PredictionId, PredictionRecord, PredictionSummary},
    protocol::{
        AuthResponse, ListPredictionsQuery, LoginRequest, PredictionPage, RegisterRequest,
        DEFAULT_PAGE_SIZE,
    },
};
use tokio::{net::TcpListener, sync::Mutex};

use crate::{
    api::{AuthApi, PredictionApi},
    error::ClientError,
    upload::{ProgressSink, UploadFile},
};

pub fn record_json(id: i64) -> Value {
    json!({
        "id": id,
        "user_id": 3,
        "image_filename": "xray.png",
        "prediction_class": "NORMAL",
        "confidence_score": 0.9321,
        "inference_time_ms": 412.4,
        "created_at": "2024-05-01T10:15:00.123456",
        "status": "completed",
        "reviewed_by_doctor": false,
        "is_flagged": false
    })
}

pub fn record(id: i64) -> PredictionRecord {
    serde_json::from_value(record_json(id)).expect("valid record")
}

pub fn summary(id: i64) -> PredictionSummary {
    PredictionSummary::from(&record(id))
}

/// The list endpoint's row shape for a stored record. Unset flags come back
/// as `null`, the way the server reports them for rows nobody reviewed.
pub fn summary_json(record: &Value) -> Value {
    let flag = |value: &Value| {
        if value == &json!(true) {
            json!(true)
        } else {
            Value::Null
        }
    };
    json!({
        "id": record["id"],
        "prediction_class": record["prediction_class"],
        "confidence_score": record["confidence_score"],
        "created_at": record["created_at"],
        "is_flagged": flag(&record["is_flagged"]),
        "reviewed_by_doctor": flag(&record["reviewed_by_doctor"])
    })
}

pub fn png(len: usize) -> UploadFile {
    UploadFile::new("xray.png", "image/png", vec![7u8; len])
}

pub fn token_response(token: &str, user: Option<Value>) -> AuthResponse {
    AuthResponse {
        access_token: Some(token.to_string()),
        token_type: Some("bearer".to_string()),
        user,
        ..AuthResponse::default()
    }
}

pub struct FakeAuth {
    pub response: Mutex<Result<AuthResponse, ClientError>>,
    pub logins: Mutex<Vec<LoginRequest>>,
    pub registrations: Mutex<Vec<RegisterRequest>>,
}

impl FakeAuth {
    pub fn returning(response: Result<AuthResponse, ClientError>) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
            logins: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
        })
    }

    pub async fn respond_with(&self, response: Result<AuthResponse, ClientError>) {
        *self.response.lock().await = response;
    }
}

#[async_trait]
impl AuthApi for FakeAuth {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ClientError> {
        self.logins.lock().await.push(request.clone());
        self.response.lock().await.clone()
    }

    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ClientError> {
        self.registrations.lock().await.push(request.clone());
        self.response.lock().await.clone()
    }
}

/// Scripted prediction backend. `progress` is replayed through the sink
/// before `predict` resolves.
pub struct FakePredictions {
    pub progress: Vec<u8>,
    pub predict: Mutex<Result<PredictionRecord, ClientError>>,
    pub fetched: Mutex<Option<PredictionRecord>>,
    pub history: Mutex<Result<Vec<PredictionSummary>, ClientError>>,
    pub mutations_succeed: bool,
    pub calls: Mutex<Vec<String>>,
    pub tokens: Mutex<Vec<String>>,
}

impl FakePredictions {
    pub fn new(progress: Vec<u8>, predict: Result<PredictionRecord, ClientError>) -> Self {
        Self {
            progress,
            predict: Mutex::new(predict),
            fetched: Mutex::new(None),
            history: Mutex::new(Ok(Vec::new())),
            mutations_succeed: true,
            calls: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    async fn record_call(&self, token: &str, call: String) {
        self.tokens.lock().await.push(token.to_string());
        self.calls.lock().await.push(call);
    }

    fn mutation_result(&self) -> Result<(), ClientError> {
        if self.mutations_succeed {
            Ok(())
        } else {
            Err(ClientError::ServerFault {
                status: 500,
                message: "Internal Server Error".to_string(),
            })
        }
    }
}

#[async_trait]
impl PredictionApi for FakePredictions {
    async fn predict(
        &self,
        token: &str,
        upload: &UploadFile,
        _patient: &PatientInfo,
        progress: ProgressSink,
    ) -> Result<PredictionRecord, ClientError> {
        self.record_call(token, format!("predict {}", upload.file_name))
            .await;
        for percent in &self.progress {
            progress.report(*percent);
        }
        self.predict.lock().await.clone()
    }

    async fn get_prediction(
        &self,
        token: &str,
        id: PredictionId,
    ) -> Result<PredictionRecord, ClientError> {
        self.record_call(token, format!("get {id}")).await;
        self.fetched
            .lock()
            .await
            .clone()
            .ok_or_else(|| ClientError::AuthRejected {
                status: 404,
                message: "Prediction not found".to_string(),
            })
    }

    async fn list_predictions(
        &self,
        token: &str,
        query: ListPredictionsQuery,
    ) -> Result<PredictionPage, ClientError> {
        self.record_call(
            token,
            format!(
                "list include_images={} skip={} limit={}",
                query.include_images, query.skip, query.limit
            ),
        )
        .await;
        let rows = self.history.lock().await.clone()?;
        let total = rows.len() as u64;
        Ok(PredictionPage {
            data: rows
                .into_iter()
                .skip(query.skip as usize)
                .take(query.limit as usize)
                .collect(),
            total,
            page: query.skip / query.limit.max(1) + 1,
            per_page: query.limit,
        })
    }

    async fn delete_prediction(&self, token: &str, id: PredictionId) -> Result<(), ClientError> {
        self.record_call(token, format!("delete {id}")).await;
        self.mutation_result()
    }

    async fn flag_prediction(&self, token: &str, id: PredictionId) -> Result<(), ClientError> {
        self.record_call(token, format!("flag {id}")).await;
        self.mutation_result()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReceivedUpload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size: usize,
    pub fields: Vec<(String, String)>,
}

/// State behind the mock HTTP backend. Handlers answer from the configured
/// responses and record what they were sent.
#[derive(Clone)]
pub struct MockBackend {
    pub login: Arc<Mutex<(StatusCode, Value)>>,
    pub predict: Arc<Mutex<(StatusCode, Value)>>,
    /// Replaces the paged listing built from `records` when set.
    pub list: Arc<Mutex<Option<(StatusCode, Value)>>>,
    pub records: Arc<Mutex<Vec<Value>>>,
    pub uploads: Arc<Mutex<Vec<ReceivedUpload>>>,
    pub authorization: Arc<Mutex<Vec<Option<String>>>>,
    pub list_queries: Arc<Mutex<Vec<ListCall>>>,
    pub deleted: Arc<Mutex<Vec<i64>>>,
    pub flagged: Arc<Mutex<Vec<i64>>>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            login: Arc::new(Mutex::new((
                StatusCode::OK,
                json!({"access_token": "tok123", "token_type": "bearer"}),
            ))),
            predict: Arc::new(Mutex::new((
                StatusCode::OK,
                json!({"success": true, "message": "ok", "data": record_json(7)}),
            ))),
            list: Arc::new(Mutex::new(None)),
            records: Arc::new(Mutex::new(vec![record_json(7), record_json(5)])),
            uploads: Arc::new(Mutex::new(Vec::new())),
            authorization: Arc::new(Mutex::new(Vec::new())),
            list_queries: Arc::new(Mutex::new(Vec::new())),
            deleted: Arc::new(Mutex::new(Vec::new())),
            flagged: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_login(&self, status: StatusCode, body: Value) {
        *self.login.lock().await = (status, body);
    }

    pub async fn set_predict(&self, status: StatusCode, body: Value) {
        *self.predict.lock().await = (status, body);
    }

    pub async fn set_list(&self, status: StatusCode, body: Value) {
        *self.list.lock().await = Some((status, body));
    }

    async fn note_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.authorization.lock().await.push(value);
    }
}

async fn handle_login(State(state): State<MockBackend>, Json(_body): Json<Value>) -> impl IntoResponse {
    let (status, body) = state.login.lock().await.clone();
    (status, Json(body))
}

async fn handle_register(
    State(state): State<MockBackend>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let (status, mut response) = state.login.lock().await.clone();
    if status.is_success() {
        response["user"] = json!({
            "id": 42,
            "email": body["email"],
            "is_active": true
        });
    }
    (status, Json(response))
}

async fn handle_predict(
    State(state): State<MockBackend>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    state.note_auth(&headers).await;
    let mut upload = ReceivedUpload::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            upload.file_name = field.file_name().map(str::to_string);
            upload.content_type = field.content_type().map(str::to_string);
            upload.size = field.bytes().await.map(|b| b.len()).unwrap_or_default();
        } else {
            let value = field.text().await.unwrap_or_default();
            upload.fields.push((name, value));
        }
    }
    state.uploads.lock().await.push(upload);
    let (status, body) = state.predict.lock().await.clone();
    (status, Json(body))
}

/// Query parameters the list endpoint received, as sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListCall {
    pub include_images: Option<bool>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

async fn handle_list(
    State(state): State<MockBackend>,
    headers: HeaderMap,
    Query(query): Query<ListCall>,
) -> impl IntoResponse {
    state.note_auth(&headers).await;
    state.list_queries.lock().await.push(query.clone());
    if let Some((status, body)) = state.list.lock().await.clone() {
        return (status, Json(body));
    }

    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let records = state.records.lock().await;
    let rows = records
        .iter()
        .skip(skip as usize)
        .take(limit as usize)
        .map(summary_json)
        .collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Retrieved predictions",
            "data": rows,
            "total": records.len(),
            "page": skip / limit.max(1) + 1,
            "per_page": limit
        })),
    )
}

async fn handle_get(
    State(state): State<MockBackend>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state.note_auth(&headers).await;
    let found = state
        .records
        .lock()
        .await
        .iter()
        .find(|record| record["id"] == json!(id))
        .cloned();
    match found {
        Some(record) => (StatusCode::OK, Json(json!({ "data": record }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Prediction not found"})),
        ),
    }
}

async fn handle_delete(
    State(state): State<MockBackend>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StatusCode {
    state.note_auth(&headers).await;
    let mut records = state.records.lock().await;
    let before = records.len();
    records.retain(|record| record["id"] != json!(id));
    if records.len() == before {
        return StatusCode::NOT_FOUND;
    }
    state.deleted.lock().await.push(id);
    StatusCode::NO_CONTENT
}

async fn handle_flag(
    State(state): State<MockBackend>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state.note_auth(&headers).await;
    let mut records = state.records.lock().await;
    match records.iter_mut().find(|record| record["id"] == json!(id)) {
        Some(record) => {
            record["is_flagged"] = json!(true);
            state.flagged.lock().await.push(id);
            (StatusCode::OK, Json(json!({"message": "flagged"})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Prediction not found"})),
        ),
    }
}

pub async fn spawn_backend() -> anyhow::Result<(String, MockBackend)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = MockBackend::new();
    let app = Router::new()
        .route("/api/v1/auth/login", post(handle_login))
        .route("/api/v1/auth/register", post(handle_register))
        .route("/api/v1/prediction/predict", post(handle_predict))
        .route("/api/v1/prediction/", get(handle_list))
        .route(
            "/api/v1/prediction/:id",
            get(handle_get).delete(handle_delete),
        )
        .route("/api/v1/prediction/:id/flag", post(handle_flag))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}
