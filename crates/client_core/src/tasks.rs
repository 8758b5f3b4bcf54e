//! Prediction submissions, upload progress and the per-session history cache.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use futures::Stream;
use shared::{
    domain::{PatientInfo, PredictionId, PredictionRecord, PredictionSummary},
    protocol::{ListPredictionsQuery, PredictionPage},
};
use tokio::sync::{broadcast, watch};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{error, info, warn};

use crate::{
    api::PredictionApi,
    error::ClientError,
    session::SessionController,
    store::Store,
    upload::{ProgressSink, UploadFile},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    Uploading,
    AwaitingResult,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub current: Option<PredictionRecord>,
    pub upload_progress: u8,
    pub phase: SubmissionPhase,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Rows of the most recently loaded history page, in server order.
    pub history: Vec<PredictionSummary>,
    /// Server-reported total for the history listing, once a page has loaded.
    pub history_total: Option<u64>,
    pub history_loading: bool,
    pub active_submission: Option<SubmissionId>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            current: None,
            upload_progress: 0,
            phase: SubmissionPhase::Idle,
            is_loading: false,
            error: None,
            history: Vec::new(),
            history_total: None,
            history_loading: false,
            active_submission: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    SubmissionStarted {
        submission: SubmissionId,
        file_name: String,
    },
    UploadProgress {
        submission: SubmissionId,
        percent: u8,
    },
    Completed {
        submission: SubmissionId,
        id: PredictionId,
    },
    Failed {
        submission: SubmissionId,
        message: String,
    },
    Cleared,
    Deleted {
        id: PredictionId,
    },
}

pub struct TaskController {
    api: Arc<dyn PredictionApi>,
    session: Arc<SessionController>,
    max_upload_bytes: u64,
    state: Store<TaskState>,
    events: broadcast::Sender<TaskEvent>,
    next_submission: AtomicU64,
}

impl TaskController {
    pub fn new(
        api: Arc<dyn PredictionApi>,
        session: Arc<SessionController>,
        max_upload_bytes: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            session,
            max_upload_bytes,
            state: Store::new(TaskState::default()),
            events,
            next_submission: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> TaskState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Upload progress of every submission started after this call, in the
    /// order the transport reported it. Lagged receivers skip ahead.
    pub fn progress_stream(&self) -> impl Stream<Item = (SubmissionId, u8)> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(TaskEvent::UploadProgress {
                submission,
                percent,
            }) => Some((submission, percent)),
            _ => None,
        })
    }

    fn emit(&self, event: TaskEvent) {
        // No receivers is fine; the state store is the source of truth.
        let _ = self.events.send(event);
    }

    pub async fn submit(
        &self,
        upload: UploadFile,
        patient: PatientInfo,
    ) -> Result<PredictionRecord, ClientError> {
        if let Err(err) = upload.validate(self.max_upload_bytes) {
            warn!(file = %upload.file_name, "predict: rejected upload: {err}");
            self.state.update(|state| state.error = Some(err.to_string()));
            return Err(err);
        }
        let token = match self.session.bearer_token() {
            Ok(token) => token,
            Err(err) => {
                warn!(file = %upload.file_name, "predict: rejected, no active session");
                self.state.update(|state| state.error = Some(err.to_string()));
                return Err(err);
            }
        };

        let submission = SubmissionId(self.next_submission.fetch_add(1, Ordering::Relaxed));
        info!(
            %submission,
            file = %upload.file_name,
            size_bytes = upload.size_bytes(),
            mime = %upload.mime_type,
            "predict: submission started"
        );
        self.state.update(|state| {
            state.active_submission = Some(submission);
            state.phase = SubmissionPhase::Uploading;
            state.upload_progress = 0;
            state.is_loading = true;
            state.error = None;
        });
        self.emit(TaskEvent::SubmissionStarted {
            submission,
            file_name: upload.file_name.clone(),
        });
        self.emit(TaskEvent::UploadProgress {
            submission,
            percent: 0,
        });

        let tracker = ProgressTracker::new(submission, self.state.clone(), self.events.clone());
        let sink = {
            let tracker = tracker.clone();
            ProgressSink::new(move |percent| tracker.advance(percent))
        };

        match self.api.predict(&token, &upload, &patient, sink).await {
            Ok(record) => {
                tracker.advance(100);
                info!(
                    %submission,
                    id = %record.id,
                    class = record.prediction_class.as_str(),
                    confidence = record.confidence_score,
                    inference_time_ms = ?record.inference_time_ms,
                    "predict: result received"
                );
                self.state.update(|state| {
                    if state.active_submission == Some(submission) {
                        state.phase = SubmissionPhase::Completed;
                        state.is_loading = false;
                        state.error = None;
                    }
                    state.current = Some(record.clone());
                });
                self.emit(TaskEvent::Completed {
                    submission,
                    id: record.id,
                });
                Ok(record)
            }
            Err(err) => {
                error!(%submission, file = %upload.file_name, "predict: submission failed: {err}");
                let message = err.to_string();
                self.state.update(|state| {
                    if state.active_submission == Some(submission) {
                        state.phase = SubmissionPhase::Failed;
                        state.upload_progress = 0;
                        state.is_loading = false;
                        state.error = Some(message.clone());
                    }
                });
                self.emit(TaskEvent::Failed {
                    submission,
                    message,
                });
                Err(err)
            }
        }
    }

    /// Forgets the displayed result and any submission status. History is
    /// kept.
    pub fn clear(&self) {
        self.state.update(|state| {
            state.current = None;
            state.error = None;
            state.upload_progress = 0;
            state.phase = SubmissionPhase::Idle;
            state.is_loading = false;
            state.active_submission = None;
        });
        self.emit(TaskEvent::Cleared);
    }

    pub async fn fetch_one(&self, id: PredictionId) -> Option<PredictionRecord> {
        let token = self.token_for("fetch")?;
        match self.api.get_prediction(&token, id).await {
            Ok(record) => {
                self.state.update_if(|state| refresh_cached(state, &record));
                Some(record)
            }
            Err(err) => {
                warn!(%id, "predict: failed to fetch prediction: {err}");
                None
            }
        }
    }

    /// First page of the signed-in user's history. Empty on any failure.
    pub async fn list_mine(&self, include_images: bool) -> Vec<PredictionSummary> {
        self.list_page(ListPredictionsQuery::first_page(include_images))
            .await
            .map(|page| page.data)
            .unwrap_or_default()
    }

    /// Loads one history page and makes it the cached history. `None` on
    /// any failure, leaving the cache as it was.
    pub async fn list_page(&self, query: ListPredictionsQuery) -> Option<PredictionPage> {
        let token = self.token_for("history")?;

        self.state.update(|state| state.history_loading = true);
        match self.api.list_predictions(&token, query).await {
            Ok(page) => {
                info!(
                    count = page.data.len(),
                    total = page.total,
                    skip = query.skip,
                    limit = query.limit,
                    "predict: history loaded"
                );
                let rows = page.data.clone();
                let total = page.total;
                self.state.update(|state| {
                    state.history = rows;
                    state.history_total = Some(total);
                    state.history_loading = false;
                });
                Some(page)
            }
            Err(err) => {
                warn!("predict: failed to load history: {err}");
                self.state.update(|state| state.history_loading = false);
                None
            }
        }
    }

    pub async fn delete(&self, id: PredictionId) -> bool {
        let Some(token) = self.token_for("delete") else {
            return false;
        };

        if let Err(err) = self.api.delete_prediction(&token, id).await {
            warn!(%id, "predict: failed to delete prediction: {err}");
            return false;
        }

        info!(%id, "predict: prediction deleted");
        self.state.update(|state| {
            if state.current.as_ref().is_some_and(|current| current.id == id) {
                state.current = None;
            }
            let before = state.history.len();
            state.history.retain(|row| row.id != id);
            if state.history.len() < before {
                if let Some(total) = state.history_total.as_mut() {
                    *total = total.saturating_sub(1);
                }
            }
        });
        self.emit(TaskEvent::Deleted { id });
        true
    }

    /// Asks the server to queue the record for review. Cached copies keep
    /// their old flag until the record is fetched again.
    pub async fn flag(&self, id: PredictionId) -> bool {
        let Some(token) = self.token_for("flag") else {
            return false;
        };

        match self.api.flag_prediction(&token, id).await {
            Ok(()) => {
                info!(%id, "predict: prediction flagged for review");
                true
            }
            Err(err) => {
                warn!(%id, "predict: failed to flag prediction: {err}");
                false
            }
        }
    }

    fn token_for(&self, operation: &'static str) -> Option<String> {
        match self.session.bearer_token() {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(operation, "predict: skipped: {err}");
                None
            }
        }
    }
}

fn refresh_cached(state: &mut TaskState, record: &PredictionRecord) -> bool {
    let mut changed = false;
    if let Some(current) = state.current.as_mut().filter(|c| c.id == record.id) {
        if current != record {
            *current = record.clone();
            changed = true;
        }
    }
    let summary = PredictionSummary::from(record);
    for cached in state.history.iter_mut().filter(|c| c.id == record.id) {
        if *cached != summary {
            *cached = summary.clone();
            changed = true;
        }
    }
    changed
}

/// Folds transport progress for one submission into a non-decreasing
/// sequence. Only the active submission drives `upload_progress`.
#[derive(Clone)]
struct ProgressTracker {
    submission: SubmissionId,
    last: Arc<AtomicU8>,
    state: Store<TaskState>,
    events: broadcast::Sender<TaskEvent>,
}

impl ProgressTracker {
    fn new(
        submission: SubmissionId,
        state: Store<TaskState>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            submission,
            last: Arc::new(AtomicU8::new(0)),
            state,
            events,
        }
    }

    fn advance(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::AcqRel);
        if percent <= previous {
            return;
        }

        let submission = self.submission;
        self.state.update_if(|state| {
            if state.active_submission != Some(submission) {
                return false;
            }
            state.upload_progress = percent;
            if percent == 100 {
                state.phase = SubmissionPhase::AwaitingResult;
            }
            true
        });
        let _ = self.events.send(TaskEvent::UploadProgress {
            submission,
            percent,
        });
    }
}

#[cfg(test)]
#[path = "tests/tasks_tests.rs"]
mod tests;
