//! Client core for the Neumo imaging front-end: the session and prediction
//! task controllers, the HTTP protocol client they drive, and the settings
//! that wire them together.

use std::sync::Arc;

use anyhow::Result;
use storage::PersistenceAdapter;
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod tasks;
pub mod upload;

pub use api::{ApiClient, AuthApi, PredictionApi};
pub use config::{load_settings, ClientSettings};
pub use error::ClientError;
pub use session::{Credentials, SessionController, SessionPhase, SessionState};
pub use store::Store;
pub use tasks::{SubmissionId, SubmissionPhase, TaskController, TaskEvent, TaskState};
pub use upload::{ProgressSink, UploadFile};

/// Both controllers sharing one HTTP client and one session.
pub struct NeumoClient {
    pub session: Arc<SessionController>,
    pub tasks: Arc<TaskController>,
}

impl NeumoClient {
    /// Opens persistent storage and hydrates the session. When the storage
    /// backend cannot be opened the session still works but does not survive
    /// a restart.
    pub async fn connect(settings: &ClientSettings) -> Result<Self> {
        let storage = match PersistenceAdapter::open_sqlite(
            &settings.storage_url,
            settings.storage_scope.clone(),
        )
        .await
        {
            Ok(storage) => storage,
            Err(err) => {
                warn!(
                    storage_url = %settings.storage_url,
                    "client: persistent storage unavailable, using memory: {err:#}"
                );
                PersistenceAdapter::in_memory(settings.storage_scope.clone())
            }
        };
        Self::with_storage(settings, storage).await
    }

    pub async fn with_storage(settings: &ClientSettings, storage: PersistenceAdapter) -> Result<Self> {
        let api = Arc::new(ApiClient::new(settings)?);
        info!(api = %api.base_url(), scope = storage.scope(), "client: starting");
        Ok(Self::from_parts(api.clone(), api, storage, settings.max_upload_bytes).await)
    }

    /// Assembles the controllers over arbitrary API implementations.
    pub async fn from_parts(
        auth: Arc<dyn AuthApi>,
        predictions: Arc<dyn PredictionApi>,
        storage: PersistenceAdapter,
        max_upload_bytes: u64,
    ) -> Self {
        let session = SessionController::open(auth, storage).await;
        let tasks = Arc::new(TaskController::new(
            predictions,
            Arc::clone(&session),
            max_upload_bytes,
        ));
        Self { session, tasks }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
