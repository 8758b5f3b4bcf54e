//! Authentication lifecycle: hydration from storage, login, registration and
//! logout.
//!
//! The token and profile only ever exist together as [`Credentials`], and are
//! persisted together through [`PersistenceAdapter::set_all`].

use std::{future::Future, sync::Arc};

use serde_json::{Map, Value};
use shared::{
    domain::UserProfile,
    protocol::{AuthResponse, LoginRequest, RegisterRequest},
};
use storage::PersistenceAdapter;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{api::AuthApi, error::ClientError, store::Store};

pub const TOKEN_KEY: &str = "auth_token";
pub const USER_KEY: &str = "auth_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Hydrating,
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub credentials: Option<Credentials>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            credentials: None,
            is_loading: false,
            error: None,
        }
    }
}

impl SessionState {
    /// True once hydration has finished, whatever it found.
    pub fn initialized(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Anonymous | SessionPhase::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated && self.credentials.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.token.as_str())
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.credentials.as_ref().map(|c| &c.user)
    }
}

#[derive(Debug, Clone, Copy)]
enum AuthOperation {
    Login,
    Register,
}

impl AuthOperation {
    fn label(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "registration",
        }
    }
}

pub struct SessionController {
    auth: Arc<dyn AuthApi>,
    storage: PersistenceAdapter,
    state: Store<SessionState>,
}

impl SessionController {
    /// Creates an uninitialized controller. Call [`Self::hydrate`] before
    /// relying on [`SessionState::is_authenticated`], or use [`Self::open`].
    pub fn new(auth: Arc<dyn AuthApi>, storage: PersistenceAdapter) -> Self {
        Self {
            auth,
            storage,
            state: Store::new(SessionState::default()),
        }
    }

    pub async fn open(auth: Arc<dyn AuthApi>, storage: PersistenceAdapter) -> Arc<Self> {
        let controller = Arc::new(Self::new(auth, storage));
        controller.hydrate().await;
        controller
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read(SessionState::is_authenticated)
    }

    /// Token for an authorized request. Fails until hydration has completed
    /// and while nobody is signed in.
    pub fn bearer_token(&self) -> Result<String, ClientError> {
        self.state.read(|state| {
            if state.is_authenticated() {
                state
                    .token()
                    .map(str::to_string)
                    .ok_or(ClientError::AuthorizationMissing)
            } else {
                Err(ClientError::AuthorizationMissing)
            }
        })
    }

    pub fn clear_error(&self) {
        self.state.update_if(|state| state.error.take().is_some());
    }

    /// Restores the session from storage. Runs at most once per controller;
    /// later calls return without touching state.
    pub async fn hydrate(&self) {
        let claimed = self.state.update_if(|state| {
            if state.phase != SessionPhase::Uninitialized {
                return false;
            }
            state.phase = SessionPhase::Hydrating;
            true
        });
        if !claimed {
            debug!("auth: hydrate skipped; session already initialized");
            return;
        }

        info!(scope = self.storage.scope(), "auth: initializing session from storage");
        let credentials = self.read_persisted().await;

        match &credentials {
            Some(credentials) => info!(
                user = %credentials.user.email,
                "auth: session restored from storage"
            ),
            None => info!("auth: no stored session found"),
        }

        self.state.update(|state| {
            state.phase = if credentials.is_some() {
                SessionPhase::Authenticated
            } else {
                SessionPhase::Anonymous
            };
            state.credentials = credentials;
        });
    }

    async fn read_persisted(&self) -> Option<Credentials> {
        let token = self
            .storage
            .get(TOKEN_KEY)
            .await
            .filter(|token| !token.is_empty());
        let user = match self.storage.get(USER_KEY).await {
            Some(raw) => match serde_json::from_str::<UserProfile>(&raw) {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!("auth: stored user profile is unreadable: {err}");
                    None
                }
            },
            None => None,
        };

        match (token, user) {
            (Some(token), Some(user)) => Some(Credentials { token, user }),
            (None, None) => None,
            (token, user) => {
                warn!(
                    has_token = token.is_some(),
                    has_user = user.is_some(),
                    "auth: discarding partial stored session"
                );
                self.storage.remove_all(&[TOKEN_KEY, USER_KEY]).await;
                None
            }
        }
    }

    /// Waits until hydration has completed, starting it if nobody has.
    async fn ensure_initialized(&self) {
        self.hydrate().await;
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(SessionState::initialized).await;
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, ClientError> {
        let mut submitted = Map::new();
        submitted.insert("email".into(), Value::String(email.to_string()));
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };

        self.authenticate(
            AuthOperation::Login,
            email,
            submitted,
            self.auth.login(&request),
        )
        .await
    }

    /// Creates the account and signs straight into it.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        username: &str,
        full_name: &str,
    ) -> Result<UserProfile, ClientError> {
        let mut submitted = Map::new();
        submitted.insert("email".into(), Value::String(email.to_string()));
        submitted.insert("username".into(), Value::String(username.to_string()));
        submitted.insert("full_name".into(), Value::String(full_name.to_string()));

        let request = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            username: username.to_string(),
            full_name: full_name.to_string(),
        };

        self.authenticate(
            AuthOperation::Register,
            email,
            submitted,
            self.auth.register(&request),
        )
        .await
    }

    /// Drives one login or registration attempt. `request` is not polled
    /// until hydration has settled.
    async fn authenticate(
        &self,
        operation: AuthOperation,
        email: &str,
        submitted: Map<String, Value>,
        request: impl Future<Output = Result<AuthResponse, ClientError>>,
    ) -> Result<UserProfile, ClientError> {
        self.ensure_initialized().await;
        info!(email, "auth: {} attempt started", operation.label());
        self.state.update(|state| {
            state.is_loading = true;
            state.error = None;
        });

        let outcome = match request.await {
            Ok(response) => credentials_from_response(response, submitted),
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(credentials) => self.establish(credentials).await,
            Err(err) => {
                error!(email, "auth: {} failed: {err}", operation.label());
                self.reset_after_failure(&err).await;
                Err(err)
            }
        };

        info!(email, "auth: {} attempt completed", operation.label());
        result
    }

    async fn establish(&self, credentials: Credentials) -> Result<UserProfile, ClientError> {
        let user_json = serde_json::to_string(&credentials.user).map_err(|err| {
            ClientError::MalformedResponse(format!("user profile cannot be stored: {err}"))
        })?;

        let persisted = self
            .storage
            .set_all(&[(TOKEN_KEY, credentials.token.as_str()), (USER_KEY, user_json.as_str())])
            .await;
        if !persisted {
            warn!("auth: session not persisted; it will not survive a restart");
        }

        info!(
            user = %credentials.user.email,
            token_len = credentials.token.len(),
            "auth: signed in"
        );
        let user = credentials.user.clone();
        self.state.update(|state| {
            state.phase = SessionPhase::Authenticated;
            state.credentials = Some(credentials);
            state.is_loading = false;
            state.error = None;
        });
        Ok(user)
    }

    async fn reset_after_failure(&self, err: &ClientError) {
        let had_session = self.state.read(|state| state.credentials.is_some());
        if had_session {
            self.storage.remove_all(&[TOKEN_KEY, USER_KEY]).await;
        }
        let message = err.to_string();
        self.state.update(|state| {
            state.phase = SessionPhase::Anonymous;
            state.credentials = None;
            state.is_loading = false;
            state.error = Some(message);
        });
    }

    /// Ends the session locally. Never fails and issues no request.
    pub async fn logout(&self) {
        let user = self
            .state
            .read(|state| state.user().map(|user| user.email.clone()));
        info!(user = user.as_deref().unwrap_or("unknown"), "auth: logout initiated");

        self.state.update(|state| {
            state.phase = SessionPhase::Anonymous;
            state.credentials = None;
            state.is_loading = false;
            state.error = None;
        });
        if !self.storage.remove_all(&[TOKEN_KEY, USER_KEY]).await {
            warn!("auth: stored session could not be fully removed");
        }
        info!("auth: logout completed");
    }
}

fn credentials_from_response(
    response: AuthResponse,
    submitted: Map<String, Value>,
) -> Result<Credentials, ClientError> {
    let token = response
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ClientError::MalformedResponse("No access token received from server".to_string())
        })?;
    let user = UserProfile::from_parts(submitted, response.user.as_ref())
        .map_err(|err| ClientError::MalformedResponse(err.to_string()))?;
    Ok(Credentials { token, user })
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
