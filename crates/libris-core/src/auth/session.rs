//! Session manager: login, logout and the refresh-and-retry protocol.
//!
//! The manager installs itself on an [`ApiClient`] as both a pre-send hook
//! (attach the bearer credential) and a post-receive hook (turn a 401 into
//! one refresh call shared by every request that failed at the same time,
//! then replay each of those requests once).

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{Credential, CredentialStore};
use crate::api::{
    ApiClient, ApiError, ApiRequest, ApiResponse, ApiResult, RequestHook, ResponseHook,
};
use crate::models::{ErrorBody, LoginRequest, RefreshRequest, TokenResponse};

/// Message shown when the server rejects a login without saying why
const DEFAULT_LOGIN_ERROR: &str = "Invalid username or password";

// ============================================================================
// Configuration
// ============================================================================

/// Paths of the auth endpoints. These three are never refreshed-and-retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login: String,
    pub refresh: String,
    pub logout: String,
    pub login_fields: LoginFields,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/accounts/token/".to_string(),
            refresh: "/accounts/token/refresh/".to_string(),
            logout: "/accounts/signout/".to_string(),
            login_fields: LoginFields::default(),
        }
    }
}

impl AuthEndpoints {
    pub fn is_exempt(&self, request: &ApiRequest) -> bool {
        [&self.login, &self.refresh, &self.logout]
            .iter()
            .any(|endpoint| request.targets(endpoint))
    }
}

/// JSON field names the login endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginFields {
    pub identifier: String,
    pub secret: String,
}

impl Default for LoginFields {
    fn default() -> Self {
        Self {
            identifier: "username".to_string(),
            secret: "password".to_string(),
        }
    }
}

impl LoginFields {
    fn body(&self, request: &LoginRequest) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert(self.identifier.clone(), request.identifier.clone().into());
        body.insert(self.secret.clone(), request.secret.clone().into());
        serde_json::Value::Object(body)
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
}

/// Notified when the session ends without the user asking for it.
pub trait NavigationGuard: Send + Sync {
    fn on_session_expired(&self);
}

/// What every waiter of a refresh learns: go ahead and retry, or give up.
type RefreshOutcome = Result<(), ApiError>;

enum RefreshState {
    Idle,
    Refreshing {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

struct Inner {
    refresh: RefreshState,
    /// Bumped by login, logout and expiry. A refresh that settles under a
    /// different generation belongs to a session that no longer exists.
    generation: u64,
    login_error: Option<String>,
}

pub struct SessionManager {
    client: ApiClient,
    store: Arc<CredentialStore>,
    endpoints: AuthEndpoints,
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
    guard: Option<Arc<dyn NavigationGuard>>,
}

impl SessionManager {
    /// `client` is used for the auth endpoints only; any hooks on it are
    /// dropped.
    pub fn new(client: &ApiClient, store: Arc<CredentialStore>, endpoints: AuthEndpoints) -> Self {
        let initial = if store.is_present() {
            SessionState::LoggedIn
        } else {
            SessionState::LoggedOut
        };
        let (state, _) = watch::channel(initial);

        Self {
            client: client.bare(),
            store,
            endpoints,
            inner: Mutex::new(Inner {
                refresh: RefreshState::Idle,
                generation: 0,
                login_error: None,
            }),
            state,
            guard: None,
        }
    }

    pub fn with_navigation_guard(mut self, guard: Arc<dyn NavigationGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// A client that carries the session credential and recovers from expiry.
    pub fn authorized_client(self: &Arc<Self>) -> ApiClient {
        self.client
            .clone()
            .with_request_hook(self.clone())
            .with_response_hook(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ===== Accessors =====

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == SessionState::LoggedIn
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.store.get()
    }

    /// Last login failure, for display
    pub fn login_error(&self) -> Option<String> {
        self.lock().login_error.clone()
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Pick up a credential left in durable storage by a previous run.
    pub fn restore(&self) -> bool {
        if !self.store.restore() {
            return false;
        }
        self.lock().generation += 1;
        self.state.send_replace(SessionState::LoggedIn);
        info!("Restored saved session");
        true
    }

    // ===== Login / Logout =====

    pub async fn login(&self, request: &LoginRequest) -> ApiResult<()> {
        match self.exchange_credentials(request).await {
            Ok(credential) => {
                {
                    let mut inner = self.lock();
                    inner.generation += 1;
                    inner.login_error = None;
                    self.store.set(credential);
                }
                self.state.send_replace(SessionState::LoggedIn);
                info!(user = %request.identifier, "Logged in");
                Ok(())
            }
            Err(e) => {
                warn!(user = %request.identifier, error = %e, "Login failed");
                self.lock().login_error = Some(match e {
                    ApiError::LoginRejected(ref message) => message.clone(),
                    ref other => other.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn exchange_credentials(&self, request: &LoginRequest) -> ApiResult<Credential> {
        let body = self.endpoints.login_fields.body(request);
        let response = self
            .client
            .execute(ApiRequest::post(&self.endpoints.login).json(&body)?)
            .await?;

        if response.status.is_client_error() {
            let detail = response
                .json::<ErrorBody>()
                .ok()
                .and_then(|body| body.detail)
                .filter(|detail| !detail.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOGIN_ERROR.to_string());
            return Err(ApiError::LoginRejected(detail));
        }

        let tokens: TokenResponse = response.error_for_status()?.json()?;
        let credential = Credential::new(tokens.access, tokens.refresh);
        if credential.is_empty() {
            return Err(ApiError::LoginRejected(DEFAULT_LOGIN_ERROR.to_string()));
        }
        Ok(credential)
    }

    /// Clear the local session, then tell the server (best effort).
    ///
    /// Local state is gone before the first await, so dropping or timing out
    /// this future never leaves a stale credential behind.
    pub async fn logout(&self) {
        let previous = self.end_session(false);
        info!("Logged out");

        let mut request = ApiRequest::post(&self.endpoints.logout);
        if let Some(ref credential) = previous {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", credential.access)) {
                request = request.header(header::AUTHORIZATION, value);
            }
            if let Some(ref refresh) = credential.refresh {
                match request.clone().json(&RefreshRequest { refresh }) {
                    Ok(with_body) => request = with_body,
                    Err(e) => debug!(error = %e, "Sending logout without refresh token"),
                }
            }
        }

        match self.client.execute(request).await {
            Ok(response) if response.is_success() => debug!("Server session invalidated"),
            Ok(response) => debug!(status = response.status.as_u16(), "Server logout rejected"),
            Err(e) => debug!(error = %e, "Server logout failed"),
        }
    }

    /// Drop credential and state. Returns the credential that was held.
    fn end_session(&self, expired: bool) -> Option<Credential> {
        let previous = {
            let mut inner = self.lock();
            inner.generation += 1;
            self.store.clear()
        };
        let was = self.state.send_replace(SessionState::LoggedOut);

        if expired && was == SessionState::LoggedIn {
            warn!("Session expired");
            if let Some(ref guard) = self.guard {
                guard.on_session_expired();
            }
        }
        previous
    }

    // ===== Hooks =====

    /// Pre-send: add `Authorization: Bearer <access>` when a credential is held.
    pub fn attach_credential(&self, request: &mut ApiRequest) {
        let Some(token) = self.store.access_token() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => {
                request.headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => warn!("Credential is not a valid header value, sending request without it"),
        }
    }

    /// Post-receive: recover from a 401 by refreshing once and replaying.
    pub async fn handle_response(
        &self,
        client: &ApiClient,
        mut request: ApiRequest,
        outcome: ApiResult<ApiResponse>,
    ) -> ApiResult<ApiResponse> {
        let response = match outcome {
            Ok(response) if response.is_unauthorized() => response,
            other => return other,
        };

        if self.endpoints.is_exempt(&request) {
            debug!(path = %request.path, "401 from auth endpoint, passing through");
            return Ok(response);
        }

        if request.retry_attempted {
            warn!(path = %request.path, "Request rejected again after refresh");
            self.end_session(true);
            return Err(ApiError::SessionExpired);
        }

        // No session to recover: the 401 is the answer.
        let current = self.store.access_token();
        if current.is_none() || !self.is_logged_in() {
            debug!(path = %request.path, "401 while logged out, passing through");
            return Ok(response);
        }
        request.retry_attempted = true;

        if current.as_deref() != request.bearer_token() {
            debug!(path = %request.path, "Credential changed while request was in flight, retrying");
            return client.execute(request).await;
        }

        self.refresh_once().await?;
        debug!(path = %request.path, "Retrying with refreshed credential");
        client.execute(request).await
    }

    // ===== Refresh protocol =====

    /// Join the in-flight refresh, or lead a new one.
    async fn refresh_once(&self) -> RefreshOutcome {
        let waiter = {
            let mut inner = self.lock();
            match &mut inner.refresh {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                state @ RefreshState::Idle => {
                    *state = RefreshState::Refreshing {
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            debug!("Refresh already in flight, waiting for it");
            return rx.await.unwrap_or(Err(ApiError::SessionExpired));
        }

        let mut lease = RefreshLease {
            manager: self,
            armed: true,
        };
        let generation = self.lock().generation;
        let result = self.call_refresh().await;
        lease.armed = false;

        self.settle_refresh(generation, result)
    }

    async fn call_refresh(&self) -> ApiResult<Credential> {
        let previous = self.store.get();
        let mut request = ApiRequest::post(&self.endpoints.refresh);
        if let Some(refresh) = previous.as_ref().and_then(|c| c.refresh.as_deref()) {
            request = request.json(&RefreshRequest { refresh })?;
        }

        debug!("Refreshing credential");
        let tokens: TokenResponse = self.client.send_json(request).await?;
        let credential = match previous {
            Some(ref old) => old.rotate(tokens.access, tokens.refresh),
            None => Credential::new(tokens.access, tokens.refresh),
        };
        if credential.is_empty() {
            return Err(ApiError::InvalidResponse(
                "Refresh response carried no access token".to_string(),
            ));
        }
        Ok(credential)
    }

    /// Store the result, go back to `Idle` and wake every waiter in order.
    fn settle_refresh(&self, generation: u64, result: ApiResult<Credential>) -> RefreshOutcome {
        let (waiters, outcome, expire) = {
            let mut inner = self.lock();
            let waiters = match std::mem::replace(&mut inner.refresh, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => Vec::new(),
            };
            let current = inner.generation == generation;

            match result {
                Ok(credential) if current => {
                    self.store.set(credential);
                    info!(waiters = waiters.len(), "Credential refreshed");
                    (waiters, Ok(()), false)
                }
                Ok(_) => {
                    debug!("Session changed during refresh, discarding new credential");
                    (waiters, Err(ApiError::SessionExpired), false)
                }
                Err(e) => {
                    warn!(error = %e, waiters = waiters.len(), "Credential refresh failed");
                    (waiters, Err(ApiError::SessionExpired), current)
                }
            }
        };

        if expire {
            self.end_session(true);
        }
        for waiter in waiters {
            // A waiter whose request was dropped has nobody to tell.
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    fn abandon_refresh(&self) {
        let waiters = {
            let mut inner = self.lock();
            match std::mem::replace(&mut inner.refresh, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };
        warn!(waiters = waiters.len(), "Credential refresh abandoned");
        for waiter in waiters {
            let _ = waiter.send(Err(ApiError::Network(
                "Credential refresh was cancelled".to_string(),
            )));
        }
    }
}

/// Resolves the waiters if the leading request is dropped mid-refresh.
struct RefreshLease<'a> {
    manager: &'a SessionManager,
    armed: bool,
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon_refresh();
        }
    }
}

impl RequestHook for SessionManager {
    fn before_send(&self, request: &mut ApiRequest) {
        self.attach_credential(request);
    }
}

impl ResponseHook for SessionManager {
    fn after_receive<'a>(
        &'a self,
        client: &'a ApiClient,
        request: ApiRequest,
        outcome: ApiResult<ApiResponse>,
    ) -> BoxFuture<'a, ApiResult<ApiResponse>> {
        self.handle_response(client, request, outcome).boxed()
    }
}
