#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use libris_core::api::{ApiClient, ApiRequest, ApiResponse, ApiResult, Transport};
use libris_core::auth::{AuthEndpoints, Credential, CredentialStore, NavigationGuard, SessionManager};
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::Semaphore;

/// In-process backend. Protected paths accept exactly one bearer token; the
/// refresh endpoint can be held shut so callers pile up behind it.
pub struct FakeBackend {
    accepted: Mutex<String>,
    issue: Option<String>,
    rotate: bool,
    gate: Semaphore,
    requests: Mutex<Vec<ApiRequest>>,
    rejected: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FakeBackend {
    /// Accepts `token`; refresh answers 401.
    pub fn accepting(token: &str) -> Self {
        Self {
            accepted: Mutex::new(token.to_string()),
            issue: None,
            rotate: false,
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            requests: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Refresh hands out `token`, which protected paths accept from then on.
    pub fn issuing(mut self, token: &str) -> Self {
        self.issue = Some(token.to_string());
        self.rotate = true;
        self
    }

    /// Refresh hands out `token`, but protected paths keep rejecting it.
    pub fn issuing_useless(mut self, token: &str) -> Self {
        self.issue = Some(token.to_string());
        self.rotate = false;
        self
    }

    /// Refresh does not answer until [`FakeBackend::release`].
    pub fn held(mut self) -> Self {
        self.gate = Semaphore::new(0);
        self
    }

    pub fn release(&self) {
        self.gate.add_permits(1024);
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Protected requests that reached the backend with `token`.
    pub fn sent_with(&self, token: &str) -> usize {
        let endpoints = AuthEndpoints::default();
        self.requests()
            .iter()
            .filter(|r| !endpoints.is_exempt(r) && r.bearer_token() == Some(token))
            .count()
    }

    async fn refresh(&self) -> ApiResponse {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await;

        match self.issue {
            Some(ref token) => {
                if self.rotate {
                    *self.accepted.lock().unwrap() = token.clone();
                }
                ApiResponse::new(StatusCode::OK, json!({ "access": token }).to_string())
            }
            None => ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                json!({ "detail": "Token is invalid or expired" }).to_string(),
            ),
        }
    }
}

impl Transport for FakeBackend {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, ApiResult<ApiResponse>> {
        async move {
            self.requests.lock().unwrap().push(request.clone());
            let endpoints = AuthEndpoints::default();

            if request.targets(&endpoints.refresh) {
                return Ok(self.refresh().await);
            }
            if request.targets(&endpoints.logout) {
                return Ok(ApiResponse::new(StatusCode::OK, "{}"));
            }

            let accepted = self.accepted.lock().unwrap().clone();
            if request.bearer_token() == Some(accepted.as_str()) {
                Ok(ApiResponse::new(
                    StatusCode::OK,
                    json!({ "path": request.path }).to_string(),
                ))
            } else {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                Ok(ApiResponse::new(
                    StatusCode::UNAUTHORIZED,
                    json!({ "detail": "Given token not valid" }).to_string(),
                ))
            }
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct CountingGuard {
    fired: AtomicUsize,
}

impl CountingGuard {
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl NavigationGuard for CountingGuard {
    fn on_session_expired(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub store: Arc<CredentialStore>,
    pub session: Arc<SessionManager>,
    pub client: ApiClient,
    pub guard: Arc<CountingGuard>,
}

/// Session over `transport`, optionally already holding `access`/`R1`.
pub fn session_over(
    transport: Arc<dyn Transport>,
    access: Option<&str>,
) -> (Arc<CredentialStore>, Arc<SessionManager>, Arc<CountingGuard>) {
    let store = Arc::new(CredentialStore::new());
    if let Some(access) = access {
        store.set(Credential::new(access, Some("R1".to_string())));
    }
    let guard = Arc::new(CountingGuard::default());
    let session = Arc::new(
        SessionManager::new(
            &ApiClient::new(transport),
            store.clone(),
            AuthEndpoints::default(),
        )
        .with_navigation_guard(guard.clone()),
    );
    (store, session, guard)
}

pub fn harness(backend: FakeBackend, access: Option<&str>) -> Harness {
    let backend = Arc::new(backend);
    let (store, session, guard) = session_over(backend.clone(), access);
    let client = session.authorized_client();
    Harness {
        backend,
        store,
        session,
        client,
        guard,
    }
}

/// Yield until `done` holds. Only meaningful on a single-threaded runtime
/// where the futures being waited on are polled by the same task.
pub async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}
