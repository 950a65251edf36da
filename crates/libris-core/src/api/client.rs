//! HTTP client core for the library backend.
//!
//! Every call is described by an [`ApiRequest`] and goes through the same
//! pipeline: pre-send hooks, the [`Transport`], then post-receive hooks.
//! The session manager plugs into both ends of that pipeline.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::ApiError;

pub type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request / Response
// ============================================================================

/// A captured outbound request. Cheap to clone so it can be replayed after a
/// credential refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    /// Set once the request has been through a refresh-and-retry cycle.
    pub retry_attempted: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retry_attempted: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> ApiResult<Self> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::Encode(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Bearer token currently carried in the `Authorization` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }

    /// Whether this request targets `endpoint`, ignoring scheme/host, query
    /// string and leading/trailing slashes.
    pub fn targets(&self, endpoint: &str) -> bool {
        let ours = normalize_path(&self.path);
        !ours.is_empty() && ours == normalize_path(endpoint)
    }
}

fn normalize_path(path: &str) -> &str {
    let without_origin = match path.find("://") {
        Some(idx) => {
            let rest = &path[idx + 3..];
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("")
        }
        None => path,
    };
    let without_query = without_origin.split(['?', '#']).next().unwrap_or("");
    without_query.trim_matches('/')
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Parse the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    /// Turn a non-2xx response into the matching error.
    pub fn error_for_status(self) -> ApiResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Sends a request over the wire. Implementations must not interpret status
/// codes: a 401 is a successful transport outcome.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, ApiResult<ApiResponse>>;
}

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// reqwest-backed transport rooted at a base URL.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, ApiResult<ApiResponse>> {
        async move {
            let url = self.url(&request.path);
            debug!(method = %request.method, url = %url, retry = request.retry_attempted, "Sending request");

            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers.clone());
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await?;

            debug!(url = %url, status = status.as_u16(), "Received response");
            Ok(ApiResponse { status, headers, body })
        }
        .boxed()
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Runs on every request before it reaches the transport. Must not block.
pub trait RequestHook: Send + Sync {
    fn before_send(&self, request: &mut ApiRequest);
}

/// Runs on every outcome. Receives the dispatching client so it can issue
/// follow-up calls (e.g. replaying the request).
pub trait ResponseHook: Send + Sync {
    fn after_receive<'a>(
        &'a self,
        client: &'a ApiClient,
        request: ApiRequest,
        outcome: ApiResult<ApiResponse>,
    ) -> BoxFuture<'a, ApiResult<ApiResponse>>;
}

// ============================================================================
// Client
// ============================================================================

/// Transport plus hook pipeline. Clone is cheap; clones share the transport.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    request_hooks: Vec<Arc<dyn RequestHook>>,
    response_hooks: Vec<Arc<dyn ResponseHook>>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            request_hooks: Vec::new(),
            response_hooks: Vec::new(),
        }
    }

    /// Convenience constructor for the reqwest transport.
    pub fn http(base_url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(base_url, timeout)?)))
    }

    pub fn with_request_hook(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.request_hooks.push(hook);
        self
    }

    pub fn with_response_hook(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.response_hooks.push(hook);
        self
    }

    /// Same transport, no hooks.
    pub fn bare(&self) -> Self {
        Self::new(self.transport.clone())
    }

    /// Run the full pipeline and return the raw outcome. Non-2xx responses
    /// are returned as `Ok`; use [`ApiClient::send`] to map them to errors.
    pub async fn execute(&self, mut request: ApiRequest) -> ApiResult<ApiResponse> {
        for hook in &self.request_hooks {
            hook.before_send(&mut request);
        }

        let mut outcome = self.transport.send(&request).await;

        for hook in &self.response_hooks {
            outcome = hook.after_receive(self, request.clone(), outcome).await;
        }
        outcome
    }

    /// Execute and fail on non-2xx responses.
    pub async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        self.execute(request).await?.error_for_status()
    }

    /// Execute, fail on non-2xx, parse the body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> ApiResult<T> {
        self.send(request).await?.json()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }
}
