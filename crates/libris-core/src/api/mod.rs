//! HTTP client core.
//!
//! This module provides the `ApiClient` pipeline (pre-send hooks, transport,
//! post-receive hooks) used for every call to the library backend, and the
//! `ApiError` taxonomy shared by the session and favorites layers.

pub mod client;
pub mod error;

pub use client::{
    ApiClient, ApiRequest, ApiResponse, ApiResult, HttpTransport, RequestHook, ResponseHook,
    Transport, DEFAULT_REQUEST_TIMEOUT_SECS,
};
pub use error::ApiError;
