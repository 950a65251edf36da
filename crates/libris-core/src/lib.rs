//! Client-side session and API access for the library backend.
//!
//! - `api`: request pipeline (pre-send hooks, transport, post-receive hooks)
//! - `auth`: credential storage, login/logout, single-flight refresh-and-retry
//! - `favorites`: optimistic favorites toggling reconciled with the server
//! - `config`: on-disk configuration with environment overrides

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod favorites;
pub mod models;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, ApiResult};
pub use app::App;
pub use auth::{Credential, CredentialStore, NavigationGuard, SessionManager, SessionState};
pub use config::Config;
pub use favorites::ToggleReconciler;
pub use models::{ItemId, LoginRequest, MembershipEntry};
