//! Authentication: credentials, their storage and the session protocol.
//!
//! This module provides:
//! - `Credential`: the bearer token plus expiry metadata
//! - `CredentialStore`: the single current credential, optionally mirrored
//!   to a file or the OS keychain
//! - `SessionManager`: login/logout and single-flight refresh-and-retry

pub mod credential;
pub mod session;
pub mod store;

pub use credential::{Credential, TokenClaims};
pub use session::{AuthEndpoints, LoginFields, NavigationGuard, SessionManager, SessionState};
pub use store::{CredentialMirror, CredentialStore, FileMirror, KeyringMirror, CREDENTIAL_KEY};
