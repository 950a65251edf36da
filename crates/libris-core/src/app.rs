//! Application wiring.
//!
//! `App` owns the one session manager, the authorized client built from it
//! and the favorites reconciler that talks through that client.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::api::{ApiClient, HttpTransport, Transport};
use crate::auth::{CredentialStore, NavigationGuard, SessionManager};
use crate::config::Config;
use crate::favorites::ToggleReconciler;

pub struct App {
    pub config: Config,
    pub session: Arc<SessionManager>,
    /// Carries the session credential and recovers from expiry
    pub client: ApiClient,
    pub favorites: ToggleReconciler,
}

impl App {
    pub fn new(config: Config, guard: Option<Arc<dyn NavigationGuard>>) -> Result<Self> {
        let transport = HttpTransport::new(config.base_url.clone(), config.request_timeout())?;
        Self::with_transport(config, Arc::new(transport), guard)
    }

    /// Build on a custom transport. A credential left in the configured
    /// durable storage is restored.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        guard: Option<Arc<dyn NavigationGuard>>,
    ) -> Result<Self> {
        let store = match config.credential_mirror()? {
            Some(mirror) => CredentialStore::with_mirror(mirror),
            None => CredentialStore::new(),
        };

        let mut session = SessionManager::new(
            &ApiClient::new(transport),
            Arc::new(store),
            config.auth.clone(),
        );
        if let Some(guard) = guard {
            session = session.with_navigation_guard(guard);
        }
        let session = Arc::new(session);
        if !session.restore() {
            debug!("No saved session");
        }

        let client = session.authorized_client();
        let favorites = ToggleReconciler::new(client.clone(), config.favorites.clone())
            .with_owner(session.clone());

        Ok(Self {
            config,
            session,
            client,
            favorites,
        })
    }
}
