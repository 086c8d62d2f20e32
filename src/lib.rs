//! Route Master Client Library
//!
//! Driver session handling and passenger bus tracking for the Route Master
//! API.

pub mod api;
pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod poller;
pub mod storage;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::sync::Arc;

use api::{ApiClient, TransportError};
use auth::Session;
use config::ClientConfig;
use lifecycle::SessionLifecycle;
use poller::LocationPoller;
use storage::{FileTokenStore, StorageError};

/// Application state shared across screens
pub struct AppState {
    pub session: Session,
    pub api: Arc<ApiClient>,
}

impl AppState {
    /// Open the on-disk token store and build the API client
    pub fn open(config: &ClientConfig) -> Result<Self, StartupError> {
        let store = FileTokenStore::open(&config.storage_dir)?;
        let session = Session::new(Arc::new(store));
        let api = ApiClient::new(&config.api_base_url, session.clone())?;

        Ok(Self {
            session,
            api: Arc::new(api),
        })
    }

    /// Driver lifecycle, resumed from any stored token
    pub fn lifecycle(&self) -> Result<SessionLifecycle, StorageError> {
        SessionLifecycle::resume(self.api.clone())
    }

    /// A new, inactive passenger poller
    pub fn poller(&self) -> LocationPoller {
        LocationPoller::new(self.api.clone())
    }
}

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to create HTTP client: {0}")]
    Http(#[from] TransportError),
}
