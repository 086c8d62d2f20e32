//! Client configuration from environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Timeout applied to every API request
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Delay between passenger location polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(5_000);

pub const DEFAULT_API_URL: &str = "http://localhost:5000";

const APP_DIR: &str = "RouteMaster";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub storage_dir: PathBuf,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: env::var("ROUTE_MASTER_API_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            storage_dir: env::var("ROUTE_MASTER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory()),
        }
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> PathBuf {
        self.storage_dir.join("logs")
    }
}

/// Per-user application data directory
pub fn data_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
