//! Token Storage Module
//!
//! Durable key/value persistence for the session token and the identity
//! references handed out by the server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Keys persisted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Token,
    DriverId,
    BusId,
}

impl StoreKey {
    pub const ALL: [StoreKey; 3] = [StoreKey::Token, StoreKey::DriverId, StoreKey::BusId];

    /// Name the value is stored under
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::Token => "token",
            StoreKey::DriverId => "driverId",
            StoreKey::BusId => "busId",
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable string storage.
///
/// `get` on a key that was never written returns `Ok(None)`; only a store
/// that cannot be read at all produces an error.
pub trait TokenStore: Send + Sync {
    /// Persist `value` under `key`, replacing any previous value
    fn set(&self, key: StoreKey, value: &str) -> Result<(), StorageError>;

    /// Read the value stored under `key`
    fn get(&self, key: StoreKey) -> Result<Option<String>, StorageError>;

    /// Delete the value stored under `key`, if any
    fn remove(&self, key: StoreKey) -> Result<(), StorageError>;
}

/// File-backed store: one `<key>.dat` file per key
pub struct FileTokenStore {
    storage_path: PathBuf,
}

impl FileTokenStore {
    /// Open (creating if needed) a store rooted at `storage_path`
    pub fn open(storage_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage_path = storage_path.into();

        std::fs::create_dir_all(&storage_path)
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", storage_path.display(), e)))?;

        debug!("Token storage initialized at: {:?}", storage_path);

        Ok(Self { storage_path })
    }

    /// Directory holding the key files
    fn file_for(&self, key: StoreKey) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key.as_str()))
    }
}

impl TokenStore for FileTokenStore {
    fn set(&self, key: StoreKey, value: &str) -> Result<(), StorageError> {
        let file_path = self.file_for(key);
        let tmp_path = self.storage_path.join(format!(".{}.tmp", key.as_str()));

        // Write then rename so a crash mid-write never leaves a truncated token.
        std::fs::write(&tmp_path, value.as_bytes())
            .map_err(|e| StorageError::Write { key, reason: e.to_string() })?;
        std::fs::rename(&tmp_path, &file_path)
            .map_err(|e| StorageError::Write { key, reason: e.to_string() })?;

        info!("Saved value for key: {}", key);
        Ok(())
    }

    fn get(&self, key: StoreKey) -> Result<Option<String>, StorageError> {
        let file_path = self.file_for(key);

        match std::fs::read(&file_path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StorageError::Read { key, reason: e.to_string() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read { key, reason: e.to_string() }),
        }
    }

    fn remove(&self, key: StoreKey) -> Result<(), StorageError> {
        let file_path = self.file_for(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path)
                .map_err(|e| StorageError::Write { key, reason: e.to_string() })?;
            info!("Deleted stored value for key: {}", key);
        }

        Ok(())
    }
}

/// Process-local store, lost on exit
#[derive(Default)]
pub struct MemoryTokenStore {
    values: Mutex<HashMap<StoreKey, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn set(&self, key: StoreKey, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        values.insert(key, value.to_string());
        Ok(())
    }

    fn get(&self, key: StoreKey) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(values.get(&key).cloned())
    }

    fn remove(&self, key: StoreKey) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        values.remove(&key);
        Ok(())
    }
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write {key}: {reason}")]
    Write { key: StoreKey, reason: String },

    #[error("Failed to read {key}: {reason}")]
    Read { key: StoreKey, reason: String },

    #[error("Storage lock poisoned")]
    Poisoned,
}
