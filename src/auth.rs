//! Authentication Module
//!
//! Session handle over the token store. One `Session` is built per process
//! and cloned into everything that needs the token or identity references.

use std::sync::Arc;
use tracing::info;

use crate::storage::{StorageError, StoreKey, TokenStore};

/// Shared view of the persisted credentials
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn TokenStore>,
}

impl Session {
    /// Create a session backed by `store`
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Current bearer token, if authenticated
    pub fn token(&self) -> Result<Option<String>, StorageError> {
        self.read(StoreKey::Token)
    }

    /// Driver identity returned at login/registration
    pub fn driver_id(&self) -> Result<Option<String>, StorageError> {
        self.read(StoreKey::DriverId)
    }

    /// Bus identity returned at route registration
    pub fn bus_id(&self) -> Result<Option<String>, StorageError> {
        self.read(StoreKey::BusId)
    }

    /// Check if a token is stored
    pub fn is_authenticated(&self) -> Result<bool, StorageError> {
        Ok(self.token()?.is_some())
    }

    pub fn store_token(&self, token: &str) -> Result<(), StorageError> {
        self.store.set(StoreKey::Token, token)?;
        info!("Session token stored");
        Ok(())
    }

    /// Put back a token read earlier, or remove it when there was none
    pub fn restore_token(&self, previous: Option<&str>) -> Result<(), StorageError> {
        match previous {
            Some(token) => self.store.set(StoreKey::Token, token)?,
            None => self.store.remove(StoreKey::Token)?,
        }
        info!("Session token restored");
        Ok(())
    }

    pub fn store_driver_id(&self, driver_id: &str) -> Result<(), StorageError> {
        self.store.set(StoreKey::DriverId, driver_id)?;
        info!("Driver id stored: {}", driver_id);
        Ok(())
    }

    pub fn store_bus_id(&self, bus_id: &str) -> Result<(), StorageError> {
        self.store.set(StoreKey::BusId, bus_id)?;
        info!("Bus id stored: {}", bus_id);
        Ok(())
    }

    /// Forget the token and both identity references
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in StoreKey::ALL {
            self.store.remove(key)?;
        }
        info!("Session cleared");
        Ok(())
    }

    fn read(&self, key: StoreKey) -> Result<Option<String>, StorageError> {
        // An empty value is what an interrupted writer would leave; treat it as absent.
        Ok(self.store.get(key)?.filter(|value| !value.is_empty()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}
