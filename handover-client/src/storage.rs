//! Local persistence for warm starts.
//!
//! The engine persists its state tree through a small key-value
//! abstraction so platform shells can plug in whatever they have
//! (files, browser storage, a keychain-adjacent store). Persistence is
//! a cache: a read failure means a cold start, never a hard error.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store rejected the operation.
    #[error("storage I/O failed: {0}")]
    Io(String),
    /// The stored bytes did not decode.
    #[error("corrupt stored value for '{0}'")]
    Corrupt(String),
}

/// Async key-value storage.
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// Read a value. `Ok(None)` means the key was never written.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl KvStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
