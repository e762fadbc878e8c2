pub mod wrapper;

pub use wrapper::StoreWrapper;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// The persistent key-value store consumed by the core. All operations are
/// async; ordering guarantees are provided by [`StoreWrapper`], not here.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store used in tests and by hosts that do not need persistence.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map.lock().expect("memory store lock poisoned").clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.lock().expect("memory store lock poisoned").get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map.lock().expect("memory store lock poisoned").insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.map.lock().expect("memory store lock poisoned").remove(key);
        Ok(())
    }
}
