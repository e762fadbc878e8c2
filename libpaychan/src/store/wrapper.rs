use crate::store::{Store, StoreError};
use futures::channel::oneshot;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum WriteOp {
    Put(String, String),
    Del(String),
    Flush(oneshot::Sender<()>),
}

/// Write-through cache in front of the persistent store.
///
/// Reads are synchronous once a key has been loaded. Writes update the cache
/// immediately and are persisted by a single writer task in issue order, so
/// a crash may lose trailing writes but never reorders them.
pub struct StoreWrapper {
    cache: Mutex<HashMap<String, String>>,
    tx: mpsc::UnboundedSender<WriteOp>,
    store: Arc<dyn Store>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl StoreWrapper {
    /// Spawns the writer task; must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = Arc::clone(&store);
        let writer = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Put(key, value) => {
                        if let Err(e) = backend.put(&key, &value).await {
                            error!("failed to persist {key}: {e}");
                        }
                    }
                    WriteOp::Del(key) => {
                        if let Err(e) = backend.del(&key).await {
                            error!("failed to delete {key}: {e}");
                        }
                    }
                    WriteOp::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        StoreWrapper { cache: Mutex::new(HashMap::new()), tx, store, writer: Mutex::new(Some(writer)) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().expect("store cache lock poisoned")
    }

    /// Idempotent: fetches the key from the backing store unless it is
    /// already cached. If a writer populated the cache while the fetch was
    /// in flight, the fetched value is discarded (writer wins).
    pub async fn load(&self, key: &str) -> Result<(), StoreError> {
        if self.lock().contains_key(key) {
            return Ok(());
        }
        let fetched = self.store.get(key).await?;
        if let Some(value) = fetched {
            self.lock().entry(key.to_string()).or_insert(value);
        }
        Ok(())
    }

    /// Synchronous cache read. Only meaningful after [`load`](Self::load)
    /// or a prior write.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.lock().insert(key.to_string(), value.clone());
        if self.tx.send(WriteOp::Put(key.to_string(), value)).is_err() {
            warn!("store writer is gone; write to {key} stays cache-only");
        }
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
        if self.tx.send(WriteOp::Del(key.to_string())).is_err() {
            warn!("store writer is gone; delete of {key} stays cache-only");
        }
    }

    /// Cache-only write. Used as an optimistic lock: a concurrent caller
    /// sees the marker immediately, and nothing is persisted.
    pub fn set_cache(&self, key: &str, value: impl Into<String>) {
        self.lock().insert(key.to_string(), value.into());
    }

    pub fn unload(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Drains all pending writes to the backing store.
    pub async fn close(&self) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(ack_tx)).is_ok() {
            ack_rx.await.map_err(|_| StoreError("store writer exited before draining".to_string()))?;
        }
        if let Some(handle) = self.writer.lock().expect("store writer lock poisoned").take() {
            handle.abort();
        }
        Ok(())
    }
}
