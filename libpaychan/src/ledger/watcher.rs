use crate::channel_id::ChannelId;
use crate::ledger::error::LedgerError;
use crate::ledger::traits::LedgerClient;
use crate::paychan::PaychanEntry;
use log::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// The ledger has no explicit close event; `expiration` simply appears in
/// the channel entry. This period bounds how long a close can go unnoticed.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(600);

/// Polls each watched channel and reports the ones that entered their
/// settle-delay window or vanished from the ledger.
pub struct ChannelWatcher {
    ledger: Arc<dyn LedgerClient>,
    poll_interval: Duration,
    watched: Mutex<HashSet<ChannelId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelWatcher {
    pub fn new(ledger: Arc<dyn LedgerClient>, poll_interval: Duration) -> Self {
        ChannelWatcher {
            ledger,
            poll_interval,
            watched: Mutex::new(HashSet::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn watch(&self, id: ChannelId) {
        if self.watched.lock().expect("watcher lock poisoned").insert(id) {
            debug!("watching channel {id}");
        }
    }

    pub fn unwatch(&self, id: &ChannelId) {
        self.watched.lock().expect("watcher lock poisoned").remove(id);
    }

    pub fn watched(&self) -> Vec<ChannelId> {
        self.watched.lock().expect("watcher lock poisoned").iter().copied().collect()
    }

    /// A channel is closing once a close has been requested (`expiration`
    /// set) or its `cancel_after` is inside the settle-delay window.
    pub fn is_closing(entry: &PaychanEntry, now: u64) -> bool {
        if entry.expiration.is_some() {
            return true;
        }
        match entry.cancel_after {
            Some(cancel_after) => now + u64::from(entry.settle_delay) >= cancel_after,
            None => false,
        }
    }

    /// Spawns the polling loop. `on_close` fires once per closing channel;
    /// the channel is unwatched before the callback runs.
    pub fn start<F>(self: &Arc<Self>, on_close: F)
    where
        F: Fn(ChannelId) + Send + Sync + 'static,
    {
        let watcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let snapshot = watcher.watched();
                let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs();
                for id in snapshot {
                    match watcher.ledger.get_payment_channel(&id).await {
                        Ok(entry) => {
                            if Self::is_closing(&entry, now) {
                                info!("channel {id} is closing");
                                watcher.unwatch(&id);
                                on_close(id);
                            }
                        }
                        Err(LedgerError::EntryNotFound) => {
                            info!("channel {id} disappeared from the ledger");
                            watcher.unwatch(&id);
                            on_close(id);
                        }
                        Err(e) => debug!("could not poll channel {id}: {e}"),
                    }
                }
            }
        });
        if let Some(old) = self.handle.lock().expect("watcher lock poisoned").replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().expect("watcher lock poisoned").take() {
            handle.abort();
        }
    }
}
