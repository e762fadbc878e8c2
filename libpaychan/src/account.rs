use crate::channel_id::ChannelId;
use crate::claim::SignedClaim;
use crate::paychan::PaychanEntry;
use crate::store::{StoreError, StoreWrapper};
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Cache-only marker set while a client channel is being created on the
/// ledger, so a concurrent funding request short-circuits.
const PENDING_MARKER: &str = "pending";

/// Opaque client identifier, derived from the suffix of the client's ILP
/// address.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        AccountId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        AccountId(id.to_string())
    }
}

/// Readiness of an account. `PreparingChannel` and
/// `PreparingClientChannel` act as locks while a ledger round-trip decides
/// whether a channel can be adopted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Initial,
    LoadingChannel,
    EstablishingChannel,
    PreparingChannel,
    LoadingClientChannel,
    EstablishingClientChannel,
    PreparingClientChannel,
    Ready,
    Blocked,
}

impl Display for AccountState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccountState::Initial => "Initial",
            AccountState::LoadingChannel => "LoadingChannel",
            AccountState::EstablishingChannel => "EstablishingChannel",
            AccountState::PreparingChannel => "PreparingChannel",
            AccountState::LoadingClientChannel => "LoadingClientChannel",
            AccountState::EstablishingClientChannel => "EstablishingClientChannel",
            AccountState::PreparingClientChannel => "PreparingClientChannel",
            AccountState::Ready => "Ready",
            AccountState::Blocked => "Blocked",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account {account} must be in state {expected} but is in state {actual}")]
    WrongState { account: AccountId, expected: AccountState, actual: AccountState },
    #[error("account {account} is blocked: {reason}")]
    Blocked { account: AccountId, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-peer state: persisted balances and channel bindings behind the store
/// wrapper, plus the in-memory readiness machine, ledger views and control
/// flags.
pub struct Account {
    account_id: AccountId,
    store: Arc<StoreWrapper>,
    state: AccountState,
    incoming_paychan: Option<PaychanEntry>,
    client_paychan: Option<PaychanEntry>,
    owed_balance: u64,
    funding: bool,
    claim_task: Option<JoinHandle<()>>,
}

impl Account {
    pub fn new(account_id: AccountId, store: Arc<StoreWrapper>) -> Self {
        Account {
            account_id,
            store,
            state: AccountState::Initial,
            incoming_paychan: None,
            client_paychan: None,
            owed_balance: 0,
            funding: false,
            claim_task: None,
        }
    }

    fn key(&self) -> String {
        self.account_id.0.clone()
    }

    fn subkey(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.account_id)
    }

    /// Loads every persisted field. Valid only from `Initial`; a persisted
    /// block leaves the account terminally blocked, otherwise the account
    /// moves on to channel loading.
    pub async fn connect(&mut self) -> Result<(), AccountError> {
        self.assert_state(AccountState::Initial)?;
        self.store.load(&self.key()).await?;
        for suffix in ["claim", "channel", "client_channel", "outgoing_balance", "last_claimed", "block", "block_reason"] {
            self.store.load(&self.subkey(suffix)).await?;
        }
        if self.blocked() {
            debug!("account {} is blocked ({:?})", self.account_id, self.block_reason());
            self.set_state(AccountState::Blocked);
        } else {
            self.set_state(AccountState::LoadingChannel);
        }
        Ok(())
    }

    /// Drops all cached keys; pending writes still drain through the store.
    pub fn unload(&self) {
        self.store.unload(&self.key());
        for suffix in ["claim", "channel", "client_channel", "outgoing_balance", "last_claimed", "block", "block_reason"] {
            self.store.unload(&self.subkey(suffix));
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn full_address(&self, ilp_address: &str) -> String {
        format!("{ilp_address}.{}", self.account_id)
    }

    pub fn state(&self) -> AccountState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == AccountState::Ready
    }

    pub(crate) fn set_state(&mut self, state: AccountState) {
        trace!("account {}: {} -> {state}", self.account_id, self.state);
        self.state = state;
    }

    pub fn assert_state(&self, expected: AccountState) -> Result<(), AccountError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AccountError::WrongState {
                account: self.account_id.clone(),
                expected,
                actual: self.state,
            })
        }
    }

    // ---- persisted fields ----

    fn get_u64(&self, key: &str) -> u64 {
        self.store.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Running sum of in-flight incoming PREPARE amounts, in base units.
    pub fn prepared(&self) -> u64 {
        self.get_u64(&self.key())
    }

    pub fn set_prepared(&mut self, prepared: u64) {
        self.store.set(&self.key(), prepared.to_string());
    }

    /// The largest validly signed claim ever received. Monotonic while the
    /// incoming channel is unchanged.
    pub fn incoming_claim(&self) -> SignedClaim {
        self.store
            .get(&self.subkey("claim"))
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(SignedClaim::zero)
    }

    pub fn set_incoming_claim(&mut self, claim: &SignedClaim) {
        let raw = serde_json::to_string(claim).expect("claims serialize infallibly");
        self.store.set(&self.subkey("claim"), raw);
    }

    /// The channel balance the ledger already reflects, in base units.
    pub fn last_claimed(&self) -> u64 {
        self.get_u64(&self.subkey("last_claimed"))
    }

    pub fn set_last_claimed(&mut self, amount: u64) {
        self.store.set(&self.subkey("last_claimed"), amount.to_string());
    }

    /// Cumulative amount promised through signed outgoing claims, in base
    /// units. Monotonic.
    pub fn outgoing_balance(&self) -> u64 {
        self.get_u64(&self.subkey("outgoing_balance"))
    }

    pub fn set_outgoing_balance(&mut self, amount: u64) {
        self.store.set(&self.subkey("outgoing_balance"), amount.to_string());
    }

    pub fn incoming_channel(&self) -> Option<ChannelId> {
        self.store.get(&self.subkey("channel")).and_then(|raw| ChannelId::from_hex(&raw).ok())
    }

    pub fn set_incoming_channel(&mut self, channel: &ChannelId) {
        self.store.set(&self.subkey("channel"), channel.to_hex());
    }

    pub fn client_channel(&self) -> Option<ChannelId> {
        self.store.get(&self.subkey("client_channel")).and_then(|raw| ChannelId::from_hex(&raw).ok())
    }

    pub fn client_channel_pending(&self) -> bool {
        self.store.get(&self.subkey("client_channel")).as_deref() == Some(PENDING_MARKER)
    }

    /// Optimistic lock: marks the client channel as being created without
    /// persisting anything.
    pub fn mark_client_channel_pending(&mut self) {
        self.store.set_cache(&self.subkey("client_channel"), PENDING_MARKER);
    }

    pub fn clear_client_channel_pending(&mut self) {
        if self.client_channel_pending() {
            self.store.unload(&self.subkey("client_channel"));
        }
    }

    pub fn set_client_channel(&mut self, channel: &ChannelId) {
        self.store.set(&self.subkey("client_channel"), channel.to_hex());
    }

    pub fn blocked(&self) -> bool {
        self.store.get(&self.subkey("block")).as_deref() == Some("true")
    }

    pub fn block_reason(&self) -> Option<String> {
        self.store.get(&self.subkey("block_reason"))
    }

    pub fn ensure_not_blocked(&self) -> Result<(), AccountError> {
        if self.blocked() {
            Err(AccountError::Blocked {
                account: self.account_id.clone(),
                reason: self.block_reason().unwrap_or_default(),
            })
        } else {
            Ok(())
        }
    }

    /// Terminal disable. The reason is persisted; a blocked account rejects
    /// all data across restarts.
    pub fn block(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("blocking account {}: {reason}", self.account_id);
        self.store.set(&self.subkey("block"), "true");
        self.store.set(&self.subkey("block_reason"), reason);
        self.set_state(AccountState::Blocked);
        if let Some(task) = self.claim_task.take() {
            task.abort();
        }
    }

    /// Invoked only once the channel no longer exists on the ledger: the
    /// already-claimed portion comes off the prepared total and the channel
    /// binding is erased.
    pub fn delete_channel(&mut self) {
        let prepared = self.prepared().saturating_sub(self.last_claimed());
        self.set_prepared(prepared);
        self.store.delete(&self.subkey("channel"));
        self.store.delete(&self.subkey("claim"));
        self.store.delete(&self.subkey("last_claimed"));
        self.incoming_paychan = None;
    }

    // ---- in-memory fields ----

    pub fn incoming_paychan(&self) -> Option<&PaychanEntry> {
        self.incoming_paychan.as_ref()
    }

    pub fn set_incoming_paychan(&mut self, entry: Option<PaychanEntry>) {
        self.incoming_paychan = entry;
    }

    pub fn client_paychan(&self) -> Option<&PaychanEntry> {
        self.client_paychan.as_ref()
    }

    pub fn set_client_paychan(&mut self, entry: Option<PaychanEntry>) {
        self.client_paychan = entry;
    }

    /// Amount still owed to the peer after failed settlements, in base
    /// units. Paid back by the next successful settlement.
    pub fn owed_balance(&self) -> u64 {
        self.owed_balance
    }

    pub fn set_owed_balance(&mut self, amount: u64) {
        self.owed_balance = amount;
    }

    pub fn add_owed_balance(&mut self, amount: u64) {
        self.owed_balance = self.owed_balance.saturating_add(amount);
    }

    /// Non-reentrancy flag for in-flight funding of the client channel.
    pub fn funding(&self) -> bool {
        self.funding
    }

    pub fn set_funding(&mut self, funding: bool) {
        self.funding = funding;
    }

    pub fn set_claim_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.claim_task.replace(task) {
            old.abort();
        }
    }

    pub fn stop_claim_task(&mut self) {
        if let Some(task) = self.claim_task.take() {
            task.abort();
        }
    }
}

impl Debug for Account {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("account_id", &self.account_id)
            .field("state", &self.state)
            .field("prepared", &self.prepared())
            .field("incoming_claim", &self.incoming_claim().amount)
            .field("outgoing_balance", &self.outgoing_balance())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{MemoryStore, Store};

    async fn fresh_account(backend: Arc<MemoryStore>) -> Account {
        let store = Arc::new(StoreWrapper::new(backend as Arc<dyn Store>));
        let mut account = Account::new(AccountId::from("alice"), store);
        account.connect().await.unwrap();
        account
    }

    #[tokio::test]
    async fn connect_moves_to_loading_channel() {
        let account = fresh_account(Arc::new(MemoryStore::new())).await;
        assert_eq!(account.state(), AccountState::LoadingChannel);
        assert_eq!(account.prepared(), 0);
        assert_eq!(account.incoming_claim(), SignedClaim::zero());
    }

    #[tokio::test]
    async fn connect_is_valid_only_from_initial() {
        let mut account = fresh_account(Arc::new(MemoryStore::new())).await;
        let err = account.connect().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "account alice must be in state Initial but is in state LoadingChannel"
        );
    }

    #[tokio::test]
    async fn persisted_fields_survive_reload() {
        let backend = Arc::new(MemoryStore::new());
        {
            let store = Arc::new(StoreWrapper::new(Arc::clone(&backend) as Arc<dyn Store>));
            let mut account = Account::new(AccountId::from("alice"), Arc::clone(&store));
            account.connect().await.unwrap();
            account.set_prepared(1234);
            account.set_outgoing_balance(99);
            account.set_incoming_claim(&SignedClaim { amount: 500, signature: vec![1; 64] });
            store.close().await.unwrap();
        }
        let account = fresh_account(backend).await;
        assert_eq!(account.prepared(), 1234);
        assert_eq!(account.outgoing_balance(), 99);
        assert_eq!(account.incoming_claim().amount, 500);
    }

    #[tokio::test]
    async fn block_is_terminal_and_persistent() {
        let backend = Arc::new(MemoryStore::new());
        {
            let store = Arc::new(StoreWrapper::new(Arc::clone(&backend) as Arc<dyn Store>));
            let mut account = Account::new(AccountId::from("alice"), Arc::clone(&store));
            account.connect().await.unwrap();
            account.block("channel 0000 closed");
            assert_eq!(account.state(), AccountState::Blocked);
            store.close().await.unwrap();
        }
        let account = fresh_account(backend).await;
        assert_eq!(account.state(), AccountState::Blocked);
        assert!(account.blocked());
        assert_eq!(account.block_reason().as_deref(), Some("channel 0000 closed"));
    }

    #[tokio::test]
    async fn delete_channel_returns_claimed_liability() {
        let mut account = fresh_account(Arc::new(MemoryStore::new())).await;
        account.set_prepared(1000);
        account.set_last_claimed(600);
        account.set_incoming_channel(&ChannelId::new([3u8; 32]));
        account.set_incoming_claim(&SignedClaim { amount: 600, signature: vec![1; 64] });

        account.delete_channel();
        assert_eq!(account.prepared(), 400);
        assert!(account.incoming_channel().is_none());
        assert_eq!(account.incoming_claim(), SignedClaim::zero());
        assert_eq!(account.last_claimed(), 0);
    }

    #[tokio::test]
    async fn client_channel_pending_marker() {
        let mut account = fresh_account(Arc::new(MemoryStore::new())).await;
        assert!(!account.client_channel_pending());
        account.mark_client_channel_pending();
        assert!(account.client_channel_pending());
        assert!(account.client_channel().is_none());

        account.clear_client_channel_pending();
        assert!(!account.client_channel_pending());

        let id = ChannelId::new([7u8; 32]);
        account.set_client_channel(&id);
        assert_eq!(account.client_channel(), Some(id));
        assert!(!account.client_channel_pending());
    }
}
