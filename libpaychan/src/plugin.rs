use crate::account::{Account, AccountError, AccountId, AccountState};
use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use crate::claim::ClaimError;
use crate::config::{ConfigError, PluginConfig};
use crate::engine::{self, SettleError, OUTGOING_CHANNEL_AMOUNT_DROPS};
use crate::ilp::{codes, Packet, Prepare};
use crate::ledger::watcher::DEFAULT_WATCH_INTERVAL;
use crate::ledger::{
    ChannelClaimParams, ChannelFundParams, ChannelWatcher, LedgerClient, LedgerError, SubmitError, TxSubmitter,
};
use crate::paychan::{validate_paychan, PaychanEntry, PaychanError};
use crate::protocol::{Message, ProtocolError};
use crate::store::{Store, StoreError, StoreWrapper};
use async_trait::async_trait;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

const LOAD_RETRY_ATTEMPTS: u32 = 5;
const LOAD_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Paychan(#[from] PaychanError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Settle(#[from] SettleError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, Error)]
#[error("data handler error: {0}")]
pub struct HandlerError(pub String);

/// Delivers unsolicited messages and settlement transfers to a connected
/// peer over the host's framing.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_message(&self, to: &AccountId, message: Message) -> Result<(), TransportError>;

    async fn send_transfer(&self, to: &AccountId, amount: u64, message: Message) -> Result<(), TransportError>;
}

/// Host callback for relayed ILP packets; takes and returns serialized
/// packets.
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle_data(&self, from: &AccountId, data: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

/// Host callback for incoming money.
#[async_trait]
pub trait MoneyHandler: Send + Sync {
    async fn handle_money(&self, from: &AccountId, amount: u64);
}

/// Transport that records everything it is asked to deliver. Useful in
/// tests and for hosts that poll outgoing messages.
#[derive(Default)]
pub struct DummyTransport {
    messages: StdMutex<Vec<(AccountId, Message)>>,
    transfers: StdMutex<Vec<(AccountId, u64, Message)>>,
}

impl DummyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(AccountId, Message)> {
        self.messages.lock().expect("transport lock poisoned").clone()
    }

    pub fn transfers(&self) -> Vec<(AccountId, u64, Message)> {
        self.transfers.lock().expect("transport lock poisoned").clone()
    }
}

#[async_trait]
impl PeerTransport for DummyTransport {
    async fn send_message(&self, to: &AccountId, message: Message) -> Result<(), TransportError> {
        self.messages.lock().expect("transport lock poisoned").push((to.clone(), message));
        Ok(())
    }

    async fn send_transfer(&self, to: &AccountId, amount: u64, message: Message) -> Result<(), TransportError> {
        self.transfers.lock().expect("transport lock poisoned").push((to.clone(), amount, message));
        Ok(())
    }
}

/// Registry of live accounts. Checkout takes the per-account write lock so
/// at most one handler mutates an account at a time.
pub struct AccountRegistry {
    inner: Arc<RwLock<HashMap<AccountId, Arc<RwLock<Account>>>>>,
}

impl Clone for AccountRegistry {
    fn clone(&self) -> Self {
        AccountRegistry { inner: Arc::clone(&self.inner) }
    }
}

impl AccountRegistry {
    fn new() -> Self {
        AccountRegistry { inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn get(&self, id: &AccountId) -> Option<Arc<RwLock<Account>>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Registers `handle` unless the account is already present; returns the
    /// winning handle and whether it was freshly inserted.
    async fn insert_if_absent(&self, id: AccountId, handle: Arc<RwLock<Account>>) -> (Arc<RwLock<Account>>, bool) {
        let mut map = self.inner.write().await;
        match map.get(&id) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                map.insert(id, Arc::clone(&handle));
                (handle, true)
            }
        }
    }

    pub async fn entries(&self) -> Vec<(AccountId, Arc<RwLock<Account>>)> {
        self.inner.read().await.iter().map(|(id, handle)| (id.clone(), Arc::clone(handle))).collect()
    }

    async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

pub(crate) fn channel_index_key(channel: &ChannelId) -> String {
    format!("channel:{channel}")
}

/// The plugin orchestrator: owns the account registry, the channel reverse
/// index, the auto-claim timers and the watcher callback, and wires the
/// external collaborators together.
pub struct PaychanServer {
    pub(crate) config: PluginConfig,
    pub(crate) store: Arc<StoreWrapper>,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) submitter: Arc<TxSubmitter>,
    pub(crate) watcher: Arc<ChannelWatcher>,
    pub(crate) accounts: AccountRegistry,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) data_handler: StdMutex<Option<Arc<dyn DataHandler>>>,
    pub(crate) money_handler: StdMutex<Option<Arc<dyn MoneyHandler>>>,
}

impl PaychanServer {
    /// Must be called from within a tokio runtime: the store wrapper spawns
    /// its writer task immediately.
    pub fn new(
        config: PluginConfig,
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerClient>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let submitter = Arc::new(TxSubmitter::new(
            Arc::clone(&ledger),
            config.address.clone(),
            config.secret.expose().to_string(),
        ));
        let watcher = Arc::new(ChannelWatcher::new(Arc::clone(&ledger), DEFAULT_WATCH_INTERVAL));
        Ok(Arc::new(PaychanServer {
            config,
            store: Arc::new(StoreWrapper::new(store)),
            ledger,
            submitter,
            watcher,
            accounts: AccountRegistry::new(),
            transport,
            data_handler: StdMutex::new(None),
            money_handler: StdMutex::new(None),
        }))
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn register_data_handler(&self, handler: Arc<dyn DataHandler>) {
        *self.data_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    pub fn register_money_handler(&self, handler: Arc<dyn MoneyHandler>) {
        *self.money_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    pub(crate) fn data_handler(&self) -> Option<Arc<dyn DataHandler>> {
        self.data_handler.lock().expect("handler lock poisoned").clone()
    }

    pub(crate) fn money_handler(&self) -> Option<Arc<dyn MoneyHandler>> {
        self.money_handler.lock().expect("handler lock poisoned").clone()
    }

    /// Connects the ledger client and arms the channel watcher.
    pub async fn start(self: &Arc<Self>) -> Result<(), PluginError> {
        self.ledger.connect().await?;
        let weak = Arc::downgrade(self);
        self.watcher.start(move |channel| {
            if let Some(server) = weak.upgrade() {
                tokio::spawn(server.handle_channel_close(channel));
            }
        });
        info!("payment channel server started at {}", self.config.address);
        Ok(())
    }

    /// Stops all control loops, unloads caches and drains the store.
    /// Idempotent.
    pub async fn disconnect(&self) -> Result<(), PluginError> {
        self.watcher.stop();
        for (_, handle) in self.accounts.entries().await {
            let mut account = handle.write().await;
            account.stop_claim_task();
            account.unload();
        }
        self.accounts.clear().await;
        self.store.close().await?;
        self.ledger.disconnect().await?;
        info!("payment channel server disconnected");
        Ok(())
    }

    /// Returns the live handle for an account, loading it from the store
    /// (and re-validating its channels against the ledger) on first touch.
    pub async fn get_or_create_account(self: &Arc<Self>, id: &AccountId) -> Result<Arc<RwLock<Account>>, PluginError> {
        if let Some(handle) = self.accounts.get(id).await {
            return Ok(handle);
        }
        let mut account = Account::new(id.clone(), Arc::clone(&self.store));
        account.connect().await?;
        let handle = Arc::new(RwLock::new(account));
        let (handle, fresh) = self.accounts.insert_if_absent(id.clone(), handle).await;
        if fresh {
            let mut account = handle.write().await;
            self.load_account_channels(&handle, &mut account).await?;
        }
        Ok(handle)
    }

    /// Drives a freshly connected account through `LoadingChannel` and
    /// `LoadingClientChannel` based on its persisted channel bindings.
    async fn load_account_channels(
        self: &Arc<Self>,
        handle: &Arc<RwLock<Account>>,
        account: &mut Account,
    ) -> Result<(), PluginError> {
        if account.state() == AccountState::Blocked {
            return Ok(());
        }
        account.assert_state(AccountState::LoadingChannel)?;
        let Some(channel) = account.incoming_channel() else {
            account.set_state(AccountState::EstablishingChannel);
            return Ok(());
        };

        let mut attempt = 0;
        let entry = loop {
            match self.ledger.get_payment_channel(&channel).await {
                Ok(entry) => break entry,
                Err(LedgerError::EntryNotFound) => {
                    self.store.delete(&channel_index_key(&channel));
                    account.delete_channel();
                    account.block(format!("incoming channel {channel} no longer exists on the ledger"));
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < LOAD_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!("could not load channel {channel} (attempt {attempt}): {e}");
                    tokio::time::sleep(LOAD_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Err(e) = validate_paychan(&entry, &self.config.address) {
            account.block(format!("incoming channel {channel} failed validation on reload: {e}"));
            return Ok(());
        }
        self.adopt_incoming(handle, account, channel, entry);
        self.resolve_client_channel(account).await
    }

    /// Binds a validated incoming channel: ledger view, watcher, auto-claim.
    pub(crate) fn adopt_incoming(
        self: &Arc<Self>,
        handle: &Arc<RwLock<Account>>,
        account: &mut Account,
        channel: ChannelId,
        entry: PaychanEntry,
    ) {
        account.set_incoming_channel(&channel);
        account.set_incoming_paychan(Some(entry));
        self.watcher.watch(channel);
        self.start_auto_claim(handle, account);
    }

    /// Loads the reverse channel if one is persisted, arriving at `Ready`
    /// or `EstablishingClientChannel`.
    pub(crate) async fn resolve_client_channel(&self, account: &mut Account) -> Result<(), PluginError> {
        account.set_state(AccountState::LoadingClientChannel);
        let Some(channel) = account.client_channel() else {
            account.set_state(AccountState::EstablishingClientChannel);
            return Ok(());
        };
        match self.ledger.get_payment_channel(&channel).await {
            Ok(entry) => {
                account.set_client_paychan(Some(entry));
                account.set_state(AccountState::Ready);
                Ok(())
            }
            Err(LedgerError::EntryNotFound) => {
                warn!("client channel {channel} of account {} is gone; a new one is needed", account.account_id());
                account.set_client_paychan(None);
                self.store.delete(&format!("{}:client_channel", account.account_id()));
                account.set_state(AccountState::EstablishingClientChannel);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn start_auto_claim(self: &Arc<Self>, handle: &Arc<RwLock<Account>>, account: &mut Account) {
        let interval = self.config.claim_interval();
        let weak = Arc::downgrade(self);
        let handle = Arc::clone(handle);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; claiming starts one interval in
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = weak.upgrade() else { break };
                server.auto_claim(&handle).await;
            }
        });
        account.set_claim_task(task);
    }

    /// One auto-claim evaluation: claim on-ledger iff there is new income
    /// and the network fee stays within the configured fraction of it.
    pub async fn auto_claim(&self, handle: &Arc<RwLock<Account>>) {
        let mut account = handle.write().await;
        let claim = account.incoming_claim();
        if !claim.has_signature() {
            return;
        }
        let income = claim.amount.saturating_sub(account.last_claimed());
        if income == 0 {
            trace!("account {}: nothing new to claim", account.account_id());
            return;
        }
        let Some(channel) = account.incoming_channel() else { return };
        let scale = self.config.scale();

        let fee = match self.ledger.get_fee().await {
            Ok(fee) => fee,
            Err(e) => {
                warn!("could not fetch network fee: {e}");
                return;
            }
        };
        let fee_base = fee.to_base_ceil(scale).unwrap_or(u64::MAX);
        if fee_base as f64 / income as f64 > self.config.fee_percent() {
            debug!(
                "account {}: claiming {income} would spend {fee_base} on fees, skipping",
                account.account_id()
            );
            return;
        }

        let Some(claim_drops) = DropAmount::from_base_ceil(claim.amount, scale) else { return };
        match self.ledger.get_payment_channel(&channel).await {
            Ok(entry) => {
                if entry.balance >= claim_drops {
                    debug!("account {}: ledger already covers the claim", account.account_id());
                    account.set_last_claimed(claim.amount);
                    return;
                }
                account.set_incoming_paychan(Some(entry));
            }
            Err(e) => {
                warn!("could not refresh channel {channel} before claiming: {e}");
                return;
            }
        }

        self.channel_claim(&mut account, false).await;
    }

    /// Submits the account's best claim on-ledger; with `close` set it also
    /// requests channel closure. Failures are logged, not propagated: the
    /// signed claim is retained and a later attempt can retry.
    pub(crate) async fn channel_claim(&self, account: &mut Account, close: bool) {
        let claim = account.incoming_claim();
        if !claim.has_signature() {
            debug!("account {} holds no claim to submit", account.account_id());
            return;
        }
        let Some(channel) = account.incoming_channel() else { return };
        let Some(paychan) = account.incoming_paychan() else { return };
        let Some(balance) = DropAmount::from_base_ceil(claim.amount, self.config.scale()) else { return };
        let params = ChannelClaimParams {
            channel,
            balance: Some(balance),
            signature: Some(hex::encode_upper(&claim.signature)),
            public_key: Some(paychan.public_key.clone()),
            close,
            source_tag: 0,
        };
        match self.submitter.claim_channel(params).await {
            Ok(event) => {
                info!(
                    "account {}: claimed {balance} drops on channel {channel} (tx {}{})",
                    account.account_id(),
                    event.hash,
                    if close { ", closing" } else { "" }
                );
                account.set_last_claimed(claim.amount);
            }
            Err(e) => error!("claim submission for account {} failed: {e}", account.account_id()),
        }
    }

    /// Settlement after an observed FULFILL: pays the fulfilled amount plus
    /// anything still owed from earlier failed settlements.
    pub async fn send_money(self: &Arc<Self>, account_id: &AccountId, amount: u64) -> Result<(), PluginError> {
        let handle = self.get_or_create_account(account_id).await?;
        let mut account = handle.write().await;
        let total = account.owed_balance().saturating_add(amount);
        if total == 0 {
            return Ok(());
        }
        match engine::sign_outgoing_claim(&mut account, total, self.config.secret.expose(), self.config.scale()) {
            Ok(outgoing) => {
                account.set_owed_balance(0);
                if outgoing.needs_funding {
                    self.start_funding(&handle, &mut account);
                }
                let message = Message::claim_transfer(&outgoing.claim);
                drop(account);
                if let Err(e) = self.transport.send_transfer(account_id, total, message).await {
                    warn!("could not deliver settlement to {account_id}: {e}");
                }
                Ok(())
            }
            Err(e) => {
                error!("cannot settle {total} to account {account_id}: {e}");
                account.add_owed_balance(amount);
                Err(e.into())
            }
        }
    }

    /// Opportunistic settlement of just the owed balance, used when the
    /// peer signals T04. Failure leaves the debt for the next settlement.
    pub async fn settle_owed(self: &Arc<Self>, account_id: &AccountId) -> Result<(), PluginError> {
        let handle = self.get_or_create_account(account_id).await?;
        let mut account = handle.write().await;
        let owed = account.owed_balance();
        if owed == 0 {
            return Ok(());
        }
        match engine::sign_outgoing_claim(&mut account, owed, self.config.secret.expose(), self.config.scale()) {
            Ok(outgoing) => {
                account.set_owed_balance(0);
                if outgoing.needs_funding {
                    self.start_funding(&handle, &mut account);
                }
                let message = Message::claim_transfer(&outgoing.claim);
                drop(account);
                if let Err(e) = self.transport.send_transfer(account_id, owed, message).await {
                    warn!("could not deliver settlement to {account_id}: {e}");
                }
                Ok(())
            }
            Err(e) => {
                debug!("opportunistic settlement of owed balance failed: {e}");
                Ok(())
            }
        }
    }

    /// Host entry point for responses to packets the server forwarded to
    /// this peer.
    pub async fn handle_prepare_response(self: &Arc<Self>, account_id: &AccountId, prepare: &Prepare, response: &Packet) {
        match response {
            Packet::Fulfill(_) if prepare.amount > 0 => {
                if let Err(e) = self.send_money(account_id, prepare.amount).await {
                    warn!("settlement after fulfill failed for {account_id}: {e}");
                }
            }
            Packet::Reject(reject) if reject.code == codes::T04_INSUFFICIENT_LIQUIDITY => {
                if let Err(e) = self.settle_owed(account_id).await {
                    warn!("owed settlement failed for {account_id}: {e}");
                }
            }
            _ => {}
        }
    }

    /// Kicks off a non-reentrant funding transaction for the account's
    /// client channel. The `funding` flag is cleared when the task ends.
    pub(crate) fn start_funding(self: &Arc<Self>, handle: &Arc<RwLock<Account>>, account: &mut Account) {
        if account.funding() {
            return;
        }
        account.set_funding(true);
        info!("funding client channel of account {}", account.account_id());
        let server = Arc::clone(self);
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let result = server.fund_client_channel(&handle).await;
            let mut account = handle.write().await;
            account.set_funding(false);
            if let Err(e) = result {
                error!("funding of client channel for {} failed: {e}", account.account_id());
            }
        });
    }

    async fn fund_client_channel(&self, handle: &Arc<RwLock<Account>>) -> Result<(), PluginError> {
        let (account_id, channel) = {
            let account = handle.read().await;
            let channel = account
                .client_channel()
                .ok_or_else(|| ProtocolError::Invalid("no client channel to fund".to_string()))?;
            (account.account_id().clone(), channel)
        };
        self.submitter
            .fund_channel(ChannelFundParams {
                channel,
                amount: DropAmount::from_drops(OUTGOING_CHANNEL_AMOUNT_DROPS),
                source_tag: 0,
            })
            .await?;
        let entry = self.ledger.get_payment_channel(&channel).await?;
        handle.write().await.set_client_paychan(Some(entry));
        // tell the peer so it can refresh its view of the channel
        self.transport.send_message(&account_id, Message::channel_notification(&channel)).await?;
        Ok(())
    }

    /// Watcher callback: the channel entered its settle-delay window or
    /// vanished. Blocks the account and races the peer's close with a final
    /// claim.
    pub async fn handle_channel_close(self: Arc<Self>, channel: ChannelId) {
        info!("handling close of channel {channel}");
        let key = channel_index_key(&channel);
        if let Err(e) = self.store.load(&key).await {
            warn!("could not load the channel index for {channel}: {e}");
        }
        let Some(raw) = self.store.get(&key) else {
            warn!("no account is associated with closing channel {channel}");
            return;
        };
        let account_id = AccountId::new(raw);
        let handle = match self.get_or_create_account(&account_id).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("could not load account {account_id} for channel close: {e}");
                return;
            }
        };
        let mut account = handle.write().await;
        account.block(format!("incoming channel {channel} was closed"));
        self.channel_claim(&mut account, true).await;
    }
}
