use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use crate::ledger::data_objects::{ChannelClaimParams, ChannelCreateParams, ChannelFundParams, SignedLedgerTx, TxEvent};
use crate::ledger::error::LedgerError;
use crate::ledger::traits::LedgerClient;
use crate::paychan::PaychanEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Serialize, Deserialize)]
enum TxPayload {
    Create { address: String, params: ChannelCreateParams },
    Fund { address: String, params: ChannelFundParams },
    Claim { address: String, params: ChannelClaimParams },
}

/// In-memory ledger for tests and embedding. Channels live in a map,
/// submissions validate instantly, and every submitted transaction is
/// recorded for inspection.
#[derive(Default)]
pub struct DummyLedger {
    fee: Mutex<DropAmount>,
    channels: Mutex<HashMap<ChannelId, PaychanEntry>>,
    validated: Mutex<Vec<TxEvent>>,
    claims: Mutex<Vec<ChannelClaimParams>>,
    creates: Mutex<Vec<ChannelCreateParams>>,
    funds: Mutex<Vec<ChannelFundParams>>,
    fail_next_submit: Mutex<Option<LedgerError>>,
    create_counter: AtomicU32,
    submit_attempts: AtomicU32,
}

impl DummyLedger {
    pub fn new() -> Self {
        let ledger = DummyLedger::default();
        *ledger.fee.lock().expect("dummy ledger lock poisoned") = DropAmount::from_drops(10);
        ledger
    }

    pub fn insert_channel(&self, id: ChannelId, entry: PaychanEntry) {
        self.channels.lock().expect("dummy ledger lock poisoned").insert(id, entry);
    }

    pub fn remove_channel(&self, id: &ChannelId) {
        self.channels.lock().expect("dummy ledger lock poisoned").remove(id);
    }

    pub fn channel(&self, id: &ChannelId) -> Option<PaychanEntry> {
        self.channels.lock().expect("dummy ledger lock poisoned").get(id).cloned()
    }

    pub fn set_fee(&self, fee: DropAmount) {
        *self.fee.lock().expect("dummy ledger lock poisoned") = fee;
    }

    /// Queues an error for the next `submit` call, then recovers.
    pub fn fail_next_submission(&self, error: LedgerError) {
        *self.fail_next_submit.lock().expect("dummy ledger lock poisoned") = Some(error);
    }

    pub fn submitted_claims(&self) -> Vec<ChannelClaimParams> {
        self.claims.lock().expect("dummy ledger lock poisoned").clone()
    }

    pub fn submitted_creates(&self) -> Vec<ChannelCreateParams> {
        self.creates.lock().expect("dummy ledger lock poisoned").clone()
    }

    pub fn submitted_funds(&self) -> Vec<ChannelFundParams> {
        self.funds.lock().expect("dummy ledger lock poisoned").clone()
    }

    pub fn submit_attempts(&self) -> u32 {
        self.submit_attempts.load(Ordering::Relaxed)
    }

    fn next_channel_id(&self, destination: &str) -> ChannelId {
        let n = self.create_counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(b"channel");
        hasher.update(destination.as_bytes());
        hasher.update(n.to_be_bytes());
        ChannelId::new(hasher.finalize().into())
    }

    fn apply(&self, payload: TxPayload, hash: String) {
        match payload {
            TxPayload::Create { address, params } => {
                let id = self.next_channel_id(&params.destination);
                let entry = PaychanEntry {
                    account: address.clone(),
                    destination: params.destination.clone(),
                    amount: params.amount,
                    balance: DropAmount::ZERO,
                    public_key: params.public_key.clone(),
                    settle_delay: params.settle_delay,
                    cancel_after: None,
                    expiration: None,
                    source_tag: Some(params.source_tag),
                };
                self.channels.lock().expect("dummy ledger lock poisoned").insert(id, entry);
                self.validated.lock().expect("dummy ledger lock poisoned").push(TxEvent {
                    account: address,
                    source_tag: Some(params.source_tag),
                    engine_result: "tesSUCCESS".to_string(),
                    hash,
                    channel_id: Some(id),
                });
                self.creates.lock().expect("dummy ledger lock poisoned").push(params);
            }
            TxPayload::Fund { address, params } => {
                let mut channels = self.channels.lock().expect("dummy ledger lock poisoned");
                if let Some(entry) = channels.get_mut(&params.channel) {
                    entry.amount = entry.amount.checked_add(params.amount).unwrap_or(entry.amount);
                }
                drop(channels);
                self.validated.lock().expect("dummy ledger lock poisoned").push(TxEvent {
                    account: address,
                    source_tag: Some(params.source_tag),
                    engine_result: "tesSUCCESS".to_string(),
                    hash,
                    channel_id: Some(params.channel),
                });
                self.funds.lock().expect("dummy ledger lock poisoned").push(params);
            }
            TxPayload::Claim { address, params } => {
                let mut channels = self.channels.lock().expect("dummy ledger lock poisoned");
                if let Some(entry) = channels.get_mut(&params.channel) {
                    if let Some(balance) = params.balance {
                        if balance > entry.balance {
                            entry.balance = balance;
                        }
                    }
                }
                drop(channels);
                self.validated.lock().expect("dummy ledger lock poisoned").push(TxEvent {
                    account: address,
                    source_tag: Some(params.source_tag),
                    engine_result: "tesSUCCESS".to_string(),
                    hash,
                    channel_id: None,
                });
                self.claims.lock().expect("dummy ledger lock poisoned").push(params);
            }
        }
    }
}

#[async_trait]
impl LedgerClient for DummyLedger {
    async fn connect(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn get_payment_channel(&self, id: &ChannelId) -> Result<PaychanEntry, LedgerError> {
        self.channel(id).ok_or(LedgerError::EntryNotFound)
    }

    async fn get_fee(&self) -> Result<DropAmount, LedgerError> {
        Ok(*self.fee.lock().expect("dummy ledger lock poisoned"))
    }

    async fn prepare_channel_create(
        &self,
        address: &str,
        params: &ChannelCreateParams,
    ) -> Result<String, LedgerError> {
        let payload = TxPayload::Create { address: address.to_string(), params: params.clone() };
        serde_json::to_string(&payload).map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn prepare_channel_fund(
        &self,
        address: &str,
        params: &ChannelFundParams,
    ) -> Result<String, LedgerError> {
        let payload = TxPayload::Fund { address: address.to_string(), params: params.clone() };
        serde_json::to_string(&payload).map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn prepare_channel_claim(
        &self,
        address: &str,
        params: &ChannelClaimParams,
    ) -> Result<String, LedgerError> {
        let payload = TxPayload::Claim { address: address.to_string(), params: params.clone() };
        serde_json::to_string(&payload).map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn sign(&self, tx_json: &str, _secret: &str) -> Result<SignedLedgerTx, LedgerError> {
        let mut hasher = Sha256::new();
        hasher.update(tx_json.as_bytes());
        let id = hex::encode_upper(&hasher.finalize()[..16]);
        Ok(SignedLedgerTx { id, blob: tx_json.to_string() })
    }

    async fn submit(&self, tx_blob: &str) -> Result<(), LedgerError> {
        self.submit_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.fail_next_submit.lock().expect("dummy ledger lock poisoned").take() {
            return Err(err);
        }
        let payload: TxPayload =
            serde_json::from_str(tx_blob).map_err(|e| LedgerError::Rpc(format!("unparseable blob: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(tx_blob.as_bytes());
        let hash = hex::encode_upper(&hasher.finalize()[..16]);
        self.apply(payload, hash);
        Ok(())
    }

    async fn wait_for_validated(&self, address: &str, source_tag: u32) -> Result<TxEvent, LedgerError> {
        let mut validated = self.validated.lock().expect("dummy ledger lock poisoned");
        let position = validated
            .iter()
            .position(|event| event.account == address && event.source_tag == Some(source_tag));
        match position {
            Some(i) => Ok(validated.remove(i)),
            None => Err(LedgerError::Timeout),
        }
    }
}
