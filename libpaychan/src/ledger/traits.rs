use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use crate::ledger::data_objects::{ChannelClaimParams, ChannelCreateParams, ChannelFundParams, SignedLedgerTx, TxEvent};
use crate::ledger::error::LedgerError;
use crate::paychan::PaychanEntry;
use async_trait::async_trait;

/// The XRP ledger client consumed by the core. Implementations talk to a
/// rippled endpoint; [`DummyLedger`](crate::ledger::DummyLedger) provides an
/// in-memory stand-in for tests and embedding.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn connect(&self) -> Result<(), LedgerError>;

    async fn disconnect(&self) -> Result<(), LedgerError>;

    async fn get_payment_channel(&self, id: &ChannelId) -> Result<PaychanEntry, LedgerError>;

    /// Current open-ledger network fee.
    async fn get_fee(&self) -> Result<DropAmount, LedgerError>;

    /// Returns the unsigned transaction JSON.
    async fn prepare_channel_create(&self, address: &str, params: &ChannelCreateParams)
        -> Result<String, LedgerError>;

    async fn prepare_channel_fund(&self, address: &str, params: &ChannelFundParams)
        -> Result<String, LedgerError>;

    async fn prepare_channel_claim(&self, address: &str, params: &ChannelClaimParams)
        -> Result<String, LedgerError>;

    async fn sign(&self, tx_json: &str, secret: &str) -> Result<SignedLedgerTx, LedgerError>;

    async fn submit(&self, tx_blob: &str) -> Result<(), LedgerError>;

    /// Resolves once a validated transaction for `address` carrying
    /// `source_tag` appears on the ledger stream.
    async fn wait_for_validated(&self, address: &str, source_tag: u32) -> Result<TxEvent, LedgerError>;
}
