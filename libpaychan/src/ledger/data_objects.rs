use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use serde::{Deserialize, Serialize};

/// Parameters of a `PaymentChannelCreate` transaction, used to open or top
/// up the server's channel to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCreateParams {
    pub amount: DropAmount,
    pub destination: String,
    pub settle_delay: u32,
    /// Ledger form of the channel key (`ED` + uppercase hex).
    pub public_key: String,
    /// Filled in by the submitter so the validated event can be matched.
    pub source_tag: u32,
}

impl ChannelCreateParams {
    pub fn new(amount: DropAmount, destination: impl Into<String>, settle_delay: u32, public_key: String) -> Self {
        ChannelCreateParams {
            amount,
            destination: destination.into(),
            settle_delay,
            public_key,
            source_tag: 0,
        }
    }
}

/// Parameters of a `PaymentChannelFund` transaction topping up an existing
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFundParams {
    pub channel: ChannelId,
    pub amount: DropAmount,
    pub source_tag: u32,
}

/// Parameters of a `PaymentChannelClaim` transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClaimParams {
    pub channel: ChannelId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub balance: Option<DropAmount>,
    /// Uppercase hex claim signature, as the ledger expects it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_key: Option<String>,
    pub close: bool,
    pub source_tag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLedgerTx {
    pub id: String,
    pub blob: String,
}

/// A validated transaction event from the ledger stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEvent {
    pub account: String,
    pub source_tag: Option<u32>,
    pub engine_result: String,
    pub hash: String,
    /// For channel creates, the id of the channel the transaction produced.
    pub channel_id: Option<ChannelId>,
}

impl TxEvent {
    pub fn succeeded(&self) -> bool {
        self.engine_result == "tesSUCCESS"
    }
}
