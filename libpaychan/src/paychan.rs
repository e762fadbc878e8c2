use crate::amount::DropAmount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform minimum settle delay (seconds) a channel must grant the server
/// to submit its best claim after a close request.
pub const MIN_SETTLE_DELAY: u32 = 3600;

/// Ledger state of a payment channel as returned by the ledger client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaychanEntry {
    /// Source address that escrowed the funds.
    pub account: String,
    /// Beneficiary address.
    pub destination: String,
    /// Total escrowed amount.
    pub amount: DropAmount,
    /// Amount already paid out on-ledger through submitted claims.
    pub balance: DropAmount,
    /// Channel public key in ledger form (`ED` + uppercase hex).
    pub public_key: String,
    /// Seconds the channel stays claimable after a close request.
    pub settle_delay: u32,
    /// Absolute unix time after which the channel can be cancelled.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cancel_after: Option<u64>,
    /// Absolute unix time of a pending close, if one was requested.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expiration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_tag: Option<u32>,
}

#[derive(Debug, Error)]
pub enum PaychanError {
    #[error("settle delay of incoming payment channel too low: got {actual}, minimum {minimum}")]
    SettleDelayTooLow { actual: u32, minimum: u32 },
    #[error("channel has a cancelAfter and cannot be accepted")]
    HasCancelAfter,
    #[error("channel is closing")]
    Closing,
    #[error("channel destination is {actual}, expected {expected}")]
    WrongDestination { actual: String, expected: String },
}

/// Rules every adopted channel must satisfy, both on first binding and on
/// every refresh from the ledger.
pub fn validate_paychan(entry: &PaychanEntry, server_address: &str) -> Result<(), PaychanError> {
    if entry.settle_delay < MIN_SETTLE_DELAY {
        return Err(PaychanError::SettleDelayTooLow {
            actual: entry.settle_delay,
            minimum: MIN_SETTLE_DELAY,
        });
    }
    if entry.cancel_after.is_some() {
        return Err(PaychanError::HasCancelAfter);
    }
    if entry.expiration.is_some() {
        return Err(PaychanError::Closing);
    }
    if entry.destination != server_address {
        return Err(PaychanError::WrongDestination {
            actual: entry.destination.clone(),
            expected: server_address.to_string(),
        });
    }
    Ok(())
}
