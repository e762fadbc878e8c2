use crate::ledger::data_objects::{ChannelClaimParams, ChannelCreateParams, ChannelFundParams, TxEvent};
use crate::ledger::error::{LedgerError, SubmitError};
use crate::ledger::traits::LedgerClient;
use log::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const MAX_ATTEMPTS: u32 = 4;
const RETRY_BASE: Duration = Duration::from_millis(500);

enum TxParams {
    Create(ChannelCreateParams),
    Fund(ChannelFundParams),
    Claim(ChannelClaimParams),
}

/// Serializes on-ledger transactions for one (address, secret) pair.
///
/// Each submission runs prepare → sign → submit → await-validated under a
/// single async lock, retrying transient failures with backoff and
/// propagating terminal ones.
pub struct TxSubmitter {
    ledger: Arc<dyn LedgerClient>,
    address: String,
    secret: String,
    serial: tokio::sync::Mutex<()>,
    next_tag: AtomicU32,
}

impl TxSubmitter {
    pub fn new(ledger: Arc<dyn LedgerClient>, address: impl Into<String>, secret: impl Into<String>) -> Self {
        TxSubmitter {
            ledger,
            address: address.into(),
            secret: secret.into(),
            serial: tokio::sync::Mutex::new(()),
            next_tag: AtomicU32::new(1),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn create_channel(&self, mut params: ChannelCreateParams) -> Result<TxEvent, SubmitError> {
        params.source_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.run(TxParams::Create(params)).await
    }

    pub async fn fund_channel(&self, mut params: ChannelFundParams) -> Result<TxEvent, SubmitError> {
        params.source_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.run(TxParams::Fund(params)).await
    }

    pub async fn claim_channel(&self, mut params: ChannelClaimParams) -> Result<TxEvent, SubmitError> {
        params.source_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.run(TxParams::Claim(params)).await
    }

    async fn run(&self, params: TxParams) -> Result<TxEvent, SubmitError> {
        let _guard = self.serial.lock().await;
        let mut last = LedgerError::Timeout;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                sleep(RETRY_BASE * attempt).await;
            }
            match self.attempt(&params).await {
                Ok(event) if event.succeeded() => return Ok(event),
                Ok(event) if event.engine_result.starts_with("tem") => {
                    return Err(SubmitError::Terminal(event.engine_result));
                }
                Ok(event) => {
                    warn!("transaction validated with result {}, retrying", event.engine_result);
                    last = LedgerError::Rpc(format!("engine result {}", event.engine_result));
                }
                Err(LedgerError::Terminal(msg)) => return Err(SubmitError::Terminal(msg)),
                Err(e) if e.is_transient() => {
                    warn!("transient submission failure (attempt {}): {e}", attempt + 1);
                    last = e;
                }
                Err(e) => return Err(SubmitError::Terminal(e.to_string())),
            }
        }
        Err(SubmitError::RetriesExhausted { attempts: MAX_ATTEMPTS, last })
    }

    async fn attempt(&self, params: &TxParams) -> Result<TxEvent, LedgerError> {
        let (tx_json, tag) = match params {
            TxParams::Create(p) => (self.ledger.prepare_channel_create(&self.address, p).await?, p.source_tag),
            TxParams::Fund(p) => (self.ledger.prepare_channel_fund(&self.address, p).await?, p.source_tag),
            TxParams::Claim(p) => (self.ledger.prepare_channel_claim(&self.address, p).await?, p.source_tag),
        };
        let signed = self.ledger.sign(&tx_json, &self.secret).await?;
        self.ledger.submit(&signed.blob).await?;
        let event = self.ledger.wait_for_validated(&self.address, tag).await?;
        debug!("transaction {} validated with {}", event.hash, event.engine_result);
        Ok(event)
    }
}
