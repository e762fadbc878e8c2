use serde::{Deserialize, Deserializer};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_SCALE: u8 = 6;
pub const DEFAULT_MAX_FEE_PERCENT: f64 = 0.01;
pub const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// The server's XRP signing secret. Redacted in debug output and wiped on
/// drop; only the submitter and the channel-key derivation read it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct XrpSecret(String);

impl XrpSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        XrpSecret(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for XrpSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XrpSecret")
    }
}

impl<'de> Deserialize<'de> for XrpSecret {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        Ok(XrpSecret(String::deserialize(de)?))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("either assetScale or currencyScale may be set, not both")]
    BothScales,
    #[error("maxFeePercent must lie in (0, 1], got {0}")]
    BadFeePercent(f64),
}

/// Options the host hands the plugin. Field names follow the host-facing
/// camelCase convention when loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Ledger RPC endpoint.
    pub xrp_server: String,
    /// The server's XRP account.
    pub address: String,
    pub secret: XrpSecret,
    /// ILP address prefix of this server; an account's full address is
    /// `<ilp_address>.<account_id>`.
    pub ilp_address: String,
    #[serde(default)]
    pub asset_scale: Option<u8>,
    #[serde(default)]
    pub currency_scale: Option<u8>,
    /// Unsecured-liability ceiling per account (`bandwidth` is the older
    /// name for the same knob).
    #[serde(default)]
    pub max_balance: Option<u64>,
    #[serde(default)]
    pub bandwidth: Option<u64>,
    #[serde(default)]
    pub max_packet_amount: Option<u64>,
    #[serde(default)]
    pub max_fee_percent: Option<f64>,
    #[serde(default)]
    pub claim_interval_ms: Option<u64>,
}

impl PluginConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.asset_scale.is_some() && self.currency_scale.is_some() {
            return Err(ConfigError::BothScales);
        }
        let fee = self.fee_percent();
        if !(fee > 0.0 && fee <= 1.0) {
            return Err(ConfigError::BadFeePercent(fee));
        }
        Ok(())
    }

    pub fn scale(&self) -> u8 {
        self.asset_scale.or(self.currency_scale).unwrap_or(DEFAULT_SCALE)
    }

    /// Maximum amount the server advances without a fresh covering claim.
    /// Zero (the default) means every packet must already be secured.
    pub fn bandwidth(&self) -> u64 {
        self.max_balance.or(self.bandwidth).unwrap_or(0)
    }

    pub fn max_packet_amount(&self) -> u64 {
        self.max_packet_amount.unwrap_or(u64::MAX)
    }

    pub fn fee_percent(&self) -> f64 {
        self.max_fee_percent.unwrap_or(DEFAULT_MAX_FEE_PERCENT)
    }

    pub fn claim_interval(&self) -> Duration {
        self.claim_interval_ms.map(Duration::from_millis).unwrap_or(DEFAULT_CLAIM_INTERVAL)
    }
}
