use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Domain prefix of the canonical claim encoding signed by both sides.
const CLAIM_PREFIX: &[u8; 4] = b"CLM\0";

/// Domain prefix of the channel-ownership proof a client signs when binding
/// its channel to an account.
const CHANNEL_PROOF_PREFIX: &[u8] = b"channel_signature";

/// Domain separator for deriving per-account channel signing keys from the
/// server's XRP secret.
const CHANNEL_KEY_DOMAIN: &[u8] = b"paychan-hub-channel-keys";

/// The ledger prefixes ed25519 channel public keys with this byte pair
/// (hex `ED`).
const LEDGER_KEY_PREFIX: &str = "ED";

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("claim has no signature")]
    MissingSignature,
    #[error("Invalid claim: invalid signature")]
    InvalidSignature,
    #[error("Invalid claim: claim amount {claimed} exceeds channel balance {escrow}")]
    ExceedsChannelBalance { claimed: u64, escrow: u64 },
    #[error("invalid channel public key: {0}")]
    InvalidPublicKey(String),
    #[error("claim amount does not fit the channel scale")]
    AmountOverflow,
    #[error("no incoming channel is bound to this account")]
    NoChannel,
}

/// A signed off-ledger claim as it travels in the `claim` and `last_claim`
/// sub-protocols: an amount in the account's base units and an ed25519
/// signature over the canonical drop encoding. `amount = 0` with an empty
/// signature means no claim has been received yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedClaim {
    #[serde(with = "crate::helpers::string_u64")]
    pub amount: u64,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub signature: Vec<u8>,
}

impl SignedClaim {
    pub fn zero() -> Self {
        SignedClaim { amount: 0, signature: Vec::new() }
    }

    pub fn has_signature(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// Canonical byte encoding of a claim: prefix, channel id, drop amount
/// big-endian. This is the exact message both sides sign and verify.
pub fn encode_claim(channel: &ChannelId, amount: DropAmount) -> [u8; 44] {
    let mut out = [0u8; 44];
    out[..4].copy_from_slice(CLAIM_PREFIX);
    out[4..36].copy_from_slice(channel.as_bytes());
    out[36..].copy_from_slice(&amount.drops().to_be_bytes());
    out
}

/// Byte encoding of the channel-ownership proof: prefix, channel id, and the
/// full ILP address of the account the channel is being bound to.
pub fn encode_channel_proof(channel: &ChannelId, full_address: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHANNEL_PROOF_PREFIX.len() + 32 + full_address.len());
    out.extend_from_slice(CHANNEL_PROOF_PREFIX);
    out.extend_from_slice(channel.as_bytes());
    out.extend_from_slice(full_address.as_bytes());
    out
}

/// Derives the ed25519 key the server uses to sign outgoing claims for one
/// account: `HMAC-SHA256(secret, domain || account_id)`. Deterministic, so a
/// restarted server keeps signing against the same client channel key.
pub fn derive_channel_key(secret: &str, account_id: &str) -> SigningKey {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(CHANNEL_KEY_DOMAIN);
    mac.update(account_id.as_bytes());
    let seed = Zeroizing::new(<[u8; 32]>::from(mac.finalize().into_bytes()));
    SigningKey::from_bytes(&seed)
}

/// The ledger representation of a signing key's public half: `ED` followed by
/// the uppercase hex key bytes.
pub fn ledger_public_key(key: &SigningKey) -> String {
    format!("{LEDGER_KEY_PREFIX}{}", hex::encode_upper(key.verifying_key().to_bytes()))
}

/// Parses a channel public key as reported by the ledger, stripping the
/// two-character `ED` prefix.
pub fn parse_ledger_public_key(raw: &str) -> Result<VerifyingKey, ClaimError> {
    let hex_part = raw
        .strip_prefix(LEDGER_KEY_PREFIX)
        .or_else(|| raw.strip_prefix("ed"))
        .ok_or_else(|| ClaimError::InvalidPublicKey(format!("missing ED prefix: {raw}")))?;
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hex_part, &mut bytes).map_err(|e| ClaimError::InvalidPublicKey(e.to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| ClaimError::InvalidPublicKey(e.to_string()))
}

pub fn sign_claim(key: &SigningKey, channel: &ChannelId, amount: DropAmount) -> Vec<u8> {
    key.sign(&encode_claim(channel, amount)).to_bytes().to_vec()
}

pub fn verify_claim(
    key: &VerifyingKey,
    channel: &ChannelId,
    amount: DropAmount,
    signature: &[u8],
) -> Result<(), ClaimError> {
    let signature = Signature::from_slice(signature).map_err(|_| ClaimError::InvalidSignature)?;
    key.verify(&encode_claim(channel, amount), &signature).map_err(|_| ClaimError::InvalidSignature)
}

pub fn verify_channel_proof(
    key: &VerifyingKey,
    channel: &ChannelId,
    full_address: &str,
    signature: &[u8],
) -> Result<(), ClaimError> {
    let signature = Signature::from_slice(signature).map_err(|_| ClaimError::InvalidSignature)?;
    key.verify(&encode_channel_proof(channel, full_address), &signature)
        .map_err(|_| ClaimError::InvalidSignature)
}
