use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display};
use std::str::FromStr;
use thiserror::Error;

/// Ledger identifier of a payment channel: 32 bytes, hex-encoded on the wire
/// and in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; 32]);

#[derive(Debug, Error)]
pub enum ChannelIdError {
    #[error("channel id must be 64 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("channel id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl ChannelId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        ChannelId(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ChannelIdError> {
        if s.len() != 64 {
            return Err(ChannelIdError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(ChannelId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Uppercase form used when addressing the ledger.
    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelId({})", self.to_hex())
    }
}

impl FromStr for ChannelId {
    type Err = ChannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelId::from_hex(s)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(de)?;
        ChannelId::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}
