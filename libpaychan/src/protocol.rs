use crate::channel_id::ChannelId;
use crate::claim::SignedClaim;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sub-protocol names recognized by the dispatcher.
pub mod names {
    pub const INFO: &str = "info";
    pub const LAST_CLAIM: &str = "last_claim";
    pub const CHANNEL: &str = "channel";
    pub const CHANNEL_SIGNATURE: &str = "channel_signature";
    pub const FUND_CHANNEL: &str = "fund_channel";
    pub const ILP: &str = "ilp";
    pub const CLAIM: &str = "claim";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    ApplicationOctetStream,
    TextPlainUtf8,
    ApplicationJson,
}

/// One named sub-protocol entry of a peer message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProtocol {
    pub name: String,
    pub content_type: ContentType,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub data: Vec<u8>,
}

impl SubProtocol {
    pub fn octets(name: &str, data: Vec<u8>) -> Self {
        SubProtocol { name: name.to_string(), content_type: ContentType::ApplicationOctetStream, data }
    }

    pub fn text(name: &str, data: impl Into<String>) -> Self {
        SubProtocol { name: name.to_string(), content_type: ContentType::TextPlainUtf8, data: data.into().into_bytes() }
    }

    pub fn json<T: Serialize>(name: &str, value: &T) -> Self {
        let data = serde_json::to_vec(value).expect("sub-protocol records serialize infallibly");
        SubProtocol { name: name.to_string(), content_type: ContentType::ApplicationJson, data }
    }

    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.data).map_err(|_| ProtocolError::NotText(self.name.clone()))
    }

    pub fn parse_json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.data).map_err(|e| ProtocolError::BadJson { name: self.name.clone(), error: e.to_string() })
    }
}

/// A peer message: a list of named sub-protocols, examined independently by
/// the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub protocols: Vec<SubProtocol>,
}

impl Message {
    pub fn new(protocols: Vec<SubProtocol>) -> Self {
        Message { protocols }
    }

    pub fn get(&self, name: &str) -> Option<&SubProtocol> {
        self.protocols.iter().find(|p| p.name == name)
    }

    /// The settlement transfer payload: a signed claim under the `claim`
    /// sub-protocol.
    pub fn claim_transfer(claim: &SignedClaim) -> Self {
        Message::new(vec![SubProtocol::json(names::CLAIM, claim)])
    }

    /// Unsolicited notification that the server's channel to the peer
    /// changed (created or topped up).
    pub fn channel_notification(channel: &ChannelId) -> Self {
        Message::new(vec![SubProtocol::text(names::CHANNEL, channel.to_hex())])
    }
}

/// The `info` reply record. Channel ids are revealed only once the account
/// has advanced far enough for them to be binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoRecord {
    pub address: String,
    pub account: String,
    pub currency_scale: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_channel: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("sub-protocol {0} does not carry text data")]
    NotText(String),
    #[error("sub-protocol {name} carries invalid JSON: {error}")]
    BadJson { name: String, error: String },
    #[error("message carries no sub-protocol this server understands")]
    NoKnownProtocol,
    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_finds_by_name() {
        let msg = Message::new(vec![
            SubProtocol::text(names::FUND_CHANNEL, "rPEERxxx"),
            SubProtocol::octets(names::ILP, vec![12, 0]),
        ]);
        assert_eq!(msg.get(names::ILP).unwrap().data, vec![12, 0]);
        assert!(msg.get(names::CHANNEL).is_none());
    }

    #[test]
    fn claim_transfer_carries_claim_json() {
        let claim = SignedClaim { amount: 133, signature: vec![1; 64] };
        let msg = Message::claim_transfer(&claim);
        let proto = msg.get(names::CLAIM).unwrap();
        assert_eq!(proto.content_type, ContentType::ApplicationJson);
        let parsed: SignedClaim = proto.parse_json().unwrap();
        assert_eq!(parsed, claim);
    }

    #[test]
    fn info_record_hides_absent_channels() {
        let info = InfoRecord {
            address: "rSERVER".into(),
            account: "test.server.alice".into(),
            currency_scale: 6,
            channel: None,
            client_channel: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("channel"));
        assert!(json.contains("currencyScale"));
    }
}
