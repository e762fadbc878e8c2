use serde::{Deserialize, Deserializer, Serialize};

pub fn to_hex<S>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    hex::encode(bytes).serialize(s)
}

pub fn from_hex<'de, D>(de: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str = String::deserialize(de)?;
    hex::decode(hex_str).map_err(|e| serde::de::Error::custom(format!("Invalid hex string: {e}")))
}

/// Serde adapter for u64 fields carried as decimal strings on the wire,
/// which is how claim and info amounts travel between peers.
pub mod string_u64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &u64, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_string().serialize(s)
    }

    pub fn deserialize<'de, D>(de: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(de)?;
        raw.parse::<u64>().map_err(|e| serde::de::Error::custom(format!("Invalid amount string: {e}")))
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wire {
        #[serde(with = "super::string_u64")]
        amount: u64,
    }

    #[test]
    fn amounts_travel_as_strings() {
        let json = serde_json::to_string(&Wire { amount: 12345 }).unwrap();
        assert_eq!(json, r#"{"amount":"12345"}"#);
        let back: Wire = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, 12345);
        assert!(serde_json::from_str::<Wire>(r#"{"amount":"12x"}"#).is_err());
    }
}
