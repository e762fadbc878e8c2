use std::fmt::{Debug, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const TYPE_PREPARE: u8 = 12;
pub const TYPE_FULFILL: u8 = 13;
pub const TYPE_REJECT: u8 = 14;

/// Destination address of the in-band config exchange (ILDCP).
pub const PEER_CONFIG_DESTINATION: &str = "peer.config";

/// ILP error codes the core emits.
pub mod codes {
    /// The packet could not be parsed.
    pub const F01_INVALID_PACKET: &str = "F01";
    /// Unreachable: no channel, or account blocked.
    pub const F02_UNREACHABLE: &str = "F02";
    /// Packet exceeds the per-packet maximum.
    pub const F08_AMOUNT_TOO_LARGE: &str = "F08";
    /// The data handler did not answer before the packet expired.
    pub const R00_TRANSFER_TIMED_OUT: &str = "R00";
    /// Internal failure while relaying.
    pub const T00_INTERNAL_ERROR: &str = "T00";
    /// Insufficient bandwidth or channel escrow.
    pub const T04_INSUFFICIENT_LIQUIDITY: &str = "T04";
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("unexpected end of packet")]
    Truncated,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("invalid length prefix")]
    BadLength,
    #[error("invalid timestamp")]
    BadTimestamp,
    #[error("field is not valid utf-8")]
    BadText,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Prepare {
    pub amount: u64,
    pub expires_at: SystemTime,
    pub execution_condition: [u8; 32],
    pub destination: String,
    pub data: Vec<u8>,
}

impl Debug for Prepare {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepare")
            .field("amount", &self.amount)
            .field("destination", &self.destination)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfill {
    pub fulfillment: [u8; 32],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub code: String,
    pub triggered_by: String,
    pub message: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let (type_byte, body) = match self {
            Packet::Prepare(p) => (TYPE_PREPARE, encode_prepare(p)),
            Packet::Fulfill(f) => (TYPE_FULFILL, encode_fulfill(f)),
            Packet::Reject(r) => (TYPE_REJECT, encode_reject(r)),
        };
        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(type_byte);
        write_var_len(&mut out, body.len());
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Packet, PacketError> {
        let mut r = Reader::new(raw);
        let type_byte = r.u8()?;
        let body = r.var_octets()?;
        let mut r = Reader::new(body);
        match type_byte {
            TYPE_PREPARE => {
                let amount = r.u64()?;
                let expires_at = parse_timestamp(r.take(17)?)?;
                let mut execution_condition = [0u8; 32];
                execution_condition.copy_from_slice(r.take(32)?);
                let destination = r.var_text()?;
                let data = r.var_octets()?.to_vec();
                Ok(Packet::Prepare(Prepare { amount, expires_at, execution_condition, destination, data }))
            }
            TYPE_FULFILL => {
                let mut fulfillment = [0u8; 32];
                fulfillment.copy_from_slice(r.take(32)?);
                let data = r.var_octets()?.to_vec();
                Ok(Packet::Fulfill(Fulfill { fulfillment, data }))
            }
            TYPE_REJECT => {
                let code = String::from_utf8(r.take(3)?.to_vec()).map_err(|_| PacketError::BadText)?;
                let triggered_by = r.var_text()?;
                let message = r.var_text()?;
                let data = r.var_octets()?.to_vec();
                Ok(Packet::Reject(Reject { code, triggered_by, message, data }))
            }
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

impl Reject {
    pub fn new(code: &str, triggered_by: &str, message: impl Into<String>) -> Self {
        Reject {
            code: code.to_string(),
            triggered_by: triggered_by.to_string(),
            message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Data payload of an F08 reject: the received and maximum amounts,
/// big-endian, so the sender can right-size its retry.
pub fn amount_too_large_data(received: u64, maximum: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&received.to_be_bytes());
    out.extend_from_slice(&maximum.to_be_bytes());
    out
}

/// Data payload of the FULFILL answering a `peer.config` PREPARE: the
/// client's ILP address, the negotiated scale and the asset code.
pub fn ildcp_response(client_address: &str, asset_scale: u8, asset_code: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_var_len(&mut out, client_address.len());
    out.extend_from_slice(client_address.as_bytes());
    out.push(asset_scale);
    write_var_len(&mut out, asset_code.len());
    out.extend_from_slice(asset_code.as_bytes());
    out
}

fn encode_prepare(p: &Prepare) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&p.amount.to_be_bytes());
    out.extend_from_slice(&format_timestamp(p.expires_at));
    out.extend_from_slice(&p.execution_condition);
    write_var_len(&mut out, p.destination.len());
    out.extend_from_slice(p.destination.as_bytes());
    write_var_len(&mut out, p.data.len());
    out.extend_from_slice(&p.data);
    out
}

fn encode_fulfill(f: &Fulfill) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&f.fulfillment);
    write_var_len(&mut out, f.data.len());
    out.extend_from_slice(&f.data);
    out
}

fn encode_reject(r: &Reject) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(r.code.as_bytes());
    write_var_len(&mut out, r.triggered_by.len());
    out.extend_from_slice(r.triggered_by.as_bytes());
    write_var_len(&mut out, r.message.len());
    out.extend_from_slice(r.message.as_bytes());
    write_var_len(&mut out, r.data.len());
    out.extend_from_slice(&r.data);
    out
}

fn write_var_len(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        let bytes = (len as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (8 - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Reader { raw, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.pos + n > self.raw.len() {
            return Err(PacketError::Truncated);
        }
        let out = &self.raw[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, PacketError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    fn var_octets(&mut self) -> Result<&'a [u8], PacketError> {
        let first = self.u8()?;
        let len = if first < 128 {
            usize::from(first)
        } else {
            let len_of_len = usize::from(first & 0x7f);
            if len_of_len == 0 || len_of_len > 8 {
                return Err(PacketError::BadLength);
            }
            let mut bytes = [0u8; 8];
            bytes[8 - len_of_len..].copy_from_slice(self.take(len_of_len)?);
            usize::try_from(u64::from_be_bytes(bytes)).map_err(|_| PacketError::BadLength)?
        };
        self.take(len)
    }

    fn var_text(&mut self) -> Result<String, PacketError> {
        String::from_utf8(self.var_octets()?.to_vec()).map_err(|_| PacketError::BadText)
    }
}

// ---- interledger timestamps: 17 ASCII digits, YYYYMMDDHHMMSSmmm in UTC ----

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from(if m > 2 { m - 3 } else { m + 9 });
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

pub fn format_timestamp(t: SystemTime) -> [u8; 17] {
    let millis = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64;
    let (days, rem_ms) = (millis / 86_400_000, millis % 86_400_000);
    let (year, month, day) = civil_from_days(days as i64);
    let (hour, rem) = (rem_ms / 3_600_000, rem_ms % 3_600_000);
    let (minute, rem) = (rem / 60_000, rem % 60_000);
    let (second, milli) = (rem / 1000, rem % 1000);
    let text = format!("{year:04}{month:02}{day:02}{hour:02}{minute:02}{second:02}{milli:03}");
    let mut out = [0u8; 17];
    out.copy_from_slice(text.as_bytes());
    out
}

pub fn parse_timestamp(raw: &[u8]) -> Result<SystemTime, PacketError> {
    if raw.len() != 17 || !raw.iter().all(u8::is_ascii_digit) {
        return Err(PacketError::BadTimestamp);
    }
    let text = std::str::from_utf8(raw).map_err(|_| PacketError::BadTimestamp)?;
    let num = |range: std::ops::Range<usize>| text[range].parse::<u64>().map_err(|_| PacketError::BadTimestamp);
    let (year, month, day) = (num(0..4)?, num(4..6)?, num(6..8)?);
    let (hour, minute, second, milli) = (num(8..10)?, num(10..12)?, num(12..14)?, num(14..17)?);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 59 {
        return Err(PacketError::BadTimestamp);
    }
    let days = days_from_civil(year as i64, month as u32, day as u32);
    if days < 0 {
        return Err(PacketError::BadTimestamp);
    }
    let millis = days as u64 * 86_400_000 + hour * 3_600_000 + minute * 60_000 + second * 1000 + milli;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}
