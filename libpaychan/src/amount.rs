use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub const DROPS_PER_XRP: u64 = 1_000_000;

/// Exponent of the drop relative to one XRP. Accounts may negotiate a
/// different base-unit scale; conversions below bridge the two.
pub const XRP_SCALE: u8 = 6;

/// An amount of XRP in drops, the smallest indivisible unit on the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DropAmount {
    drops: u64,
}

impl DropAmount {
    pub const ZERO: DropAmount = DropAmount { drops: 0 };

    pub fn from_drops(drops: u64) -> Self {
        DropAmount { drops }
    }

    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Parses a decimal string of whole XRP units, e.g. `"1.25"`.
    /// Returns `None` for malformed input or more than 6 decimal places.
    pub fn from_xrp(xrp: &str) -> Option<Self> {
        let mut parts = xrp.split('.');
        let whole = parts.next()?.parse::<u64>().ok()?;
        let fraction = if let Some(frac_str) = parts.next() {
            if parts.next().is_some() {
                return None;
            }
            if frac_str.is_empty() || frac_str.len() > 6 {
                return None;
            }
            let mut padded = frac_str.to_string();
            while padded.len() < 6 {
                padded.push('0');
            }
            padded.parse::<u64>().ok()?
        } else {
            0
        };
        let drops = whole.checked_mul(DROPS_PER_XRP)?.checked_add(fraction)?;
        Some(DropAmount { drops })
    }

    /// Renders the amount as a decimal XRP string, the format the ledger API
    /// expects for channel amounts, e.g. `16 drops -> "0.000016"`.
    pub fn to_xrp_string(&self) -> String {
        let whole = self.drops / DROPS_PER_XRP;
        let fraction = self.drops % DROPS_PER_XRP;
        if fraction == 0 {
            format!("{whole}")
        } else {
            let frac = format!("{fraction:06}");
            format!("{whole}.{}", frac.trim_end_matches('0'))
        }
    }

    /// Converts an amount in base units of the given scale to drops,
    /// rounding up. Used on the outgoing claim path so repeated signings
    /// never drift more than one drop below the ideal value.
    pub fn from_base_ceil(amount: u64, scale: u8) -> Option<Self> {
        if scale >= XRP_SCALE {
            let div = 10u128.checked_pow(u32::from(scale - XRP_SCALE))?;
            let drops = (u128::from(amount) + div - 1) / div;
            u64::try_from(drops).ok().map(DropAmount::from_drops)
        } else {
            let mul = 10u64.checked_pow(u32::from(XRP_SCALE - scale))?;
            amount.checked_mul(mul).map(DropAmount::from_drops)
        }
    }

    /// Converts drops into base units of the given scale, rounding down.
    /// Used for capacity checks, where under-counting what the channel can
    /// hold is the safe direction.
    pub fn to_base_floor(&self, scale: u8) -> Option<u64> {
        if scale >= XRP_SCALE {
            let mul = 10u64.checked_pow(u32::from(scale - XRP_SCALE))?;
            self.drops.checked_mul(mul)
        } else {
            let div = 10u64.checked_pow(u32::from(XRP_SCALE - scale))?;
            Some(self.drops / div)
        }
    }

    /// Converts drops into base units of the given scale, rounding up.
    /// Used for fees, where under-counting the cost is the unsafe direction.
    pub fn to_base_ceil(&self, scale: u8) -> Option<u64> {
        if scale >= XRP_SCALE {
            self.to_base_floor(scale)
        } else {
            let div = 10u64.checked_pow(u32::from(XRP_SCALE - scale))?;
            Some(self.drops.div_ceil(div))
        }
    }

    pub fn checked_add(&self, other: DropAmount) -> Option<DropAmount> {
        self.drops.checked_add(other.drops).map(DropAmount::from_drops)
    }

    pub fn checked_sub(&self, other: DropAmount) -> Option<DropAmount> {
        self.drops.checked_sub(other.drops).map(DropAmount::from_drops)
    }

    pub fn saturating_sub(&self, other: DropAmount) -> DropAmount {
        DropAmount::from_drops(self.drops.saturating_sub(other.drops))
    }
}

impl Display for DropAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.drops)
    }
}
