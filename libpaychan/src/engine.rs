use crate::account::{Account, AccountId};
use crate::amount::DropAmount;
use crate::claim::{self, ClaimError, SignedClaim};
use crate::config::PluginConfig;
use crate::ilp::{self, codes, Prepare};
use log::*;
use thiserror::Error;

/// Escrow a client must have before the server opens a reverse channel.
pub const MIN_INCOMING_CHANNEL_DROPS: u64 = 10_000_000;

/// Amount of each outgoing channel create or top-up, in drops.
pub const OUTGOING_CHANNEL_AMOUNT_DROPS: u64 = 5_000_000;

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("account {account} is blocked: {reason}")]
    Blocked { account: AccountId, reason: String },
    #[error("cannot receive money: account {0} is not ready")]
    NotReady(AccountId),
    #[error("packet size too large: got {received}, max {maximum}")]
    AmountTooLarge { received: u64, maximum: u64 },
    #[error("Insufficient bandwidth, used: {used} max: {max}")]
    InsufficientBandwidth { used: u64, max: u64 },
    #[error("Insufficient funds in incoming channel, have: {have} need: {need}")]
    ExceedsChannelEscrow { have: u64, need: u64 },
}

impl AdmitError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmitError::Blocked { .. } | AdmitError::NotReady(_) => codes::F02_UNREACHABLE,
            AdmitError::AmountTooLarge { .. } => codes::F08_AMOUNT_TOO_LARGE,
            AdmitError::InsufficientBandwidth { .. } | AdmitError::ExceedsChannelEscrow { .. } => {
                codes::T04_INSUFFICIENT_LIQUIDITY
            }
        }
    }

    pub fn data(&self) -> Vec<u8> {
        match self {
            AdmitError::AmountTooLarge { received, maximum } => ilp::amount_too_large_data(*received, *maximum),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("cannot settle: account {0} is not ready")]
    NotReady(AccountId),
    #[error("account {0} has no client channel to settle into")]
    NoClientChannel(AccountId),
    #[error("claim for {need} drops would exceed client channel capacity of {capacity} drops")]
    ExceedsCapacity { need: u64, capacity: u64 },
    #[error("outgoing balance overflow")]
    Overflow,
}

/// Decides whether an incoming PREPARE may be forwarded and, if so, adds its
/// amount to the account's in-flight total. Checks run in order; the first
/// failure wins and nothing is mutated.
pub fn admit_prepare(account: &mut Account, prepare: &Prepare, config: &PluginConfig) -> Result<(), AdmitError> {
    if account.blocked() {
        return Err(AdmitError::Blocked {
            account: account.account_id().clone(),
            reason: account.block_reason().unwrap_or_default(),
        });
    }
    let paychan = match account.incoming_paychan() {
        Some(paychan) if account.is_ready() => paychan,
        _ => return Err(AdmitError::NotReady(account.account_id().clone())),
    };

    let maximum = config.max_packet_amount();
    if prepare.amount > maximum {
        return Err(AdmitError::AmountTooLarge { received: prepare.amount, maximum });
    }

    let new_prepared = u128::from(account.prepared()) + u128::from(prepare.amount);
    let secured = u128::from(account.incoming_claim().amount);
    let unsecured = new_prepared.saturating_sub(secured);
    let bandwidth = config.bandwidth();
    if unsecured > u128::from(bandwidth) {
        return Err(AdmitError::InsufficientBandwidth { used: unsecured as u64, max: bandwidth });
    }

    let capacity = paychan.amount.to_base_floor(config.scale()).unwrap_or(u64::MAX);
    if new_prepared > u128::from(capacity) {
        return Err(AdmitError::ExceedsChannelEscrow { have: capacity, need: new_prepared as u64 });
    }

    account.set_prepared(new_prepared as u64);
    trace!("account {} prepared total is now {new_prepared}", account.account_id());
    Ok(())
}

/// Rolls an admitted PREPARE back after a REJECT. FULFILLed packets stay in
/// the prepared total until the peer's next covering claim absorbs them.
pub fn rollback_prepare(account: &mut Account, amount: u64) {
    let prepared = account.prepared().saturating_sub(amount);
    account.set_prepared(prepared);
}

/// Validates a signed claim from the peer and persists it if it advances the
/// high-water mark. Returns whether the stored claim changed: an equal
/// replay is an idempotent no-op and a lower claim is ignored.
pub fn handle_claim(account: &mut Account, claim: &SignedClaim, scale: u8) -> Result<bool, ClaimError> {
    if !claim.has_signature() {
        return Err(ClaimError::MissingSignature);
    }
    let (channel, paychan) = match (account.incoming_channel(), account.incoming_paychan()) {
        (Some(channel), Some(paychan)) => (channel, paychan),
        _ => return Err(ClaimError::NoChannel),
    };

    let drops = DropAmount::from_base_ceil(claim.amount, scale).ok_or(ClaimError::AmountOverflow)?;
    let key = claim::parse_ledger_public_key(&paychan.public_key)?;
    claim::verify_claim(&key, &channel, drops, &claim.signature)?;

    if drops > paychan.amount {
        return Err(ClaimError::ExceedsChannelBalance {
            claimed: drops.drops(),
            escrow: paychan.amount.drops(),
        });
    }

    let current = account.incoming_claim();
    if claim.amount > current.amount {
        debug!("account {}: new claim for {} (was {})", account.account_id(), claim.amount, current.amount);
        account.set_incoming_claim(claim);
        Ok(true)
    } else {
        if claim.amount < current.amount {
            debug!(
                "account {}: ignoring claim for {} below current {}",
                account.account_id(),
                claim.amount,
                current.amount
            );
        }
        Ok(false)
    }
}

#[derive(Debug)]
pub struct OutgoingClaim {
    pub claim: SignedClaim,
    /// The signed total crossed the half-capacity mark and no funding
    /// transaction is in flight yet.
    pub needs_funding: bool,
}

/// Signs an outgoing claim raising the cumulative promised amount by
/// `amount` base units. Refuses to promise beyond the client channel's
/// escrow; drop conversion rounds up so drift never exceeds one drop.
pub fn sign_outgoing_claim(
    account: &mut Account,
    amount: u64,
    secret: &str,
    scale: u8,
) -> Result<OutgoingClaim, SettleError> {
    if !account.is_ready() {
        return Err(SettleError::NotReady(account.account_id().clone()));
    }
    let (channel, paychan) = match (account.client_channel(), account.client_paychan()) {
        (Some(channel), Some(paychan)) => (channel, paychan),
        _ => return Err(SettleError::NoClientChannel(account.account_id().clone())),
    };

    let new_outgoing = account.outgoing_balance().checked_add(amount).ok_or(SettleError::Overflow)?;
    let drops = DropAmount::from_base_ceil(new_outgoing, scale).ok_or(SettleError::Overflow)?;
    let capacity = paychan.amount;
    if drops > capacity {
        return Err(SettleError::ExceedsCapacity { need: drops.drops(), capacity: capacity.drops() });
    }

    let funding_mark = capacity.drops().saturating_sub(OUTGOING_CHANNEL_AMOUNT_DROPS / 2);
    let needs_funding = drops.drops() > funding_mark && !account.funding();

    let key = claim::derive_channel_key(secret, account.account_id().as_str());
    let signature = claim::sign_claim(&key, &channel, drops);
    account.set_outgoing_balance(new_outgoing);
    debug!("account {}: signed outgoing claim for {new_outgoing} ({drops} drops)", account.account_id());

    Ok(OutgoingClaim { claim: SignedClaim { amount: new_outgoing, signature }, needs_funding })
}
