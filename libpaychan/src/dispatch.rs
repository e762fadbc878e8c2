use crate::account::{Account, AccountId, AccountState};
use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use crate::claim::{self, SignedClaim};
use crate::engine::{self, MIN_INCOMING_CHANNEL_DROPS, OUTGOING_CHANNEL_AMOUNT_DROPS};
use crate::ilp::{self, codes, Fulfill, Packet, Prepare, Reject, PEER_CONFIG_DESTINATION};
use crate::ledger::{ChannelCreateParams, LedgerError};
use crate::paychan::{validate_paychan, MIN_SETTLE_DELAY};
use crate::plugin::{channel_index_key, PaychanServer, PluginError};
use crate::protocol::{names, InfoRecord, Message, ProtocolError, SubProtocol};
use log::*;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Deadline for relayed data that is not a PREPARE and so carries no
/// expiry of its own.
const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(30);

impl PaychanServer {
    /// The sub-protocol multiplexer. Each recognized sub-protocol of the
    /// message is examined independently; replies are collected into one
    /// response message.
    pub async fn handle_message(self: &Arc<Self>, account_id: &AccountId, message: &Message) -> Result<Message, PluginError> {
        let handle = self.get_or_create_account(account_id).await?;
        let mut replies = Vec::new();
        let mut recognized = false;

        if message.get(names::LAST_CLAIM).is_some() {
            recognized = true;
            let account = handle.read().await;
            replies.push(SubProtocol::json(names::LAST_CLAIM, &account.incoming_claim()));
        }

        if message.get(names::INFO).is_some() {
            recognized = true;
            let account = handle.read().await;
            replies.push(SubProtocol::json(names::INFO, &self.info_record(&account)));
        }

        if let Some(proto) = message.get(names::CHANNEL) {
            recognized = true;
            let signature_proto = message
                .get(names::CHANNEL_SIGNATURE)
                .ok_or_else(|| ProtocolError::Invalid("channel sub-protocol requires a channel_signature".to_string()))?;
            let channel = ChannelId::from_hex(proto.as_text()?)
                .map_err(|e| ProtocolError::Invalid(format!("malformed channel id: {e}")))?;
            let signature = hex::decode(signature_proto.as_text()?)
                .map_err(|e| ProtocolError::Invalid(format!("malformed channel signature: {e}")))?;
            let mut account = handle.write().await;
            self.handle_channel(&handle, &mut account, channel, &signature).await?;
        }

        if let Some(proto) = message.get(names::FUND_CHANNEL) {
            recognized = true;
            let destination = proto.as_text()?.to_string();
            let mut account = handle.write().await;
            let channel = self.handle_fund_channel(&mut account, &destination).await?;
            replies.push(SubProtocol::text(names::FUND_CHANNEL, channel.to_hex()));
        }

        if let Some(proto) = message.get(names::ILP) {
            recognized = true;
            let response = self.handle_ilp(&handle, account_id, &proto.data).await;
            replies.push(SubProtocol::octets(names::ILP, response));
        }

        if !recognized {
            return Err(ProtocolError::NoKnownProtocol.into());
        }
        Ok(Message::new(replies))
    }

    /// Incoming settlement: verifies the transfer's signed claim and stores
    /// it if it advances the high-water mark.
    pub async fn handle_transfer(self: &Arc<Self>, account_id: &AccountId, message: &Message) -> Result<(), PluginError> {
        let proto = message
            .get(names::CLAIM)
            .ok_or_else(|| ProtocolError::Invalid("transfer carries no claim sub-protocol".to_string()))?;
        let claim: SignedClaim = proto.parse_json()?;
        let handle = self.get_or_create_account(account_id).await?;
        let mut account = handle.write().await;
        account.ensure_not_blocked()?;
        engine::handle_claim(&mut account, &claim, self.config.scale())?;
        Ok(())
    }

    fn info_record(&self, account: &Account) -> InfoRecord {
        let past_preparing = matches!(
            account.state(),
            AccountState::LoadingClientChannel
                | AccountState::EstablishingClientChannel
                | AccountState::PreparingClientChannel
                | AccountState::Ready
        );
        InfoRecord {
            address: self.config.address.clone(),
            account: account.full_address(&self.config.ilp_address),
            currency_scale: self.config.scale(),
            channel: if past_preparing { account.incoming_channel().map(|c| c.to_hex()) } else { None },
            client_channel: if account.is_ready() { account.client_channel().map(|c| c.to_hex()) } else { None },
        }
    }

    /// Adopts (or refreshes) the peer's incoming channel. Allowed only in
    /// `Ready` or `EstablishingChannel`; `PreparingChannel` locks the
    /// account for the duration of the ledger round-trip.
    async fn handle_channel(
        self: &Arc<Self>,
        handle: &Arc<RwLock<Account>>,
        account: &mut Account,
        channel: ChannelId,
        signature: &[u8],
    ) -> Result<(), PluginError> {
        account.ensure_not_blocked()?;
        if let Some(existing) = account.incoming_channel() {
            if existing != channel {
                return Err(ProtocolError::Invalid(format!(
                    "account {} is already bound to channel {existing}",
                    account.account_id()
                ))
                .into());
            }
            // an identical replay mid-establishment is a no-op; from Ready it
            // falls through below and refreshes the ledger view
            if !matches!(account.state(), AccountState::Ready | AccountState::EstablishingChannel) {
                debug!("channel {channel} is already bound to {}; ignoring replay", account.account_id());
                return Ok(());
            }
        }
        let resume = account.state();
        match resume {
            AccountState::Ready | AccountState::EstablishingChannel => {}
            actual => {
                return Err(ProtocolError::Invalid(format!(
                    "a channel cannot be bound while the account is in state {actual}"
                ))
                .into())
            }
        }

        let index_key = channel_index_key(&channel);
        self.store.load(&index_key).await?;
        if let Some(bound) = self.store.get(&index_key) {
            if bound != account.account_id().as_str() {
                return Err(ProtocolError::Invalid(format!(
                    "this channel has already been associated with a different account. account={} associated={bound}",
                    account.account_id()
                ))
                .into());
            }
        }

        account.set_state(AccountState::PreparingChannel);
        match self.adopt_channel(handle, account, channel, signature).await {
            Ok(()) => {
                if resume == AccountState::Ready {
                    account.set_state(AccountState::Ready);
                    Ok(())
                } else {
                    self.resolve_client_channel(account).await
                }
            }
            Err(e) => {
                account.set_state(AccountState::EstablishingChannel);
                Err(e)
            }
        }
    }

    async fn adopt_channel(
        self: &Arc<Self>,
        handle: &Arc<RwLock<Account>>,
        account: &mut Account,
        channel: ChannelId,
        signature: &[u8],
    ) -> Result<(), PluginError> {
        let entry = match self.ledger.get_payment_channel(&channel).await {
            Ok(entry) => entry,
            Err(LedgerError::EntryNotFound) => {
                return Err(ProtocolError::Invalid(format!("channel {channel} does not exist on the ledger")).into())
            }
            Err(e) => return Err(e.into()),
        };
        validate_paychan(&entry, &self.config.address)?;

        let key = claim::parse_ledger_public_key(&entry.public_key)?;
        let full_address = account.full_address(&self.config.ilp_address);
        claim::verify_channel_proof(&key, &channel, &full_address, signature)?;

        self.store.set(&channel_index_key(&channel), account.account_id().as_str());
        info!("account {} bound incoming channel {channel}", account.account_id());
        self.adopt_incoming(handle, account, channel, entry);
        Ok(())
    }

    /// Opens the reverse channel to the peer. Allowed only in
    /// `EstablishingClientChannel`; replaying once a channel exists returns
    /// the existing id.
    async fn handle_fund_channel(&self, account: &mut Account, destination: &str) -> Result<ChannelId, PluginError> {
        account.ensure_not_blocked()?;
        if let Some(existing) = account.client_channel() {
            return Ok(existing);
        }
        account.assert_state(AccountState::EstablishingClientChannel)?;

        let escrow = account.incoming_paychan().map(|p| p.amount.drops()).unwrap_or(0);
        if escrow < MIN_INCOMING_CHANNEL_DROPS {
            return Err(ProtocolError::Invalid(format!(
                "an incoming channel of at least {MIN_INCOMING_CHANNEL_DROPS} drops is required before an outgoing \
                 channel is opened (escrowed: {escrow})"
            ))
            .into());
        }
        if account.client_channel_pending() {
            return Err(ProtocolError::Invalid("an outgoing channel is already being created".to_string()).into());
        }
        account.mark_client_channel_pending();
        account.set_state(AccountState::PreparingClientChannel);

        let key = claim::derive_channel_key(self.config.secret.expose(), account.account_id().as_str());
        let params = ChannelCreateParams::new(
            DropAmount::from_drops(OUTGOING_CHANNEL_AMOUNT_DROPS),
            destination,
            MIN_SETTLE_DELAY,
            claim::ledger_public_key(&key),
        );
        let outcome = match self.submitter.create_channel(params).await {
            Ok(event) => match event.channel_id {
                Some(channel) => match self.ledger.get_payment_channel(&channel).await {
                    Ok(entry) => Ok((channel, entry)),
                    Err(e) => Err(PluginError::from(e)),
                },
                None => Err(ProtocolError::Invalid("ledger reported no channel id for the create".to_string()).into()),
            },
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok((channel, entry)) => {
                account.set_client_channel(&channel);
                account.set_client_paychan(Some(entry));
                account.set_state(AccountState::Ready);
                info!("opened client channel {channel} for account {}", account.account_id());
                Ok(channel)
            }
            Err(e) => {
                account.clear_client_channel_pending();
                account.set_state(AccountState::EstablishingClientChannel);
                Err(e)
            }
        }
    }

    /// The `ilp` sub-protocol. Errors never escape: they come back as a
    /// serialized REJECT, which is a normal reply.
    async fn handle_ilp(self: &Arc<Self>, handle: &Arc<RwLock<Account>>, account_id: &AccountId, raw: &[u8]) -> Vec<u8> {
        let triggered_by = self.config.ilp_address.clone();
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                return Packet::Reject(Reject::new(
                    codes::F01_INVALID_PACKET,
                    &triggered_by,
                    format!("could not parse packet: {e}"),
                ))
                .encode()
            }
        };
        match packet {
            Packet::Prepare(prepare) => self.handle_prepare(handle, account_id, prepare, raw).await,
            _ => self.relay_data(account_id, raw, DEFAULT_DATA_TIMEOUT).await,
        }
    }

    async fn handle_prepare(
        self: &Arc<Self>,
        handle: &Arc<RwLock<Account>>,
        account_id: &AccountId,
        prepare: Prepare,
        raw: &[u8],
    ) -> Vec<u8> {
        let triggered_by = &self.config.ilp_address;

        if prepare.destination == PEER_CONFIG_DESTINATION {
            let account = handle.read().await;
            let data = ilp::ildcp_response(
                &account.full_address(&self.config.ilp_address),
                self.config.scale(),
                "XRP",
            );
            return Packet::Fulfill(Fulfill { fulfillment: [0u8; 32], data }).encode();
        }

        {
            let mut account = handle.write().await;
            if let Err(e) = engine::admit_prepare(&mut account, &prepare, &self.config) {
                debug!("rejecting prepare from {account_id}: {e}");
                return Packet::Reject(Reject::new(e.code(), triggered_by, e.to_string()).with_data(e.data())).encode();
            }
        }

        let Some(handler) = self.data_handler() else {
            let mut account = handle.write().await;
            engine::rollback_prepare(&mut account, prepare.amount);
            return Packet::Reject(Reject::new(codes::T00_INTERNAL_ERROR, triggered_by, "no data handler is registered"))
                .encode();
        };

        // race the data handler against the packet's own deadline
        let deadline = prepare.expires_at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
        match tokio::time::timeout(deadline, handler.handle_data(account_id, raw)).await {
            Err(_) => {
                let mut account = handle.write().await;
                engine::rollback_prepare(&mut account, prepare.amount);
                Packet::Reject(Reject::new(
                    codes::R00_TRANSFER_TIMED_OUT,
                    triggered_by,
                    "packet expired before the data handler answered",
                ))
                .encode()
            }
            Ok(Err(e)) => {
                let mut account = handle.write().await;
                engine::rollback_prepare(&mut account, prepare.amount);
                Packet::Reject(Reject::new(codes::T00_INTERNAL_ERROR, triggered_by, e.to_string())).encode()
            }
            Ok(Ok(response)) => {
                match Packet::decode(&response) {
                    Ok(Packet::Reject(_)) => {
                        let mut account = handle.write().await;
                        engine::rollback_prepare(&mut account, prepare.amount);
                    }
                    Ok(Packet::Fulfill(_)) => {
                        if prepare.amount > 0 {
                            if let Some(money_handler) = self.money_handler() {
                                let from = account_id.clone();
                                let amount = prepare.amount;
                                tokio::spawn(async move { money_handler.handle_money(&from, amount).await });
                            }
                        }
                    }
                    _ => {}
                }
                response
            }
        }
    }

    async fn relay_data(&self, account_id: &AccountId, raw: &[u8], timeout: Duration) -> Vec<u8> {
        let triggered_by = &self.config.ilp_address;
        let Some(handler) = self.data_handler() else {
            return Packet::Reject(Reject::new(codes::T00_INTERNAL_ERROR, triggered_by, "no data handler is registered"))
                .encode();
        };
        match tokio::time::timeout(timeout, handler.handle_data(account_id, raw)).await {
            Err(_) => Packet::Reject(Reject::new(
                codes::R00_TRANSFER_TIMED_OUT,
                triggered_by,
                "the data handler did not answer in time",
            ))
            .encode(),
            Ok(Err(e)) => Packet::Reject(Reject::new(codes::T00_INTERNAL_ERROR, triggered_by, e.to_string())).encode(),
            Ok(Ok(response)) => response,
        }
    }
}
