//! Shared fixtures and end-to-end scenario tests. Unit tests live next to
//! the code they exercise; everything here drives the server through its
//! public surface with the dummy ledger, store and transport.

mod ilp_tests;
mod settlement_tests;

use crate::account::{Account, AccountId, AccountState};
use crate::amount::DropAmount;
use crate::channel_id::ChannelId;
use crate::claim::{derive_channel_key, ledger_public_key, sign_claim, SignedClaim};
use crate::config::{PluginConfig, XrpSecret};
use crate::engine::OUTGOING_CHANNEL_AMOUNT_DROPS;
use crate::ilp::Prepare;
use crate::ledger::DummyLedger;
use crate::paychan::{PaychanEntry, MIN_SETTLE_DELAY};
use crate::plugin::{DummyTransport, PaychanServer};
use crate::protocol::{names, Message, SubProtocol};
use crate::store::{MemoryStore, Store, StoreWrapper};
use ed25519_dalek::Signer;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub(crate) const SERVER_ADDRESS: &str = "rSERVERxxxxxxxxxxxxxxxxxxxxxxxxxx";
pub(crate) const CLIENT_ADDRESS: &str = "rCLIENTxxxxxxxxxxxxxxxxxxxxxxxxxx";
pub(crate) const ILP_ADDRESS: &str = "test.example";
pub(crate) const SERVER_SECRET: &str = "server-secret";
pub(crate) const CLIENT_SECRET: &str = "client-secret";

/// Label under which the test client derives its channel key.
pub(crate) const CLIENT_KEY_LABEL: &str = "paychan";

pub(crate) const INCOMING_CHANNEL: ChannelId = ChannelId::new([0x11u8; 32]);
pub(crate) const CLIENT_CHANNEL: ChannelId = ChannelId::new([0x22u8; 32]);

pub(crate) fn test_config() -> PluginConfig {
    PluginConfig {
        xrp_server: "wss://s1.example.net".to_string(),
        address: SERVER_ADDRESS.to_string(),
        secret: XrpSecret::new(SERVER_SECRET),
        ilp_address: ILP_ADDRESS.to_string(),
        asset_scale: None,
        currency_scale: None,
        max_balance: None,
        bandwidth: None,
        max_packet_amount: None,
        max_fee_percent: None,
        claim_interval_ms: None,
    }
}

pub(crate) fn config_with_bandwidth(bandwidth: u64) -> PluginConfig {
    let mut config = test_config();
    config.max_balance = Some(bandwidth);
    config
}

/// An incoming channel: 10 XRP escrowed by the client towards the server,
/// signed for by the client's derived channel key.
pub(crate) fn test_paychan(client_secret: &str, key_label: &str) -> PaychanEntry {
    PaychanEntry {
        account: CLIENT_ADDRESS.to_string(),
        destination: SERVER_ADDRESS.to_string(),
        amount: DropAmount::from_xrp("10").unwrap(),
        balance: DropAmount::ZERO,
        public_key: ledger_public_key(&derive_channel_key(client_secret, key_label)),
        settle_delay: MIN_SETTLE_DELAY,
        cancel_after: None,
        expiration: None,
        source_tag: None,
    }
}

/// The reverse channel: the server's default outgoing amount towards the
/// client.
pub(crate) fn client_paychan(server_secret: &str, account_id: &str) -> PaychanEntry {
    PaychanEntry {
        account: SERVER_ADDRESS.to_string(),
        destination: CLIENT_ADDRESS.to_string(),
        amount: DropAmount::from_drops(OUTGOING_CHANNEL_AMOUNT_DROPS),
        balance: DropAmount::ZERO,
        public_key: ledger_public_key(&derive_channel_key(server_secret, account_id)),
        settle_delay: MIN_SETTLE_DELAY,
        cancel_after: None,
        expiration: None,
        source_tag: None,
    }
}

pub(crate) fn prepare_packet(amount: u64) -> Prepare {
    Prepare {
        amount,
        expires_at: SystemTime::now() + Duration::from_secs(30),
        execution_condition: [0u8; 32],
        destination: format!("{ILP_ADDRESS}.alice"),
        data: Vec::new(),
    }
}

/// A standalone account already in `Ready`, bypassing the orchestrator.
/// Used by the engine unit tests.
pub(crate) async fn ready_account(id: &str, client_secret: &str) -> Account {
    let store = Arc::new(StoreWrapper::new(Arc::new(MemoryStore::new()) as Arc<dyn Store>));
    let mut account = Account::new(AccountId::from(id), store);
    account.connect().await.unwrap();
    account.set_incoming_channel(&INCOMING_CHANNEL);
    account.set_incoming_paychan(Some(test_paychan(client_secret, CLIENT_KEY_LABEL)));
    account.set_client_channel(&CLIENT_CHANNEL);
    account.set_client_paychan(Some(client_paychan(SERVER_SECRET, id)));
    account.set_state(AccountState::Ready);
    account
}

/// Full server harness over the dummy collaborators, exercising accounts
/// the way a peer would: through messages.
pub(crate) struct Harness {
    pub server: Arc<PaychanServer>,
    pub ledger: Arc<DummyLedger>,
    pub transport: Arc<DummyTransport>,
    pub backend: Arc<MemoryStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: PluginConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let ledger = Arc::new(DummyLedger::new());
        ledger.insert_channel(INCOMING_CHANNEL, test_paychan(CLIENT_SECRET, CLIENT_KEY_LABEL));
        let transport = Arc::new(DummyTransport::new());
        let backend = Arc::new(MemoryStore::new());
        let server = PaychanServer::new(
            config,
            Arc::clone(&backend) as Arc<dyn Store>,
            Arc::clone(&ledger) as Arc<dyn crate::ledger::LedgerClient>,
            Arc::clone(&transport) as Arc<dyn crate::plugin::PeerTransport>,
        )
        .unwrap();
        Harness { server, ledger, transport, backend }
    }

    /// The `channel` + `channel_signature` message a client sends to bind
    /// its channel to `account`.
    pub fn channel_message(&self, account: &str) -> Message {
        let key = derive_channel_key(CLIENT_SECRET, CLIENT_KEY_LABEL);
        let full_address = format!("{ILP_ADDRESS}.{account}");
        let proof = crate::claim::encode_channel_proof(&INCOMING_CHANNEL, &full_address);
        let signature = key.sign(&proof).to_bytes();
        Message::new(vec![
            SubProtocol::text(names::CHANNEL, INCOMING_CHANNEL.to_hex()),
            SubProtocol::text(names::CHANNEL_SIGNATURE, hex::encode(signature)),
        ])
    }

    pub async fn bind_channel(&self, account: &str) {
        let id = AccountId::from(account);
        self.server.handle_message(&id, &self.channel_message(account)).await.unwrap();
    }

    /// Requests the reverse channel; returns its ledger id.
    pub async fn open_client_channel(&self, account: &str) -> ChannelId {
        let id = AccountId::from(account);
        let message = Message::new(vec![SubProtocol::text(names::FUND_CHANNEL, CLIENT_ADDRESS)]);
        let reply = self.server.handle_message(&id, &message).await.unwrap();
        let proto = reply.get(names::FUND_CHANNEL).expect("fund_channel reply");
        ChannelId::from_hex(proto.as_text().unwrap()).unwrap()
    }

    /// Drives `account` all the way to `Ready`.
    pub async fn ready(&self, account: &str) -> ChannelId {
        self.bind_channel(account).await;
        self.open_client_channel(account).await
    }

    /// A claim over the incoming channel validly signed by the client, for
    /// `amount` base units (scale 6).
    pub fn signed_claim(&self, amount: u64) -> SignedClaim {
        let key = derive_channel_key(CLIENT_SECRET, CLIENT_KEY_LABEL);
        SignedClaim {
            amount,
            signature: sign_claim(&key, &INCOMING_CHANNEL, DropAmount::from_drops(amount)),
        }
    }

    pub async fn account_state(&self, account: &str) -> AccountState {
        let handle = self.server.accounts.get(&AccountId::from(account)).await.expect("account registered");
        let state = handle.read().await.state();
        state
    }
}
