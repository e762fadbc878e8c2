use crate::account::AccountId;
use crate::ilp::{codes, Fulfill, Packet, Prepare, Reject};
use crate::plugin::{DataHandler, HandlerError, MoneyHandler};
use crate::protocol::{names, Message, SubProtocol};
use crate::tests::*;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

struct StaticHandler {
    response: Vec<u8>,
}

#[async_trait]
impl DataHandler for StaticHandler {
    async fn handle_data(&self, _from: &AccountId, _data: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(self.response.clone())
    }
}

struct SleepyHandler;

#[async_trait]
impl DataHandler for SleepyHandler {
    async fn handle_data(&self, _from: &AccountId, _data: &[u8]) -> Result<Vec<u8>, HandlerError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct MoneyRecorder {
    received: Mutex<Vec<(AccountId, u64)>>,
}

#[async_trait]
impl MoneyHandler for MoneyRecorder {
    async fn handle_money(&self, from: &AccountId, amount: u64) {
        self.received.lock().unwrap().push((from.clone(), amount));
    }
}

fn fulfill_bytes() -> Vec<u8> {
    Packet::Fulfill(Fulfill { fulfillment: [3u8; 32], data: Vec::new() }).encode()
}

fn reject_bytes() -> Vec<u8> {
    Packet::Reject(Reject::new("F99", "test.upstream", "nope")).encode()
}

fn ilp_message(packet: &[u8]) -> Message {
    Message::new(vec![SubProtocol::octets(names::ILP, packet.to_vec())])
}

async fn ilp_reply(harness: &Harness, account: &str, packet: &[u8]) -> Packet {
    let reply = harness
        .server
        .handle_message(&AccountId::from(account), &ilp_message(packet))
        .await
        .unwrap();
    Packet::decode(&reply.get(names::ILP).unwrap().data).unwrap()
}

async fn prepared_total(harness: &Harness, account: &str) -> u64 {
    let handle = harness.server.accounts.get(&AccountId::from(account)).await.unwrap();
    let total = handle.read().await.prepared();
    total
}

#[tokio::test]
async fn peer_config_short_circuits_with_ildcp() {
    let harness = Harness::new().await;
    let mut prepare = prepare_packet(0);
    prepare.destination = "peer.config".to_string();

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare).encode()).await;
    let Packet::Fulfill(fulfill) = reply else { panic!("expected a fulfill, got {reply:?}") };
    assert_eq!(fulfill.fulfillment, [0u8; 32]);
    assert_eq!(fulfill.data, crate::ilp::ildcp_response("test.example.alice", 6, "XRP"));
}

#[tokio::test]
async fn fulfilled_prepare_keeps_the_prepared_total_and_pays_the_money_handler() {
    let harness = Harness::with_config(config_with_bandwidth(1_000_000)).await;
    harness.ready("alice").await;
    harness.server.register_data_handler(std::sync::Arc::new(StaticHandler { response: fulfill_bytes() }));
    let money = std::sync::Arc::new(MoneyRecorder::default());
    harness.server.register_money_handler(money.clone());

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1000)).encode()).await;
    assert!(matches!(reply, Packet::Fulfill(_)));
    // FULFILL does not roll back; the amount waits for a covering claim
    assert_eq!(prepared_total(&harness, "alice").await, 1000);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(money.received.lock().unwrap().as_slice(), &[(AccountId::from("alice"), 1000)]);
}

#[tokio::test]
async fn rejected_prepare_rolls_back() {
    let harness = Harness::with_config(config_with_bandwidth(1_000_000)).await;
    harness.ready("alice").await;
    harness.server.register_data_handler(std::sync::Arc::new(StaticHandler { response: reject_bytes() }));

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1000)).encode()).await;
    assert!(matches!(reply, Packet::Reject(_)));
    assert_eq!(prepared_total(&harness, "alice").await, 0);
}

#[tokio::test]
async fn expired_prepare_times_out_with_r00() {
    let harness = Harness::with_config(config_with_bandwidth(1_000_000)).await;
    harness.ready("alice").await;
    harness.server.register_data_handler(std::sync::Arc::new(SleepyHandler));

    let mut prepare = prepare_packet(1000);
    prepare.expires_at = std::time::SystemTime::now() + Duration::from_millis(50);
    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare).encode()).await;

    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::R00_TRANSFER_TIMED_OUT);
    assert_eq!(prepared_total(&harness, "alice").await, 0);
}

#[tokio::test]
async fn missing_data_handler_rejects_and_rolls_back() {
    let harness = Harness::with_config(config_with_bandwidth(1_000_000)).await;
    harness.ready("alice").await;

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1000)).encode()).await;
    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::T00_INTERNAL_ERROR);
    assert_eq!(prepared_total(&harness, "alice").await, 0);
}

#[tokio::test]
async fn unready_account_is_unreachable() {
    let harness = Harness::new().await;
    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1)).encode()).await;
    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::F02_UNREACHABLE);
    assert_eq!(reject.triggered_by, ILP_ADDRESS);
}

#[tokio::test]
async fn insufficient_bandwidth_rejects_with_t04() {
    let harness = Harness::with_config(config_with_bandwidth(1_000_000)).await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");
    harness.server.handle_transfer(&id, &Message::claim_transfer(&harness.signed_claim(12345))).await.unwrap();

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1_234_567)).encode()).await;
    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::T04_INSUFFICIENT_LIQUIDITY);
    assert_eq!(reject.message, "Insufficient bandwidth, used: 1222222 max: 1000000");
    assert_eq!(prepared_total(&harness, "alice").await, 0);
}

#[tokio::test]
async fn packet_limit_rejects_with_f08_and_amounts() {
    let mut config = config_with_bandwidth(u64::MAX);
    config.max_packet_amount = Some(1000);
    let harness = Harness::with_config(config).await;
    harness.ready("alice").await;
    harness.server.register_data_handler(std::sync::Arc::new(StaticHandler { response: fulfill_bytes() }));

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1000)).encode()).await;
    assert!(matches!(reply, Packet::Fulfill(_)));

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1001)).encode()).await;
    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::F08_AMOUNT_TOO_LARGE);
    assert_eq!(reject.data, crate::ilp::amount_too_large_data(1001, 1000));
}

#[tokio::test]
async fn blocked_account_gets_f02() {
    let harness = Harness::with_config(config_with_bandwidth(1_000_000)).await;
    harness.ready("alice").await;
    let handle = harness.server.accounts.get(&AccountId::from("alice")).await.unwrap();
    handle.write().await.block("operator intervention");

    let reply = ilp_reply(&harness, "alice", &Packet::Prepare(prepare_packet(1)).encode()).await;
    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::F02_UNREACHABLE);
    assert!(reject.message.contains("blocked"));
}

#[tokio::test]
async fn garbage_packets_reject_with_f01() {
    let harness = Harness::new().await;
    let reply = ilp_reply(&harness, "alice", &[0xde, 0xad, 0xbe, 0xef]).await;
    let Packet::Reject(reject) = reply else { panic!("expected a reject") };
    assert_eq!(reject.code, codes::F01_INVALID_PACKET);
}

#[tokio::test]
async fn non_prepare_data_is_relayed_with_default_deadline() {
    let harness = Harness::new().await;
    harness.server.register_data_handler(std::sync::Arc::new(StaticHandler { response: fulfill_bytes() }));
    // a reject from the peer is relayed to the data handler untouched
    let reply = ilp_reply(&harness, "alice", &reject_bytes()).await;
    assert!(matches!(reply, Packet::Fulfill(_)));
}

#[tokio::test]
async fn prepare_type_matches_wire_constant() {
    let encoded = Packet::Prepare(Prepare { ..prepare_packet(1) }).encode();
    assert_eq!(encoded[0], crate::ilp::TYPE_PREPARE);
}
