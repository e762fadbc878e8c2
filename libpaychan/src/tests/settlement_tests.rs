use crate::account::AccountId;
use crate::amount::DropAmount;
use crate::claim::{derive_channel_key, verify_claim, SignedClaim};
use crate::engine::OUTGOING_CHANNEL_AMOUNT_DROPS;
use crate::ilp::{codes, Fulfill, Packet, Reject};
use crate::protocol::{names, Message};
use crate::tests::*;
use std::time::Duration;

fn fulfill() -> Packet {
    Packet::Fulfill(Fulfill { fulfillment: [1u8; 32], data: Vec::new() })
}

fn t04_reject() -> Packet {
    Packet::Reject(Reject::new(codes::T04_INSUFFICIENT_LIQUIDITY, "test.downstream", "no liquidity"))
}

#[tokio::test]
async fn fulfill_settles_the_amount_plus_owed() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");

    let handle = harness.server.accounts.get(&id).await.unwrap();
    handle.write().await.set_owed_balance(10);

    harness.server.handle_prepare_response(&id, &prepare_packet(123), &fulfill()).await;

    let transfers = harness.transport.transfers();
    assert_eq!(transfers.len(), 1);
    let (to, amount, message) = &transfers[0];
    assert_eq!(to, &id);
    assert_eq!(*amount, 133);

    let claim: SignedClaim = message.get(names::CLAIM).unwrap().parse_json().unwrap();
    assert_eq!(claim.amount, 133);

    let account = handle.read().await;
    assert_eq!(account.owed_balance(), 0);
    assert_eq!(account.outgoing_balance(), 133);

    // the claim is cashable: it verifies against the server's channel key
    let key = derive_channel_key(SERVER_SECRET, "alice");
    let channel = account.client_channel().unwrap();
    verify_claim(&key.verifying_key(), &channel, DropAmount::from_drops(133), &claim.signature).unwrap();
}

#[tokio::test]
async fn zero_amount_fulfills_do_not_settle() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");
    harness.server.handle_prepare_response(&id, &prepare_packet(0), &fulfill()).await;
    assert!(harness.transport.transfers().is_empty());
}

#[tokio::test]
async fn failed_settlement_becomes_owed_and_is_paid_back() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");
    let handle = harness.server.accounts.get(&id).await.unwrap();

    // exhaust the client channel so signing must refuse
    handle.write().await.set_outgoing_balance(OUTGOING_CHANNEL_AMOUNT_DROPS);
    harness.server.handle_prepare_response(&id, &prepare_packet(123), &fulfill()).await;
    assert!(harness.transport.transfers().is_empty());
    assert_eq!(handle.read().await.owed_balance(), 123);

    // capacity returns; a T04 from the peer triggers the owed settlement
    handle.write().await.set_outgoing_balance(0);
    harness.server.handle_prepare_response(&id, &prepare_packet(50), &t04_reject()).await;

    let transfers = harness.transport.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].1, 123);
    let claim: SignedClaim = transfers[0].2.get(names::CLAIM).unwrap().parse_json().unwrap();
    assert_eq!(claim.amount, 123);
    assert_eq!(handle.read().await.owed_balance(), 0);
}

#[tokio::test]
async fn t04_with_nothing_owed_is_a_no_op() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");
    harness.server.handle_prepare_response(&id, &prepare_packet(50), &t04_reject()).await;
    assert!(harness.transport.transfers().is_empty());
}

#[tokio::test]
async fn crossing_the_half_capacity_mark_funds_the_channel() {
    let harness = Harness::new().await;
    let client_channel = harness.ready("alice").await;
    let id = AccountId::from("alice");
    let handle = harness.server.accounts.get(&id).await.unwrap();

    // one base unit below the funding mark
    let mark = OUTGOING_CHANNEL_AMOUNT_DROPS - OUTGOING_CHANNEL_AMOUNT_DROPS / 2;
    handle.write().await.set_outgoing_balance(mark);

    harness.server.handle_prepare_response(&id, &prepare_packet(1), &fulfill()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let funds = harness.ledger.submitted_funds();
    assert_eq!(funds.len(), 1);
    assert_eq!(funds[0].channel, client_channel);
    assert_eq!(funds[0].amount.drops(), OUTGOING_CHANNEL_AMOUNT_DROPS);

    // the ledger entry doubled and the cached view followed
    assert_eq!(harness.ledger.channel(&client_channel).unwrap().amount.drops(), 2 * OUTGOING_CHANNEL_AMOUNT_DROPS);
    let account = handle.read().await;
    assert_eq!(account.client_paychan().unwrap().amount.drops(), 2 * OUTGOING_CHANNEL_AMOUNT_DROPS);
    assert!(!account.funding());
    drop(account);

    // the peer was told to refresh its view of the channel
    let messages = harness.transport.messages();
    assert_eq!(messages.len(), 1);
    let proto = messages[0].1.get(names::CHANNEL).unwrap();
    assert_eq!(proto.as_text().unwrap(), client_channel.to_hex());
}

#[tokio::test]
async fn transfers_store_monotonic_claims() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");
    let handle = harness.server.accounts.get(&id).await.unwrap();

    harness.server.handle_transfer(&id, &Message::claim_transfer(&harness.signed_claim(12345))).await.unwrap();
    assert_eq!(handle.read().await.incoming_claim().amount, 12345);

    // identical replay: accepted, nothing changes
    harness.server.handle_transfer(&id, &Message::claim_transfer(&harness.signed_claim(12345))).await.unwrap();
    assert_eq!(handle.read().await.incoming_claim().amount, 12345);

    // lower: ignored
    harness.server.handle_transfer(&id, &Message::claim_transfer(&harness.signed_claim(11111))).await.unwrap();
    assert_eq!(handle.read().await.incoming_claim().amount, 12345);

    // higher: stored
    harness.server.handle_transfer(&id, &Message::claim_transfer(&harness.signed_claim(123_456))).await.unwrap();
    assert_eq!(handle.read().await.incoming_claim().amount, 123_456);
}

#[tokio::test]
async fn tampered_transfer_claims_are_rejected() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");

    let mut claim = harness.signed_claim(12345);
    claim.amount = 99999;
    let err = harness.server.handle_transfer(&id, &Message::claim_transfer(&claim)).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid claim: invalid signature");

    let handle = harness.server.accounts.get(&id).await.unwrap();
    assert_eq!(handle.read().await.incoming_claim().amount, 0);
}

#[tokio::test]
async fn transfer_without_claim_protocol_errors() {
    let harness = Harness::new().await;
    harness.ready("alice").await;
    let id = AccountId::from("alice");
    let err = harness.server.handle_transfer(&id, &Message::default()).await.unwrap_err();
    assert!(err.to_string().contains("no claim sub-protocol"));
}
