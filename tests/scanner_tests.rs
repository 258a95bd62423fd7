// Chain scanning: classification, deduplication, status tracking and pending self-sent resolution.

mod common;

use bitcoin::{Amount, Witness};
use chainchat::backend::BackendKind;
use chainchat::config::WalletSettings;
use chainchat::keys;
use chainchat::message::{now_ms, MessageKind, MessageStatus, ANONYMOUS_CONTACT};
use chainchat::scanner::Classification;
use chainchat::storage::MemoryStore;
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_incoming_message_from_contact() {
    println!("🧪 Testing incoming message from a known contact...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let mut h = harness(same_key(&alice), BackendKind::Indexer);

    h.scanner.add_contact(&bob_hex, Some("Bob")).await.unwrap();
    let tx = chat_tx(&bob, &alice, "hi alice", 1000, 1);
    let txid = h.chain.add_tx(&tx, 0, &[&alice_addr]);

    let report = h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(report.new_messages, 1);

    let msgs = h.scanner.messages(&bob_hex);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].id, txid);
    assert_eq!(msgs[0].text, "hi alice");
    assert_eq!(msgs[0].status, MessageStatus::BroadcastUnconfirmed);
    assert_eq!(msgs[0].kind, MessageKind::Incoming { amount: Some(Amount::from_sat(1000)) });

    let contact = h.scanner.contacts().into_iter().find(|c| c.id == bob_hex).unwrap();
    assert_eq!(contact.unread, 1);

    let ev = h.events.try_recv().unwrap();
    assert!(ev.is_inbound);
    assert!(!ev.is_status_update);
    assert_eq!(ev.contact_id, bob_hex);

    println!("✅ Incoming message test passed");
}

#[tokio::test]
async fn test_rescan_is_idempotent() {
    println!("🧪 Testing repeated scans of unchanged history...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let h = harness(same_key(&alice), BackendKind::Indexer);

    h.chain.add_tx(&chat_tx(&bob, &alice, "one", 600, 1), 90, &[&alice_addr]);
    h.chain.add_tx(&chat_tx(&bob, &alice, "two", 600, 2), 0, &[&alice_addr]);

    h.scanner.scan_tick(false).await.unwrap();
    let fetched = h.chain.fetches();
    let second = h.scanner.scan_tick(false).await.unwrap();
    let third = h.scanner.scan_tick(false).await.unwrap();

    assert_eq!(second.new_messages, 0);
    assert_eq!(third.new_messages, 0);
    assert_eq!(h.scanner.messages(&bob.public_hex()).len(), 2);
    assert_eq!(h.scanner.snapshot().scan.processed.len(), 2);
    assert_eq!(h.chain.fetches(), fetched, "processed ids are never fetched again");

    println!("✅ Idempotent rescan test passed");
}

#[tokio::test]
async fn test_confirmation_status_progresses() {
    println!("🧪 Testing status moves from unconfirmed to confirmed...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let mut h = harness(same_key(&alice), BackendKind::Indexer);
    h.chain.set_tip(100);

    let txid = h.chain.add_tx(&chat_tx(&bob, &alice, "pending", 1000, 3), 0, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(h.scanner.messages(&bob_hex)[0].status, MessageStatus::BroadcastUnconfirmed);
    while h.events.try_recv().is_ok() {}

    // Six confirmations at tip 100.
    h.chain.set_height(&txid, 95);
    let report = h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(report.status_updates, 1);

    let msgs = h.scanner.messages(&bob_hex);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].status, MessageStatus::Confirmed);

    let ev = h.events.try_recv().unwrap();
    assert!(ev.is_status_update);
    assert_eq!(ev.message.status, MessageStatus::Confirmed);

    println!("✅ Status progression test passed");
}

#[tokio::test]
async fn test_status_never_regresses_without_force() {
    println!("🧪 Testing status monotonicity and forced re-derivation...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let h = harness(same_key(&alice), BackendKind::Indexer);
    h.scanner.add_contact(&bob_hex, None).await.unwrap();

    let txid = h.chain.add_tx(&chat_tx(&bob, &alice, "reorg me", 1000, 4), 99, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(h.scanner.messages(&bob_hex)[0].status, MessageStatus::Confirmed);

    h.chain.set_height(&txid, 0);
    h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(h.scanner.messages(&bob_hex)[0].status, MessageStatus::Confirmed);

    h.scanner.scan_tick(true).await.unwrap();
    let msgs = h.scanner.messages(&bob_hex);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].status, MessageStatus::BroadcastUnconfirmed);

    println!("✅ Status monotonicity test passed");
}

#[tokio::test]
async fn test_self_sent_waits_for_contact() {
    println!("🧪 Testing self-sent message to a non-contact...");

    let alice = keys::generate();
    let carol = keys::generate();
    let alice_addr = address_of(&alice);
    let carol_hex = carol.public_hex();
    let h = harness(same_key(&alice), BackendKind::Indexer);

    let txid = h.chain.add_tx(&chat_tx(&alice, &carol, "before you were a contact", 2000, 5), 50, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();

    let snap = h.scanner.snapshot();
    assert!(snap.messages.values().all(|list| list.is_empty()), "not listed yet");
    assert!(!snap.scan.processed.contains(&txid), "not processed yet");
    assert!(snap.scan.pending.contains_key(&txid));

    // Still pending on later scans.
    h.scanner.scan_tick(false).await.unwrap();
    assert!(h.scanner.snapshot().scan.pending.contains_key(&txid));

    h.scanner.add_contact(&carol_hex, Some("Carol")).await.unwrap();
    let msgs = h.scanner.messages(&carol_hex);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].text, "before you were a contact");
    assert!(msgs[0].is_outgoing());
    assert_eq!(msgs[0].amount(), Some(Amount::from_sat(2000)));
    assert!(h.scanner.snapshot().scan.processed.contains(&txid));
    assert!(h.scanner.snapshot().scan.pending.is_empty());

    h.scanner.scan_tick(true).await.unwrap();
    h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(h.scanner.messages(&carol_hex).len(), 1, "resolved exactly once");

    println!("✅ Pending self-sent resolution test passed");
}

#[tokio::test]
async fn test_unknown_sender_goes_to_anonymous() {
    println!("🧪 Testing message without a recoverable sender key...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let h = harness(same_key(&alice), BackendKind::Indexer);

    let mut tx = signed_tx(&bob, &alice, b"hello in the clear", 1000, 6);
    tx.input[0].witness = Witness::new();
    assert_eq!(h.scanner.classify(&tx).lifecycle(), chainchat::TxLifecycle::ReceivedUnknownSender);

    h.chain.add_tx(&tx, 10, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();

    let msgs = h.scanner.messages(ANONYMOUS_CONTACT);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].text, "hello in the clear");
    assert!(h.scanner.conversations().contains(&ANONYMOUS_CONTACT.to_string()));

    println!("✅ Anonymous sender test passed");
}

#[tokio::test]
async fn test_unrelated_transactions_are_ignored() {
    println!("🧪 Testing transactions without a payload or without a payment to us...");

    let alice = keys::generate();
    let bob = keys::generate();
    let carol = keys::generate();
    let alice_addr = address_of(&alice);
    let h = harness(same_key(&alice), BackendKind::Indexer);

    // No data output.
    let mut plain = chat_tx(&bob, &alice, "x", 1000, 7);
    plain.output.remove(0);
    assert_eq!(h.scanner.classify(&plain), Classification::Ignored);

    // Payload, but it pays someone else.
    let elsewhere = chat_tx(&bob, &carol, "not for alice", 1000, 8);
    assert_eq!(h.scanner.classify(&elsewhere), Classification::Ignored);

    let a = h.chain.add_tx(&plain, 5, &[&alice_addr]);
    let b = h.chain.add_tx(&elsewhere, 5, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();

    let snap = h.scanner.snapshot();
    assert!(snap.scan.processed.contains(&a) && snap.scan.processed.contains(&b));
    assert!(snap.messages.values().all(|l| l.is_empty()));

    println!("✅ Ignored transaction test passed");
}

#[tokio::test]
async fn test_dust_payment_is_not_reported() {
    println!("🧪 Testing carrier-floor amounts are not shown as payments...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let h = harness(same_key(&alice), BackendKind::Indexer);

    h.chain.add_tx(&chat_tx(&bob, &alice, "just words", 546, 9), 10, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();

    let msgs = h.scanner.messages(&bob.public_hex());
    assert_eq!(msgs[0].kind, MessageKind::Incoming { amount: None });

    println!("✅ Dust amount test passed");
}

#[tokio::test]
async fn test_unknown_sender_accepted_by_rename() {
    println!("🧪 Testing accepting an unknown sender as a contact...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let h = harness(same_key(&alice), BackendKind::Indexer);

    h.chain.add_tx(&chat_tx(&bob, &alice, "who am i", 1000, 10), 10, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();
    assert!(h.scanner.contacts().is_empty());
    assert_eq!(h.scanner.messages(&bob_hex).len(), 1);

    let contact = h.scanner.rename_contact(&bob_hex, "Bob").await.unwrap();
    assert_eq!(contact.name, "Bob");
    assert_eq!(contact.address, address_of(&bob));
    assert_eq!(h.scanner.messages(&bob_hex)[0].text, "who am i");

    // Empty names fall back to the key suffix.
    let renamed = h.scanner.rename_contact(&bob_hex, "  ").await.unwrap();
    assert_eq!(renamed.name, format!("...{}", &bob_hex[bob_hex.len() - 4..]));

    println!("✅ Rename-or-create test passed");
}

#[tokio::test]
async fn test_contact_history_walk_on_add() {
    println!("🧪 Testing contact history scan when a contact is added...");

    let alice = keys::generate();
    let bob = keys::generate();
    let bob_addr = address_of(&bob);
    let bob_hex = bob.public_hex();
    let h = harness(same_key(&alice), BackendKind::Indexer);

    // Only visible through Bob's address history.
    let from_bob = chat_tx(&bob, &alice, "seen via bob", 1000, 11);
    let to_bob = chat_tx(&alice, &bob, "sent earlier", 700, 12);
    h.chain.add_tx(&from_bob, 20, &[&bob_addr]);
    h.chain.add_tx(&to_bob, 21, &[&bob_addr]);

    h.scanner.add_contact(&bob_hex, None).await.unwrap();
    let msgs = h.scanner.messages(&bob_hex);
    assert_eq!(msgs.len(), 2);
    assert!(msgs.iter().any(|m| m.text == "seen via bob" && !m.is_outgoing()));
    assert!(msgs.iter().any(|m| m.text == "sent earlier" && m.is_outgoing()));

    println!("✅ Contact history walk test passed");
}

#[tokio::test]
async fn test_remove_contact_drops_conversation() {
    println!("🧪 Testing contact removal...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let h = harness(same_key(&alice), BackendKind::Indexer);

    h.scanner.add_contact(&bob_hex, Some("Bob")).await.unwrap();
    h.chain.add_tx(&chat_tx(&bob, &alice, "bye", 1000, 13), 10, &[&alice_addr]);
    h.scanner.scan_tick(false).await.unwrap();
    assert_eq!(h.scanner.messages(&bob_hex).len(), 1);

    assert!(h.scanner.remove_contact(&bob_hex).unwrap());
    assert!(h.scanner.contacts().is_empty());
    assert!(h.scanner.messages(&bob_hex).is_empty());
    assert!(!h.scanner.remove_contact(&bob_hex).unwrap());

    println!("✅ Contact removal test passed");
}

#[tokio::test]
async fn test_read_marker_and_persistence() {
    println!("🧪 Testing last-seen markers survive a reload...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let kv = Arc::new(MemoryStore::new());
    let chain = MockChain::new(BackendKind::Indexer);

    {
        let h = scanner_for(same_key(&alice), chain.clone(), kv.clone(), WalletSettings::default());
        h.scanner.add_contact(&bob_hex, Some("Bob")).await.unwrap();
        h.chain.add_tx(&chat_tx(&bob, &alice, "remember me", 1000, 14), 10, &[&alice_addr]);
        h.scanner.scan_tick(false).await.unwrap();

        let ts = h.scanner.messages(&bob_hex)[0].timestamp;
        h.scanner.mark_read(&bob_hex, ts).unwrap();
        assert_eq!(h.scanner.last_seen(&bob_hex), Some(ts));
        assert_eq!(h.scanner.contacts()[0].unread, 0);
    }

    let h = scanner_for(same_key(&alice), chain, kv, WalletSettings::default());
    assert_eq!(h.scanner.messages(&bob_hex).len(), 1);
    assert_eq!(h.scanner.messages(&bob_hex)[0].text, "remember me");
    assert!(h.scanner.last_seen(&bob_hex).is_some());
    assert_eq!(h.scanner.contacts()[0].name, "Bob");

    println!("✅ Read marker persistence test passed");
}

#[tokio::test]
async fn test_retention_drops_old_messages() {
    println!("🧪 Testing retention window...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let bob_hex = bob.public_hex();
    let settings = WalletSettings { retention_days: 7, ..WalletSettings::default() };
    let h = scanner_for(same_key(&alice), MockChain::new(BackendKind::Legacy), Arc::new(MemoryStore::new()), settings);

    let now_secs = now_ms() / 1000;
    let old = chat_tx(&bob, &alice, "ancient", 1000, 15);
    let fresh = chat_tx(&bob, &alice, "recent", 1000, 16);
    h.chain.add_tx_at(&old, 10, &[&alice_addr], Some(now_secs - 30 * 24 * 3600));
    h.chain.add_tx_at(&fresh, 11, &[&alice_addr], Some(now_secs - 3600));
    h.scanner.scan_tick(false).await.unwrap();

    let msgs = h.scanner.messages(&bob_hex);
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].text, "ancient", "sorted oldest first");

    assert_eq!(h.scanner.enforce_retention().unwrap(), 1);
    let msgs = h.scanner.messages(&bob_hex);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].text, "recent");

    println!("✅ Retention test passed");
}
