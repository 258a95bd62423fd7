// Wallet session: open, keystore, background sync and logout.

mod common;

use bitcoin::Amount;
use chainchat::backend::BackendKind;
use chainchat::config::{self, Config, WalletSettings};
use chainchat::crypto::KdfParams;
use chainchat::error::{ChatError, ServiceState};
use chainchat::keys;
use chainchat::scanner::Balance;
use chainchat::storage::MemoryStore;
use chainchat::sync::BalanceCallback;
use chainchat::Wallet;
use common::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FAST_KDF: KdfParams = KdfParams { mem_kib: 1024, time_cost: 1 };

/// Bundled config pointed at a port nothing listens on.
fn offline_config() -> Config {
    let mut cfg = config::load_or_default(None).unwrap();
    cfg.backend.host = "127.0.0.1".into();
    cfg.backend.port = 1;
    cfg.backend.tls = false;
    cfg.backend.timeout_secs = 2;
    cfg
}

#[tokio::test]
async fn test_open_remember_logout() {
    println!("🧪 Testing wallet open, keystore save and logout...");

    let kv = Arc::new(MemoryStore::new());
    let mut wallet = Wallet::new(offline_config(), kv.clone());
    assert_eq!(wallet.state(), &ServiceState::Uninitialized);
    assert!(matches!(wallet.scanner(), Err(ChatError::NotReady(ServiceState::Uninitialized))));
    assert!(!wallet.has_saved_session());

    let alice = keys::generate();
    let chain = MockChain::new(BackendKind::Indexer);
    let settings = WalletSettings { retention_days: 14, ..WalletSettings::default() };
    let scanner = wallet.open_with_backend(settings, same_key(&alice), chain).await.unwrap();
    assert_eq!(wallet.state(), &ServiceState::Ready);
    assert_eq!(scanner.address(), address_of(&alice));
    assert_eq!(wallet.settings().retention_days, 14, "settings are stored on open");

    wallet.remember("hunter2", FAST_KDF).unwrap();
    assert!(wallet.has_saved_session());

    wallet.logout(false).await.unwrap();
    assert_eq!(wallet.state(), &ServiceState::Uninitialized);
    assert!(wallet.scanner().is_err());
    assert!(wallet.has_saved_session(), "logout without forget keeps the keystore");

    println!("✅ Open/remember/logout test passed");
}

#[tokio::test]
async fn test_restore_reports_backend_failure() {
    println!("🧪 Testing restore against an unreachable backend...");

    let kv = Arc::new(MemoryStore::new());
    let mut wallet = Wallet::new(offline_config(), kv.clone());
    assert!(wallet.restore("anything").await.unwrap().is_none(), "nothing saved yet");

    let alice = keys::generate();
    wallet
        .open_with_backend(WalletSettings::default(), same_key(&alice), MockChain::new(BackendKind::Indexer))
        .await
        .unwrap();
    wallet.remember("hunter2", FAST_KDF).unwrap();
    wallet.logout(false).await.unwrap();

    let err = wallet.restore("not it").await.unwrap_err();
    assert!(matches!(err, ChatError::Storage(_)), "got {err:?}");

    let err = wallet.restore("hunter2").await.unwrap_err();
    assert!(err.is_connection(), "got {err:?}");
    let text = err.to_string();
    assert!(text.contains("ElectrumX Connection Failed"), "got {text}");
    assert!(text.contains("(Key is valid locally)"));
    assert!(matches!(wallet.state(), ServiceState::Failed(_)));

    wallet.logout(true).await.unwrap();
    assert!(!wallet.has_saved_session(), "forget clears the keystore");

    println!("✅ Restore failure test passed");
}

#[tokio::test]
async fn test_open_rejects_bad_wif() {
    println!("🧪 Testing open with a malformed key...");

    let mut wallet = Wallet::new(offline_config(), Arc::new(MemoryStore::new()));
    let err = wallet.open(WalletSettings::default(), "not-a-wif").await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidKeyFormat(_)), "got {err:?}");
    assert!(matches!(wallet.state(), ServiceState::Failed(_)));

    println!("✅ Bad WIF test passed");
}

#[tokio::test]
async fn test_background_sync() {
    println!("🧪 Testing background scan and balance loops...");

    let alice = keys::generate();
    let bob = keys::generate();
    let alice_addr = address_of(&alice);
    let chain = MockChain::new(BackendKind::Indexer);
    chain.fund(&alice_addr, 0x31, 5000, 10);
    chain.add_tx(&chat_tx(&bob, &alice, "while you were away", 1000, 32), 50, &[&alice_addr]);

    let mut wallet = Wallet::new(offline_config(), Arc::new(MemoryStore::new()));
    let scanner = wallet
        .open_with_backend(WalletSettings::default(), same_key(&alice), chain)
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<Balance>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: BalanceCallback = Arc::new(move |b: Balance| sink.lock().unwrap().push(b));
    wallet.start_sync(Some(callback)).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = wallet.sync_state();
    assert!(state.scans >= 1, "first scan runs immediately");
    assert!(state.last_error.is_none());
    assert_eq!(state.balance.map(|b| b.total), Some(Amount::from_sat(5000)));
    assert_eq!(seen.lock().unwrap().len(), 1, "callback fires once per change");
    assert_eq!(scanner.messages(&bob.public_hex())[0].text, "while you were away");

    wallet.logout(false).await.unwrap();
    assert_eq!(wallet.sync_state().scans, 0);

    println!("✅ Background sync test passed");
}

#[tokio::test]
async fn test_balance_refresh_not_blocked_by_slow_scan() {
    println!("🧪 Testing balance refresh while a scan is stalled...");

    let alice = keys::generate();
    let alice_addr = address_of(&alice);
    let chain = MockChain::new(BackendKind::Indexer);
    chain.fund(&alice_addr, 0x32, 5000, 10);
    chain.delay_history(Duration::from_secs(2));

    let mut wallet = Wallet::new(offline_config(), Arc::new(MemoryStore::new()));
    wallet
        .open_with_backend(WalletSettings::default(), same_key(&alice), chain)
        .await
        .unwrap();
    wallet.start_sync(None).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = wallet.sync_state();
    assert_eq!(state.scans, 0, "first scan is still waiting on history");
    assert_eq!(state.balance.map(|b| b.total), Some(Amount::from_sat(5000)));

    wallet.logout(false).await.unwrap();

    println!("✅ Independent balance refresh test passed");
}

#[tokio::test]
async fn test_balance_failure_is_recorded_and_recovers() {
    println!("🧪 Testing balance refresh failure and recovery...");

    let alice = keys::generate();
    let alice_addr = address_of(&alice);
    let chain = MockChain::new(BackendKind::Indexer);
    chain.fund(&alice_addr, 0x33, 7000, 10);
    chain.fail_unspent_with(Some("server went away"));

    let mut wallet = Wallet::new(offline_config(), Arc::new(MemoryStore::new()));
    wallet
        .open_with_backend(WalletSettings::default(), same_key(&alice), chain.clone())
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<Balance>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: BalanceCallback = Arc::new(move |b: Balance| sink.lock().unwrap().push(b));
    wallet.start_sync(Some(callback)).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = wallet.sync_state();
    assert!(state.balance.is_none());
    let err = state.balance_error.expect("failure is recorded");
    assert!(err.contains("server went away"), "got {err}");
    assert!(seen.lock().unwrap().is_empty());
    assert!(state.last_error.is_none(), "scans are unaffected");

    chain.fail_unspent_with(None);
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let state = wallet.sync_state();
    assert!(state.balance_error.is_none());
    assert_eq!(state.balance.map(|b| b.total), Some(Amount::from_sat(7000)));
    assert_eq!(seen.lock().unwrap().len(), 1);

    wallet.logout(false).await.unwrap();

    println!("✅ Balance failure test passed");
}
