use crate::message::now_ms;
use crate::metrics;
use crate::scanner::{Balance, ChainScanner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::Receiver;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, Duration, MissedTickBehavior};

pub const SCAN_INTERVAL_SECS: u64 = 3;
pub const BALANCE_INTERVAL_SECS: u64 = 2;
const RETENTION_INTERVAL_SECS: u64 = 3600;

// Per-tick logs are noisy; gate behind a static flag disabled by default.
static ALLOW_ROUTINE_SYNC: AtomicBool = AtomicBool::new(false);
macro_rules! sync_routine {
    ($($arg:tt)*) => {
        if ALLOW_ROUTINE_SYNC.load(Ordering::Relaxed) { tracing::info!($($arg)*); }
    };
}

pub fn set_verbose(verbose: bool) {
    ALLOW_ROUTINE_SYNC.store(verbose, Ordering::Relaxed);
}

/// Receives every balance refresh that differs from the previous one.
pub type BalanceCallback = Arc<dyn Fn(Balance) + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct SyncState {
    pub balance: Option<Balance>,
    pub balance_error: Option<String>,
    pub last_scan_ms: Option<u64>,
    pub last_error: Option<String>,
    pub scans: u64,
}

/// Run the scan and retention loop, with the balance refresh on its own task,
/// until a shutdown signal arrives.
pub fn spawn(
    scanner: Arc<ChainScanner>,
    sync_state: Arc<Mutex<SyncState>>,
    on_balance: Option<BalanceCallback>,
    mut shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    let balance_task = spawn_balance(scanner.clone(), sync_state.clone(), on_balance, shutdown_rx.resubscribe());

    task::spawn(async move {
        let mut scan_timer = interval(Duration::from_secs(SCAN_INTERVAL_SECS));
        let mut retention_timer = interval(Duration::from_secs(RETENTION_INTERVAL_SECS));
        scan_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("🛑 Sync task received shutdown signal");
                    break;
                }

                _ = scan_timer.tick() => {
                    match scanner.scan_tick(false).await {
                        Ok(report) => {
                            sync_routine!("🔎 Scanned {} history entries", report.entries);
                            if let Ok(mut st) = sync_state.lock() {
                                st.last_scan_ms = Some(now_ms());
                                st.last_error = None;
                                st.scans += 1;
                            }
                        }
                        Err(e) => {
                            metrics::SCAN_ERRORS.inc();
                            tracing::warn!("⚠️  Scan failed: {e}");
                            if let Ok(mut st) = sync_state.lock() {
                                st.last_error = Some(e.to_string());
                            }
                        }
                    }
                }

                _ = retention_timer.tick() => {
                    if let Err(e) = scanner.enforce_retention() {
                        tracing::warn!("⚠️  Retention pass failed: {e}");
                    }
                }
            }
        }

        let _ = balance_task.await;
        tracing::info!("✅ Sync task shutdown complete");
    })
}

fn spawn_balance(
    scanner: Arc<ChainScanner>,
    sync_state: Arc<Mutex<SyncState>>,
    on_balance: Option<BalanceCallback>,
    mut shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut balance_timer = interval(Duration::from_secs(BALANCE_INTERVAL_SECS));
        balance_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,

                _ = balance_timer.tick() => {
                    match scanner.balance().await {
                        Ok(balance) => {
                            let changed = match sync_state.lock() {
                                Ok(mut st) => {
                                    st.balance_error = None;
                                    st.balance.replace(balance) != Some(balance)
                                }
                                Err(_) => false,
                            };
                            if changed {
                                sync_routine!("💰 Balance {} sat ({} spendable)", balance.total.to_sat(), balance.spendable.to_sat());
                                if let Some(cb) = &on_balance {
                                    cb(balance);
                                }
                            }
                        }
                        Err(e) => {
                            let message = e.to_string();
                            let repeated = match sync_state.lock() {
                                Ok(mut st) => st.balance_error.replace(message.clone()).as_deref() == Some(message.as_str()),
                                Err(_) => false,
                            };
                            // Repeats of the same failure log at debug.
                            if repeated {
                                tracing::debug!("⚠️  Balance refresh failed: {message}");
                            } else {
                                tracing::warn!("⚠️  Balance refresh failed: {message}");
                            }
                        }
                    }
                }
            }
        }
    })
}
