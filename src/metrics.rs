use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::thread;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric name is valid");
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
}

pub static SCAN_TICKS: Lazy<IntCounter> = Lazy::new(|| counter("chainchat_scan_ticks_total", "Completed scan passes"));
pub static SCAN_ERRORS: Lazy<IntCounter> = Lazy::new(|| counter("chainchat_scan_errors_total", "Scan passes that failed"));
pub static MESSAGES_RECEIVED: Lazy<IntCounter> =
    Lazy::new(|| counter("chainchat_messages_received_total", "Incoming messages added"));
pub static MESSAGES_SENT: Lazy<IntCounter> =
    Lazy::new(|| counter("chainchat_messages_sent_total", "Messages broadcast from this wallet"));
pub static BROADCAST_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("chainchat_broadcast_failures_total", "Broadcasts rejected by the backend"));
pub static TX_FETCHED: Lazy<IntCounter> =
    Lazy::new(|| counter("chainchat_tx_fetched_total", "Raw transactions fetched from the backend"));
pub static BALANCE_SAT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("chainchat_balance_sat", "Last observed wallet balance in satoshis")
        .expect("metric name is valid");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
});

/// Encode every registered metric in the text exposition format.
pub fn render() -> Vec<u8> {
    let mut buffer = vec![];
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer).is_err() {
        tracing::error!("🔥 Could not encode metrics");
    }
    buffer
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    // Touch the statics so they show up before the first increment.
    Lazy::force(&SCAN_TICKS);
    Lazy::force(&SCAN_ERRORS);
    Lazy::force(&MESSAGES_RECEIVED);
    Lazy::force(&MESSAGES_SENT);
    Lazy::force(&BROADCAST_FAILURES);
    Lazy::force(&TX_FETCHED);
    Lazy::force(&BALANCE_SAT);

    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {e}", cfg.bind))?;
    let header: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("bad metrics content type"))?;
    tracing::info!("📈 Metrics listening on http://{}/metrics", cfg.bind);

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = tiny_http::Response::from_data(render()).with_header(header.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
