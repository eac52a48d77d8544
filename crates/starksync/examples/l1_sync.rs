//! Example: run the synchronizer against an Ethereum node and a feeder gateway, in memory.
//!
//! Usage: cargo run -p starksync --example l1_sync -- --http-url URL --feeder-url URL [--ws-url WS_URL] [--window N] [--relaxed]
//!
//! Logs resolved facts and applied blocks; Ctrl-C stops it cleanly.

use starksync::{FactStatus, MemoryStore, SyncConfig, SyncContext, Synchronizer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args: Vec<String> = std::env::args().collect();
    let mut http_url = String::new();
    let mut ws_url = String::new();
    let mut feeder_url = String::new();
    let mut window: Option<u64> = None;
    let mut relaxed = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--ws-url" => {
                i += 1;
                ws_url = args.get(i).cloned().unwrap_or_default();
            }
            "--feeder-url" => {
                i += 1;
                feeder_url = args.get(i).cloned().unwrap_or_default();
            }
            "--window" => {
                i += 1;
                window = args.get(i).and_then(|s| s.parse().ok());
            }
            "--relaxed" => relaxed = true,
            _ => {}
        }
        i += 1;
    }
    if http_url.is_empty() || feeder_url.is_empty() {
        eprintln!("Usage: l1_sync --http-url URL --feeder-url URL [--ws-url WS_URL] [--window N] [--relaxed]");
        std::process::exit(1);
    }

    let mut config = SyncConfig::new(http_url, feeder_url);
    if !ws_url.is_empty() {
        config.l1.ws_url = ws_url;
    }
    if let Some(w) = window {
        config.l1.window_size = w;
    }
    config.resolution.strict_order = !relaxed;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let ctx = SyncContext::connect(Arc::new(MemoryStore::new()), config);
        let handle = Synchronizer::start(ctx).await?;
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pending = handle.ledger().pending();
                    let waiting = pending
                        .iter()
                        .filter(|f| matches!(handle.ledger().status(f), Ok(FactStatus::Observed)))
                        .count();
                    tracing::info!(pending = pending.len(), waiting_for_pages = waiting, "status");
                    if !handle.is_running() {
                        tracing::error!("a task stopped, shutting down");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        handle.shutdown().await?;
        Ok::<(), anyhow::Error>(())
    })
}
