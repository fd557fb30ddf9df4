//! Demo worker: serves a couple of functions and an echo channel over stdio.
//!
//! Run under a host with `HostBridge::spawn`. Logs go to stderr.

use anyhow::Context;
use stdbridge::logging::init_tracing;
use stdbridge::{WorkerBridge, WorkerConfig};

fn add(params: Vec<i64>, _: Option<()>) -> i64 {
    params.iter().sum()
}

async fn find_longer(params: Vec<String>, context: Option<String>) -> String {
    tracing::debug!(context = context.as_deref(), "find_longer called");
    params
        .into_iter()
        .reduce(|longest, candidate| {
            if candidate.len() > longest.len() {
                candidate
            } else {
                longest
            }
        })
        .unwrap_or_default()
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "stdbridge demo worker");

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let result = runtime.block_on(serve(config));
    // The stdin reader may still be parked in a blocking read; don't wait on it.
    runtime.shutdown_background();
    result
}

async fn serve(config: WorkerConfig) -> anyhow::Result<()> {
    let bridge = WorkerBridge::stdio_with_config(config);
    bridge.register("add", add, None)?;
    bridge.register_async("find_longer", find_longer, Some("demo".to_string()))?;

    let echo = bridge.clone();
    bridge.on("channel_a", move |payload| {
        if let Err(e) = echo.send("channel_echo", payload) {
            tracing::warn!(error = %e, "Echo failed");
        }
    });

    bridge.wait_until_closed().await;
    tracing::info!("Demo worker exiting");
    Ok(())
}
