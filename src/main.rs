#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch causes jemalloc to evaluate all decay windows
    // and release dirty pages back to the OS via its background purge logic.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced — dirty pages scheduled for release");
}

mod config;
mod error;
mod executor;
mod gateway;
mod ingest;
mod monitor;
mod numeric;
mod scheduler;
mod signing;
mod types;
mod webhook;

use std::sync::Arc;

use config::{DEFAULT_BACKLOG_CAPACITY, DEFAULT_CONFIG_PATH, DEFAULT_LISTEN_ADDR};
use executor::Executor;
use gateway::BitunixClient;
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let api_key = std::env::var("BITUNIX_API_KEY").expect("BITUNIX_API_KEY must be set");
    let api_secret = std::env::var("BITUNIX_API_SECRET").expect("BITUNIX_API_SECRET must be set");
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let listen_addr: std::net::SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .expect("LISTEN_ADDR must be a valid socket address");

    let pair_config = config::load_config(std::path::Path::new(&config_path))?;
    log::info!("loaded configuration for {} symbol(s) from {}", pair_config.len(), config_path);

    let gateway = BitunixClient::new(api_key, api_secret);
    let executor = Arc::new(Executor::new(gateway, pair_config));
    let scheduler = Arc::new(Scheduler::new(executor, DEFAULT_BACKLOG_CAPACITY));

    let server_scheduler = scheduler.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = webhook::serve(listen_addr, server_scheduler).await {
            log::error!("webhook server exited: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received — stopping all symbol workers");
            scheduler.stop_all();
        }
        _ = server => {
            log::error!("webhook server task ended unexpectedly");
        }
    }

    #[cfg(feature = "jemalloc")]
    jemalloc_purge();

    Ok(())
}
