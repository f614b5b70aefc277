//! minihttpd: an epoll-driven HTTP/1.1 static file server
//!
//! Features:
//! - Static file serving with memory-mapped bodies
//! - Keep-alive connections with idle-timeout eviction
//! - Form-based register/login pages backed by a credential store
//! - A single poller thread feeding a worker thread pool
//! - Configuration via CLI arguments or TOML file

mod buffer;
mod config;
mod http;
mod pool;
mod server;
mod timer;
mod users;

use std::sync::Arc;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;
use users::MemoryUserStore;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        root = %config.root.display(),
        timeout_ms = config.timeout_ms,
        edge_triggered = config.edge_triggered,
        "Starting minihttpd"
    );

    let store = Arc::new(MemoryUserStore::new());
    let server = Server::new(&config, store)?;
    server.run()?;
    Ok(())
}
