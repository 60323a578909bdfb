//! dotproxy - caching DNS-over-TCP to DNS-over-TLS forwarder.

// Use jemalloc as the global allocator (Linux/macOS only, better performance)
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use dotproxy::{Config, ConnectionPool, DnsServer, DotConnector, Proxy, ResponseCache};

/// Caching DNS-over-TCP proxy with DNS-over-TLS upstreams.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config;

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.server.log_level);

    info!("Starting dotproxy");
    info!("Config loaded from: {:?}", config_path);
    for host in &config.upstream.hosts {
        info!("Upstream: {}", host);
    }

    let timeout = config.upstream.timeout();
    let connector = Arc::new(DotConnector::new(timeout));
    let pool = ConnectionPool::create(&config.upstream.hosts, connector, timeout)
        .await
        .context("Failed to create upstream connection pool")?;

    let proxy = Arc::new(Proxy::new(
        pool,
        ResponseCache::new(),
        config.server.client_timeout(),
    ));
    let server = DnsServer::new(config.server.listen_addr(), proxy.clone());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C, shutting down");
        signal.cancel();
    });

    server.run(shutdown).await?;

    let stats = proxy.cache().stats();
    info!(
        "Cache: {} entries, {} hits, {} misses ({:.1}% hit rate)",
        stats.entries,
        stats.hits,
        stats.misses,
        stats.hit_rate()
    );

    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(!cfg!(windows))
        .init();
}
