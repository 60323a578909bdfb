//! TCP listener.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::Proxy;

/// DNS server that accepts DNS-over-TCP clients
pub struct DnsServer {
    listen_addr: SocketAddr,
    proxy: Arc<Proxy>,
}

impl DnsServer {
    pub fn new(listen_addr: SocketAddr, proxy: Arc<Proxy>) -> Self {
        Self { listen_addr, proxy }
    }

    /// Bind the listen address and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener`, one task per connection. On
    /// shutdown the loop stops and in-flight sessions are cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("TCP DNS server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DNS server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, src)) => {
                        let proxy = self.proxy.clone();
                        let cancel = shutdown.child_token();

                        tokio::spawn(async move {
                            debug!("Start processing request from {}", src);
                            match proxy.handle_connection(stream, &cancel).await {
                                Ok(()) => debug!("Finished processing request from {}", src),
                                Err(e) => {
                                    warn!("Failed to handle TCP connection from {}: {}", src, e)
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("TCP accept error on {}: {}", self.listen_addr, e);
                    }
                }
            }
        }

        Ok(())
    }
}
