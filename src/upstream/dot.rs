//! DNS over TLS (DOT) dialer.

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::{split_host_port, Connector, Transport};
use crate::error::{ProxyError, Result};

/// Opens TLS connections to DOT upstreams
pub struct DotConnector {
    tls_connector: TlsConnector,
    timeout: Duration,
}

impl DotConnector {
    /// Create a dialer that verifies servers against the webpki roots.
    /// `timeout` bounds the TCP connect and the TLS handshake separately.
    pub fn new(timeout: Duration) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for DotConnector {
    async fn connect(&self, host: &str) -> Result<Transport> {
        let (hostname, _) = split_host_port(host)?;
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| ProxyError::InvalidUpstream(host.to_string()))?;

        trace!("Connecting to DOT server {}", host);
        let tcp_stream = tokio::time::timeout(self.timeout, TcpStream::connect(host))
            .await
            .map_err(|_| ProxyError::Timeout("TCP connect", self.timeout))?
            .map_err(|e| ProxyError::upstream(host, e))?;
        tcp_stream
            .set_nodelay(true)
            .map_err(|e| ProxyError::upstream(host, e))?;

        let tls_stream = tokio::time::timeout(
            self.timeout,
            self.tls_connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| ProxyError::Timeout("TLS handshake", self.timeout))?
        .map_err(|e| ProxyError::upstream(host, e))?;

        debug!(server = %host, "TLS connection established");
        Ok(Box::new(tls_stream))
    }
}
