//! Upstream transports.

mod dot;

pub use dot::DotConnector;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProxyError, Result};

/// Trait alias for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// An established, bidirectional upstream stream
pub type Transport = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Opens transports to upstream resolvers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new transport to `host` (a `host:port` string)
    async fn connect(&self, host: &str) -> Result<Transport>;
}

/// Split `host:port` into its parts. IPv6 literals may be bracketed.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let invalid = || ProxyError::InvalidUpstream(addr.to_string());

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;

    Ok((host, port))
}
