//! Per-connection query pipeline.
//!
//! Each client connection carries one length-prefixed query. Cached answers
//! are replayed with the client's transaction ID; misses are forwarded to a
//! pooled upstream connection and the answer is cached by query name.
//! Failures close the connection without sending a DNS error response.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::ResponseCache;
use crate::error::{ProxyError, Result};
use crate::frame::{read_frame, write_frame, Frame};
use crate::message::{parse_question, rewrite_transaction_id};
use crate::pool::ConnectionPool;

/// Shared state of all sessions: the upstream pool and the response cache
pub struct Proxy {
    pool: ConnectionPool,
    cache: ResponseCache,
    client_timeout: Duration,
}

impl Proxy {
    /// `client_timeout` bounds reading the query from and writing the
    /// answer to the client.
    pub fn new(pool: ConnectionPool, cache: ResponseCache, client_timeout: Duration) -> Self {
        Self {
            pool,
            cache,
            client_timeout,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Serve a single client connection until its query is answered, an
    /// error occurs, or `cancel` fires. The stream is closed on return.
    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            result = self.exchange(&mut stream) => result,
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        }
    }

    async fn exchange<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Read the length-prefixed query
        let query = tokio::time::timeout(self.client_timeout, read_frame(stream))
            .await
            .map_err(|_| ProxyError::Timeout("client read", self.client_timeout))??;

        let (name, id) = parse_question(query.body())?;
        debug!("Query for {} (id {})", name, id);

        // Cache first, upstream on miss
        let response = match self.cache.get(&name) {
            Ok(cached) => {
                debug!("Answering {} from cache", name);
                rewrite_transaction_id(&cached, id)?
            }
            Err(_) => self.forward(&name, &query).await?,
        };

        // Reply and close
        tokio::time::timeout(self.client_timeout, write_frame(stream, &response))
            .await
            .map_err(|_| ProxyError::Timeout("client write", self.client_timeout))?
            .map_err(ProxyError::ClientIo)?;

        trace!(records = ?self.cache.list_names(), "Cache records");
        Ok(())
    }

    /// Send `query` upstream and cache the answer under `name`.
    ///
    /// A connection left mid-exchange by an earlier session is refreshed
    /// before use. A failed write triggers one refresh of the same connection
    /// and one more write. The checkout is released on every path.
    async fn forward(&self, name: &str, query: &Frame) -> Result<Frame> {
        let checkout = self.pool.acquire()?;
        debug!("Forwarding {} via connection {} ({})", name, checkout.id(), checkout.host());

        // An unread answer may still be queued on a stale transport
        if checkout.is_stale() {
            debug!("Connection {} is stale, refreshing", checkout.id());
            self.pool.refresh(checkout.id()).await?;
        }

        // Write the query, retrying once on a fresh transport
        if let Err(e) = checkout.send(query).await {
            warn!(
                "Upstream connection {} failed: {}, refreshing",
                checkout.id(),
                e
            );
            self.pool.refresh(checkout.id()).await?;
            checkout.send(query).await?;
            info!("Upstream connection {} recovered after refresh", checkout.id());
        }

        let response = checkout.receive(query).await?;

        // A failed insert still answers the client
        if let Err(e) = self.cache.put(name, response.clone()) {
            warn!("Failed to cache response for {}: {}", name, e);
        }

        Ok(response)
    }
}
