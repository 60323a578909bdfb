//! Pool of long-lived upstream connections.
//!
//! Connections are dialed once at startup and identified by a sequential id.
//! Availability is tracked only by the idle set: an id is idle when it is in
//! the set and checked out when it is not. A failed connection stays in the
//! pool and is replaced in place by [`ConnectionPool::refresh`].
//!
//! A connection is marked stale from the moment a query is written until its
//! answer has been read and matched. If the exchange is cut short by an
//! error, a timeout or cancellation, the mark stays and the transport must be
//! refreshed before it carries another query.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::frame::{read_frame, write_frame, Frame};
use crate::message::parse_question;
use crate::upstream::{Connector, Transport};

/// One upstream connection owned by the pool
struct PooledConnection {
    id: usize,
    host: String,
    transport: tokio::sync::Mutex<Transport>,
    /// An exchange on `transport` did not complete
    stale: AtomicBool,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<usize, Arc<PooledConnection>>,
    idle: HashSet<usize>,
}

/// Fixed set of upstream connections with fail-fast checkout
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    connector: Arc<dyn Connector>,
    io_timeout: Duration,
}

impl ConnectionPool {
    /// Dial every host in order. Hosts that fail are logged and skipped;
    /// the rest get ids 1..=N in the order given.
    pub async fn create(
        hosts: &[String],
        connector: Arc<dyn Connector>,
        io_timeout: Duration,
    ) -> Result<Self> {
        let mut state = PoolState::default();

        for host in hosts {
            match connector.connect(host).await {
                Ok(transport) => {
                    let id = state.connections.len() + 1;
                    state.connections.insert(
                        id,
                        Arc::new(PooledConnection {
                            id,
                            host: host.clone(),
                            transport: tokio::sync::Mutex::new(transport),
                            stale: AtomicBool::new(false),
                        }),
                    );
                    state.idle.insert(id);
                    info!("Upstream connection {} established to {}", id, host);
                }
                Err(e) => {
                    warn!("Failed to connect to upstream {}: {}", host, e);
                }
            }
        }

        if state.connections.is_empty() {
            return Err(ProxyError::NoUpstreamsAvailable);
        }

        info!(
            "Connection pool ready: {} of {} upstreams connected",
            state.connections.len(),
            hosts.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            connector,
            io_timeout,
        })
    }

    /// Check out any idle connection. Never waits: an empty idle set is an
    /// immediate [`ProxyError::NoIdleConnection`].
    pub fn acquire(&self) -> Result<Checkout<'_>> {
        let mut state = self.state.lock();

        // Any idle id will do
        let (id, connection) = state
            .idle
            .iter()
            .find_map(|id| state.connections.get(id).map(|c| (*id, c.clone())))
            .ok_or(ProxyError::NoIdleConnection)?;
        state.idle.remove(&id);

        debug!("Checked out connection {}, {} idle", id, state.idle.len());
        Ok(Checkout {
            pool: self,
            connection,
        })
    }

    /// Mark `id` idle again. Releasing an already idle id is a no-op;
    /// ids the pool never created are ignored.
    pub fn release(&self, id: usize) {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&id) {
            warn!("Ignoring release of unknown connection id {}", id);
            return;
        }
        state.idle.insert(id);
        debug!("Connection id {} is available", id);
    }

    /// Replace the transport of `id` with a fresh one to the same host.
    ///
    /// The dial runs without holding the pool lock. On failure the old
    /// transport stays installed, still marked stale, and the id remains in
    /// the pool.
    pub async fn refresh(&self, id: usize) -> Result<()> {
        let connection = self
            .state
            .lock()
            .connections
            .get(&id)
            .cloned()
            .ok_or(ProxyError::UnknownConnection(id))?;

        // Dial first, then swap under the connection's own lock
        let transport = self.connector.connect(&connection.host).await?;
        *connection.transport.lock().await = transport;
        connection.stale.store(false, Ordering::Release);

        info!("Connection {} to {} refreshed", id, connection.host);
        Ok(())
    }

    /// Number of connections in the pool
    pub fn len(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Host recorded for `id`
    pub fn host(&self, id: usize) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(&id)
            .map(|c| c.host.clone())
    }
}

/// A checked-out connection. Dropping it returns the id to the pool.
pub struct Checkout<'a> {
    pool: &'a ConnectionPool,
    connection: Arc<PooledConnection>,
}

impl Checkout<'_> {
    pub fn id(&self) -> usize {
        self.connection.id
    }

    pub fn host(&self) -> &str {
        &self.connection.host
    }

    /// Whether an earlier exchange on this connection was left unfinished
    pub fn is_stale(&self) -> bool {
        self.connection.stale.load(Ordering::Acquire)
    }

    /// Write `frame` to the upstream
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        // Cleared only once the matching answer has been read
        self.connection.stale.store(true, Ordering::Release);

        let mut transport = self.connection.transport.lock().await;
        tokio::time::timeout(self.pool.io_timeout, write_frame(&mut *transport, frame))
            .await
            .map_err(|_| ProxyError::Timeout("upstream write", self.pool.io_timeout))?
            .map_err(|e| ProxyError::upstream(self.host(), e))
    }

    /// Read the answer to `query` from the upstream.
    ///
    /// The answer must carry the query's transaction ID and first question;
    /// anything else is [`ProxyError::ResponseMismatch`] and leaves the
    /// connection stale.
    pub async fn receive(&self, query: &Frame) -> Result<Frame> {
        let response = {
            let mut transport = self.connection.transport.lock().await;
            tokio::time::timeout(self.pool.io_timeout, read_frame(&mut *transport))
                .await
                .map_err(|_| ProxyError::Timeout("upstream read", self.pool.io_timeout))??
        };

        // Check the answer belongs to this query
        let (expected_name, expected_id) = parse_question(query.body())?;
        let (name, id) = parse_question(response.body())?;
        if id != expected_id || name != expected_name {
            return Err(ProxyError::ResponseMismatch {
                expected: format!("{} id {}", expected_name, expected_id),
                got: format!("{} id {}", name, id),
            });
        }

        self.connection.stale.store(false, Ordering::Release);
        Ok(response)
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if self.is_stale() {
            debug!(
                "Connection {} released mid-exchange, refresh pending",
                self.connection.id
            );
        }
        self.pool.release(self.connection.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{answer, query_frame, Dial, MockConnector};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn hosts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("upstream{}.test:853", i)).collect()
    }

    async fn pool_with(connector: Arc<MockConnector>, n: usize) -> ConnectionPool {
        ConnectionPool::create(&hosts(n), connector, TIMEOUT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_skips_failed_hosts() {
        let connector = Arc::new(MockConnector::scripted(&[
            Dial::Serve,
            Dial::Refuse,
            Dial::Serve,
        ]));
        let pool = pool_with(connector, 3).await;

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.host(1).as_deref(), Some("upstream1.test:853"));
        assert_eq!(pool.host(2).as_deref(), Some("upstream3.test:853"));
        assert_eq!(pool.host(3), None);
    }

    #[tokio::test]
    async fn test_create_fails_without_upstreams() {
        let connector = Arc::new(MockConnector::scripted(&[Dial::Refuse, Dial::Refuse]));
        let result = ConnectionPool::create(&hosts(2), connector, TIMEOUT).await;
        assert!(matches!(result, Err(ProxyError::NoUpstreamsAvailable)));

        let result = ConnectionPool::create(&[], Arc::new(MockConnector::new()), TIMEOUT).await;
        assert!(matches!(result, Err(ProxyError::NoUpstreamsAvailable)));
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let pool = pool_with(Arc::new(MockConnector::new()), 3).await;

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        let ids: HashSet<usize> = held.iter().map(|c| c.id()).collect();
        assert_eq!(ids, HashSet::from([1, 2, 3]));

        assert!(matches!(pool.acquire(), Err(ProxyError::NoIdleConnection)));
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_release_restores_availability() {
        let pool = pool_with(Arc::new(MockConnector::new()), 1).await;

        let checkout = pool.acquire().unwrap();
        let id = checkout.id();
        assert!(pool.acquire().is_err());

        drop(checkout);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.acquire().unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = pool_with(Arc::new(MockConnector::new()), 2).await;

        pool.release(1);
        pool.release(1);
        pool.release(42);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let pool = pool_with(Arc::new(MockConnector::new()), 1).await;
        let query = query_frame("vao.com.", 7618);

        let checkout = pool.acquire().unwrap();
        checkout.send(&query).await.unwrap();
        let response = checkout.receive(&query).await.unwrap();
        assert_eq!(response, answer(&query));
    }

    #[tokio::test]
    async fn test_refresh_replaces_transport() {
        let connector = Arc::new(MockConnector::scripted(&[Dial::Dead]));
        let pool = pool_with(connector.clone(), 1).await;
        let query = query_frame("vao.com.", 1);

        let checkout = pool.acquire().unwrap();
        assert!(matches!(
            checkout.send(&query).await,
            Err(ProxyError::UpstreamIo { .. })
        ));

        pool.refresh(checkout.id()).await.unwrap();
        checkout.send(&query).await.unwrap();
        assert_eq!(checkout.receive(&query).await.unwrap(), answer(&query));
        assert_eq!(connector.dials(), 2);
        assert_eq!(pool.host(1).as_deref(), Some("upstream1.test:853"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_connection_in_pool() {
        let connector = Arc::new(MockConnector::scripted(&[Dial::Dead, Dial::Refuse]));
        let pool = pool_with(connector, 1).await;

        let checkout = pool.acquire().unwrap();
        let id = checkout.id();
        assert!(pool.refresh(id).await.is_err());
        assert!(checkout.send(&query_frame("a.", 1)).await.is_err());
        drop(checkout);

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.idle_count(), 1);

        // a later refresh can still recover the id
        pool.refresh(id).await.unwrap();
        let checkout = pool.acquire().unwrap();
        checkout.send(&query_frame("a.", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_unknown_id() {
        let pool = pool_with(Arc::new(MockConnector::new()), 1).await;
        assert!(matches!(
            pool.refresh(7).await,
            Err(ProxyError::UnknownConnection(7))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_are_exclusive() {
        let pool = Arc::new(pool_with(Arc::new(MockConnector::new()), 4).await);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                tokio::spawn(async move {
                    let Ok(checkout) = pool.acquire() else {
                        return;
                    };
                    assert!(in_use.lock().insert(checkout.id()));
                    let query = query_frame("vao.com.", i);
                    checkout.send(&query).await.unwrap();
                    assert_eq!(checkout.receive(&query).await.unwrap(), answer(&query));
                    assert!(in_use.lock().remove(&checkout.id()));
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.idle_count(), 4);
    }

    #[tokio::test]
    async fn test_read_timeout_leaves_connection_stale() {
        let connector = Arc::new(MockConnector::scripted(&[Dial::Delayed(
            Duration::from_millis(200),
        )]));
        let pool = ConnectionPool::create(&hosts(1), connector, Duration::from_millis(50))
            .await
            .unwrap();
        let query = query_frame("aaa.com.", 1);

        let checkout = pool.acquire().unwrap();
        assert!(!checkout.is_stale());
        checkout.send(&query).await.unwrap();
        assert!(matches!(
            checkout.receive(&query).await,
            Err(ProxyError::Timeout("upstream read", _))
        ));
        drop(checkout);

        // the id is back, but flagged for a refresh
        assert_eq!(pool.idle_count(), 1);
        let checkout = pool.acquire().unwrap();
        assert!(checkout.is_stale());

        pool.refresh(checkout.id()).await.unwrap();
        assert!(!checkout.is_stale());
        let query = query_frame("bbb.com.", 2);
        checkout.send(&query).await.unwrap();
        assert_eq!(checkout.receive(&query).await.unwrap(), answer(&query));
    }

    #[tokio::test]
    async fn test_late_answer_is_rejected() {
        let connector = Arc::new(MockConnector::scripted(&[Dial::Delayed(
            Duration::from_millis(100),
        )]));
        let pool = ConnectionPool::create(&hosts(1), connector, Duration::from_millis(50))
            .await
            .unwrap();
        let checkout = pool.acquire().unwrap();

        let first = query_frame("aaa.com.", 1);
        checkout.send(&first).await.unwrap();
        assert!(checkout.receive(&first).await.is_err());
        tokio::time::sleep(Duration::from_millis(150)).await;

        // the answer to the first query is still queued on the transport
        let second = query_frame("bbb.com.", 2);
        checkout.send(&second).await.unwrap();
        let err = checkout.receive(&second).await.unwrap_err();
        assert!(matches!(err, ProxyError::ResponseMismatch { .. }));
        assert!(err.to_string().contains("aaa.com. id 1"));
        assert!(checkout.is_stale());
    }

    #[tokio::test]
    async fn test_interrupted_send_leaves_connection_stale() {
        let connector = Arc::new(MockConnector::scripted(&[Dial::Delayed(
            Duration::from_secs(5),
        )]));
        let pool = pool_with(connector, 1).await;
        let query = query_frame("aaa.com.", 1);

        {
            let checkout = pool.acquire().unwrap();
            checkout.send(&query).await.unwrap();
            // dropped before the answer arrives
            let _ = tokio::time::timeout(Duration::from_millis(20), checkout.receive(&query)).await;
        }

        assert_eq!(pool.idle_count(), 1);
        assert!(pool.acquire().unwrap().is_stale());
    }
}
