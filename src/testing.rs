//! In-memory upstreams for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::duplex;

use crate::error::{ProxyError, Result};
use crate::frame::{read_frame, write_frame, Frame};
use crate::upstream::{Connector, Transport};

/// What the next dial produces
#[derive(Clone, Copy, Debug)]
pub enum Dial {
    /// A live upstream that answers every query
    Serve,
    /// A live upstream that waits this long before each answer
    Delayed(Duration),
    /// A transport whose peer is already gone; writes fail
    Dead,
    /// The dial itself fails
    Refuse,
}

/// Connector that hands out in-memory transports following a script.
/// Once the script runs out every dial is [`Dial::Serve`].
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<Dial>>,
    dials: AtomicUsize,
    served: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(dials: &[Dial]) -> Self {
        let connector = Self::new();
        connector.script.lock().extend(dials.iter().copied());
        connector
    }

    /// Number of connect calls so far
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Number of queries answered by live upstreams
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Spawn an upstream that answers every query after `delay`
    fn serve(&self, delay: Duration) -> Transport {
        let (client, mut server) = duplex(64 * 1024);
        let served = self.served.clone();
        tokio::spawn(async move {
            while let Ok(query) = read_frame(&mut server).await {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                served.fetch_add(1, Ordering::SeqCst);
                if write_frame(&mut server, &answer(&query)).await.is_err() {
                    break;
                }
            }
        });
        Box::new(client)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str) -> Result<Transport> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let dial = self.script.lock().pop_front().unwrap_or(Dial::Serve);

        match dial {
            Dial::Refuse => Err(ProxyError::upstream(
                host,
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            )),
            Dial::Dead => {
                let (client, server) = duplex(64 * 1024);
                drop(server);
                Ok(Box::new(client))
            }
            Dial::Serve => Ok(self.serve(Duration::ZERO)),
            Dial::Delayed(delay) => Ok(self.serve(delay)),
        }
    }
}

/// The response a live mock upstream gives: the query with the QR bit set
pub fn answer(query: &Frame) -> Frame {
    let mut body = query.body().to_vec();
    if body.len() > 2 {
        body[2] |= 0x80;
    }
    Frame::encode(&body).unwrap()
}

/// `name IN A` query frame with transaction `id`
pub fn query_frame(name: &str, id: u16) -> Frame {
    let mut body = Vec::new();
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&[1, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.trim_end_matches('.').split('.') {
        body.push(label.len() as u8);
        body.extend_from_slice(label.as_bytes());
    }
    body.extend_from_slice(&[0, 0, 1, 0, 1]);
    Frame::encode(&body).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_frame_matches_wire_capture() {
        let frame = query_frame("vao.com.", 7618);
        assert_eq!(
            frame.as_bytes(),
            &[
                0, 25, 29, 194, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 3, 118, 97, 111, 3, 99, 111, 109, 0,
                0, 1, 0, 1
            ][..]
        );
    }
}
