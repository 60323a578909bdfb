//! dotproxy - a caching DNS-over-TCP proxy with DNS-over-TLS upstreams.
//!
//! Clients send length-prefixed DNS queries over plain TCP. Each query name
//! is looked up in an in-memory [`ResponseCache`]; misses are forwarded over
//! one of a fixed set of pooled TLS connections ([`ConnectionPool`]) and the
//! answer is cached under the query name. Cached answers are replayed with
//! the new query's transaction ID.

pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod pool;
pub mod server;
pub mod session;
pub mod upstream;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, ResponseCache};
pub use config::Config;
pub use error::{ProxyError, Result};
pub use frame::Frame;
pub use pool::ConnectionPool;
pub use server::DnsServer;
pub use session::Proxy;
pub use upstream::{Connector, DotConnector};
