//! The contract the relay needs from an established connection.
//!
//! The relay never touches sockets directly. Outbound text goes through an
//! [`Endpoint`] and inbound text arrives as a stream of
//! `Result<String, ConnectionError>` that ends when the peer goes away.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

/// Sending half of one connection.
///
/// The relay awaits one `send` at a time per endpoint, in queue order, so
/// implementations see messages in the order they were routed. A `send` may
/// take as long as the peer needs; only that member's queue waits on it.
pub trait Endpoint: Send + Sync + 'static {
    fn send(&self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>>;
}

pub type SharedEndpoint = Arc<dyn Endpoint>;
