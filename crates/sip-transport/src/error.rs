//! Error types for the transport layer

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the UDP transport
///
/// These are the only failures in the engine that are fatal to the whole
/// client rather than to a single call or transaction.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not bind the local socket
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    /// Sending a datagram failed
    #[error("failed to send datagram to {destination}: {source}")]
    Send {
        destination: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The transport has been closed
    #[error("transport closed")]
    Closed,

    /// Local address lookup failed
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}
