//! UDP transport for sipline SIP messages
//!
//! The signaling engine talks to exactly one provider over one UDP socket.
//! This crate owns that socket: it parses every inbound datagram once and
//! hands the result to the engine over an mpsc channel, and serializes
//! every outbound message onto the wire. Malformed datagrams are dropped
//! with a warning; UDP gives us nobody to complain to.

pub mod error;
pub mod udp;

pub use error::{Error, Result};
pub use udp::{Transport, TransportEvent, UdpTransport};

/// Bind a UDP transport to the specified address
pub async fn bind_udp(
    addr: std::net::SocketAddr,
) -> Result<(UdpTransport, tokio::sync::mpsc::Receiver<TransportEvent>)> {
    UdpTransport::bind(addr, None).await
}
