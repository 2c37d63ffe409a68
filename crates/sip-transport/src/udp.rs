//! The single UDP endpoint of the signaling engine

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sipline_sip_core::SipMessage;

use crate::error::{Error, Result};

// Default channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

// Large enough for any SIP datagram we expect from a single provider.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Events produced by the receive loop
#[derive(Debug)]
pub enum TransportEvent {
    /// A datagram parsed into a SIP message
    MessageReceived {
        message: SipMessage,
        source: SocketAddr,
    },
    /// A socket-level receive error
    Error { error: String },
    /// The transport has shut down
    Closed,
}

/// Transport abstraction for sending SIP messages
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;
    async fn send_message(&self, message: &SipMessage, destination: SocketAddr) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

/// UDP transport for SIP messages
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Creates a new UDP transport bound to the specified address
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let socket = UdpSocket::bind(addr).await.map_err(Error::Bind)?;
        let local_addr = socket.local_addr().map_err(Error::LocalAddr)?;
        info!("SIP UDP transport bound to {}", local_addr);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Arc::new(socket),
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };

        transport.spawn_receive_loop();

        Ok((transport, events_rx))
    }

    // Spawns a task that parses each inbound datagram once and forwards it
    // to the engine. Unparseable packets are dropped silently apart from a
    // warning; no error is ever sent back over the wire.
    fn spawn_receive_loop(&self) {
        let transport = self.clone();

        tokio::spawn(async move {
            let inner = &transport.inner;
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            while !inner.closed.load(Ordering::Relaxed) {
                match inner.socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        debug!("received {} bytes from {}", len, source);

                        match SipMessage::parse(&buf[..len]) {
                            Ok(message) => {
                                let event = TransportEvent::MessageReceived { message, source };
                                if inner.events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("dropping unparseable datagram from {}: {}", source, e);
                            }
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = inner
                            .events_tx
                            .send(TransportEvent::Error {
                                error: format!("error receiving datagram: {}", e),
                            })
                            .await;
                    }
                }
            }

            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop terminated");
        });
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.socket.local_addr().map_err(Error::LocalAddr)
    }

    async fn send_message(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let bytes = message.to_bytes();
        debug!("sending {} bytes to {}", bytes.len(), destination);

        self.inner
            .socket
            .send_to(&bytes, destination)
            .await
            .map_err(|source| Error::Send {
                destination,
                source,
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl UdpTransport {
    /// Sends pre-serialized bytes, used by transactions to retransmit the
    /// identical wire image of their original request.
    pub async fn send_bytes(&self, bytes: &[u8], destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner
            .socket
            .send_to(bytes, destination)
            .await
            .map_err(|source| Error::Send {
                destination,
                source,
            })?;
        Ok(())
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.socket.local_addr() {
            Ok(addr) => write!(f, "UdpTransport({})", addr),
            Err(_) => write!(f, "UdpTransport(<unbound>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_pair() -> (UdpTransport, mpsc::Receiver<TransportEvent>, UdpTransport, mpsc::Receiver<TransportEvent>) {
        let (a, a_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let (b, b_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn delivers_parsed_messages() {
        let (a, _a_rx, b, mut b_rx) = bind_pair().await;

        let mut msg = SipMessage::request("OPTIONS", "sip:test@example.com");
        msg.set_header("Call-ID", "t1");
        msg.set_header("CSeq", "1 OPTIONS");
        a.send_message(&msg, b.local_addr().unwrap()).await.unwrap();

        match b_rx.recv().await.unwrap() {
            TransportEvent::MessageReceived { message, source } => {
                assert_eq!(message.method(), Some("OPTIONS"));
                assert_eq!(source, a.local_addr().unwrap());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn drops_malformed_datagrams() {
        let (a, _a_rx, b, mut b_rx) = bind_pair().await;
        let dest = b.local_addr().unwrap();

        a.send_bytes(b"this is not sip\r\n\r\n", dest).await.unwrap();

        let mut msg = SipMessage::request("OPTIONS", "sip:test@example.com");
        msg.set_header("Call-ID", "t2");
        a.send_message(&msg, dest).await.unwrap();

        // Only the well-formed message comes through.
        match b_rx.recv().await.unwrap() {
            TransportEvent::MessageReceived { message, .. } => {
                assert_eq!(message.header("Call-ID").as_deref(), Some("t2"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn refuses_to_send_after_close() {
        let (a, _a_rx, b, _b_rx) = bind_pair().await;
        a.close().await.unwrap();
        assert!(a.is_closed());
        let msg = SipMessage::request("OPTIONS", "sip:test@example.com");
        assert!(a
            .send_message(&msg, b.local_addr().unwrap())
            .await
            .is_err());
    }
}
