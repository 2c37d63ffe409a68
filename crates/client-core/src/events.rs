//! Client and call state, and the event stream delivered to the application

use serde::{Deserialize, Serialize};

/// Connection state of the client as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not registered with the server
    Disconnected,
    /// Registration (and presence subscription) in progress
    Connecting,
    /// Registered; calls may be placed and received
    Connected,
    /// Un-registration in progress
    Disconnecting,
}

/// Lifecycle of a single call
///
/// States only ever move forward; every call ends in `Finished` exactly
/// once, whether it completed, failed or was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Created but no INVITE exchanged yet
    Offer,
    /// INVITE sent or received, waiting for the final answer
    Connecting,
    /// Both sides accepted; media parameters are negotiated
    Active,
    /// BYE or CANCEL sent, waiting for the reply
    Disconnecting,
    /// Terminal state
    Finished,
}

/// Which side initiated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Events emitted by the engine to the application
///
/// The receiving half of the event channel is handed out once, by
/// [`SipClient::new`]. Every fatal failure produces exactly one
/// human-readable `Error` event.
///
/// [`SipClient::new`]: crate::client::SipClient::new
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client moved between connection states
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// A new incoming call arrived; accept or reject it by id
    CallReceived { call_id: String, remote: String },
    /// A call moved between states
    CallStateChanged {
        call_id: String,
        previous: CallState,
        current: CallState,
    },
    /// The remote party is being alerted (a 180 reply arrived)
    Ringing { call_id: String },
    /// A human-readable description of a failure
    Error { message: String },
}
