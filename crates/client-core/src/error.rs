//! Error types for the client engine

use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the public client API.
///
/// Most protocol failures are reported as [`ClientEvent::Error`] events
/// instead, since they happen long after the command that caused them
/// returned. These variants cover the failures a caller can act on at the
/// call site.
///
/// [`ClientEvent::Error`]: crate::events::ClientEvent::Error
#[derive(Debug, Error)]
pub enum ClientError {
    /// A transport-level failure, fatal to the whole client
    #[error("transport error: {0}")]
    Transport(#[from] sipline_sip_transport::Error),

    /// The command does not make sense in the current state
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// A call command named a dialog the engine no longer tracks
    #[error("unknown call: {call_id}")]
    UnknownCall { call_id: String },

    /// The client must be connected before placing calls
    #[error("not connected to the SIP server")]
    NotConnected,

    /// The server rejected our credentials twice for the same request
    #[error("authentication failed: {context}")]
    AuthenticationFailed { context: String },

    /// The engine task is gone; no command can ever complete again
    #[error("client engine has stopped")]
    EngineStopped,
}
