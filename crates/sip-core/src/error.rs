//! Error types for SIP message and SDP parsing

use thiserror::Error;

/// Result type for sip-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing SIP or SDP material
///
/// Parse errors on inbound datagrams are never fatal: the transport drops
/// the offending packet and logs a warning. No error reply is sent back
/// over UDP.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The start line is neither a request line nor a status line
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    /// A header line is missing its colon separator
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    /// The message ended before the blank-line body separator
    #[error("truncated message")]
    Truncated,

    /// A required header is absent
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A digest challenge could not be understood
    #[error("unsupported authentication challenge: {0}")]
    UnsupportedChallenge(String),
}
