//! SIP message, SDP and digest authentication primitives for the sipline stack
//!
//! This crate implements the wire-level pieces of the signaling engine:
//! parsing and serializing SIP requests and replies, the line-oriented SDP
//! session descriptions they carry, and MD5 digest credentials for
//! authentication challenges. Everything here is pure and synchronous; the
//! transport and state machines live in `sipline-sip-transport` and
//! `sipline-client-core`.

pub mod auth;
pub mod error;
pub mod message;
pub mod sdp;

pub use auth::{authorization, DigestChallenge};
pub use error::{Error, Result};
pub use message::{SipMessage, StartLine};
pub use sdp::SdpMessage;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        authorization, DigestChallenge, Error, Result, SdpMessage, SipMessage, StartLine,
    };
}
