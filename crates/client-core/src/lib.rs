//! SIP user agent core
//!
//! This crate drives a complete SIP softphone signaling session against a
//! single server: digest-authenticated registration with periodic refresh,
//! outgoing and incoming audio calls with SDP offer/answer, and orderly
//! teardown. The application talks to one [`SipClient`] handle and reads
//! a stream of [`ClientEvent`]s; all protocol state is owned by a single
//! engine task.
//!
//! ```no_run
//! use sipline_client_core::{ClientConfig, ClientEvent, SipClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("alice", "secret", "example.com", "192.0.2.1:5060".parse()?);
//! let (client, mut events) = SipClient::new(config).await?;
//! client.connect().await?;
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::CallReceived { call_id, .. } = event {
//!         client.call_handle(call_id).accept().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;

mod call;
mod dialog;
mod transaction;

pub use client::{CallHandle, SipClient};
pub use codec::AudioCodec;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::{CallDirection, CallState, ClientEvent, ConnectionState};
