//! Client configuration

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::codec::{default_codecs, AudioCodec};

/// How long a registration is requested to last, in seconds
pub const DEFAULT_REGISTER_EXPIRES: u32 = 300;

/// How long to wait for a final answer to an INVITE before giving up
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 30;

/// Configuration for a SIP client
///
/// The server address is a resolved socket address; name resolution is the
/// application's concern, since it usually wants to apply its own SRV and
/// failover policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Account name, the user part of our SIP address
    pub username: String,
    /// Account password for digest authentication
    pub password: String,
    /// SIP domain, the host part of our SIP address
    pub domain: String,
    /// Optional display name used in `From` headers
    pub display_name: Option<String>,
    /// Resolved address of the SIP server
    pub server_addr: SocketAddr,
    /// Local address to bind; port 0 lets the OS pick
    pub local_addr: SocketAddr,
    /// RTP port advertised in SDP offers and answers
    pub media_port: u16,
    /// Requested registration lifetime in seconds
    pub register_expires: u32,
    /// Value of the `User-Agent` header on every request
    pub user_agent: String,
    /// Codecs offered on outgoing calls, in preference order
    pub codecs: Vec<AudioCodec>,
}

impl ClientConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
        server_addr: SocketAddr,
    ) -> Self {
        ClientConfig {
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            display_name: None,
            server_addr,
            local_addr: "0.0.0.0:0".parse().expect("static address"),
            media_port: 40000,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            user_agent: format!("sipline/{}", env!("CARGO_PKG_VERSION")),
            codecs: default_codecs(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn with_media_port(mut self, port: u16) -> Self {
        self.media_port = port;
        self
    }

    pub fn with_register_expires(mut self, seconds: u32) -> Self {
        self.register_expires = seconds;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_codecs(mut self, codecs: Vec<AudioCodec>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Our own SIP URI, `sip:user@domain`
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// Our own address as used in `From` and `To` headers, with the
    /// display name when one is configured
    pub fn address(&self) -> String {
        match &self.display_name {
            Some(name) => format!("\"{}\" <{}>", name, self.uri()),
            None => format!("<{}>", self.uri()),
        }
    }
}
