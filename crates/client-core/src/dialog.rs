//! Per-dialog authentication and sequencing state
//!
//! Both the registration exchange and every call keep a [`DialogContext`]:
//! a CSeq counter plus the digest challenges the server has issued for that
//! dialog. Once a challenge is stored, every later request in the dialog
//! carries a freshly computed authorization header for it.

use sipline_sip_core::auth::{authorization, DigestChallenge};
use sipline_sip_core::{Error as SipError, SipMessage};

/// Sequencing and credential state scoped to one dialog
#[derive(Debug, Clone, Default)]
pub struct DialogContext {
    cseq: u32,
    challenge: Option<DigestChallenge>,
    proxy_challenge: Option<DigestChallenge>,
}

impl DialogContext {
    pub fn new() -> Self {
        DialogContext {
            cseq: 1,
            challenge: None,
            proxy_challenge: None,
        }
    }

    /// Returns the next CSeq number and advances the counter
    pub fn next_cseq(&mut self) -> u32 {
        let seq = self.cseq;
        self.cseq += 1;
        seq
    }

    /// Whether a request we previously sent already answered the kind of
    /// challenge this reply carries. If it did, the server has rejected
    /// our credentials and retrying is pointless.
    pub fn already_answered(status: u16, request: &SipMessage) -> bool {
        let header = match status {
            401 => "Authorization",
            _ => "Proxy-Authorization",
        };
        request.header(header).is_some()
    }

    /// Stores the challenge carried by a 401 or 407 reply.
    ///
    /// Fails if the reply lacks the expected header or carries a scheme
    /// other than `Digest`; both mean authentication cannot proceed.
    pub fn store_challenge(&mut self, reply: &SipMessage) -> Result<(), SipError> {
        match reply.status_code() {
            Some(401) => {
                let value = reply
                    .header("WWW-Authenticate")
                    .ok_or(SipError::MissingHeader("WWW-Authenticate"))?;
                self.challenge = Some(DigestChallenge::parse(&value)?);
            }
            _ => {
                let value = reply
                    .header("Proxy-Authenticate")
                    .ok_or(SipError::MissingHeader("Proxy-Authenticate"))?;
                self.proxy_challenge = Some(DigestChallenge::parse(&value)?);
            }
        }
        Ok(())
    }

    /// Attaches authorization headers for every stored challenge.
    ///
    /// The digest response depends on the request method and URI, so this
    /// recomputes on every send rather than caching header values.
    pub fn apply_authorization(&self, request: &mut SipMessage, username: &str, password: &str) {
        let method = match request.method() {
            Some(m) => m.to_string(),
            None => return,
        };
        let uri = match request.uri() {
            Some(u) => u.to_string(),
            None => return,
        };

        if let Some(challenge) = &self.challenge {
            request.set_header(
                "Authorization",
                authorization(&method, &uri, username, password, challenge),
            );
        }
        if let Some(challenge) = &self.proxy_challenge {
            request.set_header(
                "Proxy-Authorization",
                authorization(&method, &uri, username, password, challenge),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge_reply(status: u16, header: &str, value: &str) -> SipMessage {
        let mut reply = SipMessage::reply(status, "Unauthorized");
        reply.set_header(header, value);
        reply
    }

    #[test]
    fn cseq_advances() {
        let mut ctx = DialogContext::new();
        assert_eq!(ctx.next_cseq(), 1);
        assert_eq!(ctx.next_cseq(), 2);
        assert_eq!(ctx.next_cseq(), 3);
    }

    #[test]
    fn stores_and_applies_registrar_challenge() {
        let mut ctx = DialogContext::new();
        let reply = challenge_reply(
            401,
            "WWW-Authenticate",
            "Digest realm=\"example.com\", nonce=\"abc\"",
        );
        ctx.store_challenge(&reply).unwrap();

        let mut request = SipMessage::request("REGISTER", "sip:example.com");
        ctx.apply_authorization(&mut request, "alice", "secret");
        let auth = request.header("Authorization").unwrap();
        assert!(auth.starts_with("Digest username=\"alice\""));
        assert!(auth.contains("realm=\"example.com\""));
        assert!(request.header("Proxy-Authorization").is_none());
    }

    #[test]
    fn stores_proxy_challenge_separately() {
        let mut ctx = DialogContext::new();
        let reply = challenge_reply(
            407,
            "Proxy-Authenticate",
            "Digest realm=\"proxy.example.com\", nonce=\"xyz\"",
        );
        ctx.store_challenge(&reply).unwrap();

        let mut request = SipMessage::request("INVITE", "sip:bob@example.com");
        ctx.apply_authorization(&mut request, "alice", "secret");
        assert!(request.header("Proxy-Authorization").is_some());
        assert!(request.header("Authorization").is_none());
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let mut ctx = DialogContext::new();
        let reply = challenge_reply(401, "WWW-Authenticate", "Basic realm=\"example.com\"");
        assert!(ctx.store_challenge(&reply).is_err());
    }

    #[test]
    fn rejects_missing_challenge_header() {
        let mut ctx = DialogContext::new();
        let reply = SipMessage::reply(401, "Unauthorized");
        assert!(ctx.store_challenge(&reply).is_err());
    }

    #[test]
    fn detects_answered_challenges() {
        let mut request = SipMessage::request("REGISTER", "sip:example.com");
        assert!(!DialogContext::already_answered(401, &request));
        request.set_header("Authorization", "Digest ...");
        assert!(DialogContext::already_answered(401, &request));
        assert!(!DialogContext::already_answered(407, &request));
    }
}
