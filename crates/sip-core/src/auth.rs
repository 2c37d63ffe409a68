//! MD5 digest authentication
//!
//! Computes `Authorization`/`Proxy-Authorization` header values for the
//! digest challenges carried by 401 and 407 replies. The same helper serves
//! registration and call signaling; it is stateless apart from the random
//! client nonce drawn for each use.

use std::collections::HashMap;

use md5::{Digest, Md5};
use rand::Rng;

use crate::error::{Error, Result};

/// A parsed digest challenge from a `WWW-Authenticate` or
/// `Proxy-Authenticate` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parses a challenge header value.
    ///
    /// Only the `Digest` scheme is supported; anything else is an error the
    /// caller treats as an unrecoverable authentication failure. Parameter
    /// splitting is the same naive `key=value` walk used elsewhere in the
    /// message model.
    pub fn parse(header_value: &str) -> Result<DigestChallenge> {
        let rest = header_value
            .strip_prefix("Digest ")
            .ok_or_else(|| Error::UnsupportedChallenge(header_value.to_string()))?;

        let mut params = HashMap::new();
        for bit in rest.split(',') {
            if let Some(eq) = bit.find('=') {
                let key = bit[..eq].trim().to_ascii_lowercase();
                let value = bit[eq + 1..].trim().trim_matches('"').to_string();
                params.insert(key, value);
            }
        }

        Ok(DigestChallenge {
            realm: params.remove("realm").unwrap_or_default(),
            nonce: params.remove("nonce").unwrap_or_default(),
            qop: params.remove("qop"),
            algorithm: params.remove("algorithm"),
        })
    }
}

/// Computes a `Digest ...` authorization header value for a request.
///
/// Standard two-stage hash: A1 = username:realm:password,
/// A2 = method:uri, combined with the server nonce (and client nonce and
/// nonce count when the challenge carries a qop). The nonce count is fixed
/// at `00000001`: the deployed server only issues single-use challenges and
/// rejecting that assumption is an interoperability change, not a fix.
pub fn authorization(
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
    challenge: &DigestChallenge,
) -> String {
    const NC: &str = "00000001";

    let cnonce = generate_nonce();
    let ha1 = md5_hex(format!("{}:{}:{}", username, challenge.realm, password).as_bytes());
    let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());

    let response = match challenge.qop.as_deref() {
        Some(qop) if !qop.is_empty() => md5_hex(
            format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, NC, cnonce, qop, ha2
            )
            .as_bytes(),
        ),
        _ => md5_hex(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes()),
    };

    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
        username, challenge.realm, challenge.nonce, uri, response
    );
    if let Some(qop) = challenge.qop.as_deref() {
        if !qop.is_empty() {
            value.push_str(&format!(", cnonce=\"{}\", qop={}, nc={}", cnonce, qop, NC));
        }
    }
    value.push_str(", algorithm=MD5");
    value
}

fn md5_hex(input: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Random 32-hex-digit nonce
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_challenge_parameters() {
        let challenge = DigestChallenge::parse(
            "Digest realm=\"example.com\", nonce=\"abc123\", qop=\"auth\", algorithm=MD5",
        )
        .unwrap();
        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
    }

    #[test]
    fn rejects_non_digest_schemes() {
        assert!(DigestChallenge::parse("Basic realm=\"example.com\"").is_err());
    }

    #[test]
    fn computes_rfc2617_response_without_qop() {
        // RFC 2617 section 3.5 example, adapted: without qop the response is
        // MD5(HA1:nonce:HA2) and must not depend on the random cnonce.
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            qop: None,
            algorithm: None,
        };
        let a = authorization("GET", "/dir/index.html", "Mufasa", "Circle Of Life", &challenge);
        let b = authorization("GET", "/dir/index.html", "Mufasa", "Circle Of Life", &challenge);
        let response = |v: &str| {
            let start = v.find("response=\"").unwrap() + 10;
            v[start..start + 32].to_string()
        };
        assert_eq!(response(&a), response(&b));
        assert_eq!(response(&a), "670fd8c2df070c60b045671b8b24ff02");
    }

    #[test]
    fn carries_fixed_nonce_count_with_qop() {
        let challenge = DigestChallenge {
            realm: "example.com".to_string(),
            nonce: "abc123".to_string(),
            qop: Some("auth".to_string()),
            algorithm: None,
        };
        let value = authorization("REGISTER", "sip:example.com", "alice", "secret", &challenge);
        assert!(value.starts_with("Digest username=\"alice\""));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("qop=auth"));
        assert!(value.contains("cnonce=\""));
        assert!(value.ends_with("algorithm=MD5"));
    }

    #[test]
    fn nonce_is_32_hex_digits() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
