//! SIP request/reply parsing and serialization
//!
//! A [`SipMessage`] is either a request (method + request-URI) or a reply
//! (status code + reason phrase) and carries an ordered multimap of header
//! fields plus an opaque body. Header names are matched case-insensitively
//! and multiple values for the same name keep their insertion order, so a
//! parsed message serializes back to the exact bytes it came from.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Error, Result};

const CRLF: &str = "\r\n";
const SIP_VERSION: &str = "SIP/2.0";

/// The first line of a SIP message
///
/// Exactly one of the two kinds applies to any message; there is no way to
/// build a message that is both a request and a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `METHOD uri SIP/2.0`
    Request { method: String, uri: String },
    /// `SIP/2.0 code reason`
    Reply { status: u16, reason: String },
}

/// A SIP request or reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start: StartLine,
    fields: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SipMessage {
    /// Creates an empty request with the given method and request-URI
    pub fn request(method: impl Into<String>, uri: impl Into<String>) -> Self {
        SipMessage {
            start: StartLine::Request {
                method: method.into(),
                uri: uri.into(),
            },
            fields: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Creates an empty reply with the given status code and reason phrase
    pub fn reply(status: u16, reason: impl Into<String>) -> Self {
        SipMessage {
            start: StartLine::Reply {
                status,
                reason: reason.into(),
            },
            fields: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Parses a SIP message from a raw datagram.
    ///
    /// The start line is split from the rest on the first CRLF. A line of
    /// the form `SIP/2.0 <3-digit code> <reason>` is a reply, a line of the
    /// form `<METHOD> <uri> SIP/2.0` is a request, anything else is an
    /// error the caller is expected to treat as "drop the packet". Header
    /// lines are split on the first colon, both sides trimmed, and
    /// single-letter compact names are expanded to their canonical form.
    /// Everything after the blank-line separator is the body.
    pub fn parse(bytes: &[u8]) -> Result<SipMessage> {
        let text = bytes;
        let line_end = find_crlf(text, 0).ok_or(Error::Truncated)?;
        let start_line =
            std::str::from_utf8(&text[..line_end]).map_err(|_| Error::Truncated)?;

        let start = parse_start_line(start_line)?;

        let mut fields = Vec::new();
        let mut i = line_end + 2;
        loop {
            let n = find_crlf(text, i).ok_or(Error::Truncated)?;
            if n == i {
                // blank line, end of headers
                i = n + 2;
                break;
            }
            let line = std::str::from_utf8(&text[i..n]).map_err(|_| Error::Truncated)?;
            let colon = line
                .find(':')
                .ok_or_else(|| Error::MalformedHeader(line.to_string()))?;
            let name = expand_compact_name(line[..colon].trim());
            let value = line[colon + 1..].trim().to_string();
            fields.push((name, value));
            i = n + 2;
        }

        Ok(SipMessage {
            start,
            fields,
            body: text[i..].to_vec(),
        })
    }

    /// Serializes the message to its wire image.
    ///
    /// A `Content-Length` header matching the body size is appended unless
    /// the caller already supplied one.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(method);
                out.push(' ');
                out.push_str(uri);
                out.push(' ');
                out.push_str(SIP_VERSION);
            }
            StartLine::Reply { status, reason } => {
                out.push_str(SIP_VERSION);
                out.push(' ');
                out.push_str(&status.to_string());
                // an empty reason phrase serializes without the separator
                if !reason.is_empty() {
                    out.push(' ');
                    out.push_str(reason);
                }
            }
        }
        out.push_str(CRLF);

        let mut has_length = false;
        for (name, value) in &self.fields {
            if name.eq_ignore_ascii_case("Content-Length") {
                has_length = true;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }
        if !has_length {
            out.push_str("Content-Length: ");
            out.push_str(&self.body.len().to_string());
            out.push_str(CRLF);
        }
        out.push_str(CRLF);

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        Bytes::from(bytes)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.start, StartLine::Reply { .. })
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start
    }

    /// Request method, if this is a request
    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Reply { .. } => None,
        }
    }

    /// Request-URI, if this is a request
    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Reply { .. } => None,
        }
    }

    /// Status code, if this is a reply
    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Reply { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// Reason phrase, if this is a reply
    pub fn reason_phrase(&self) -> Option<&str> {
        match &self.start {
            StartLine::Reply { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// All values carried by the named header, in insertion order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The named header's values joined with ", ", or `None` if absent
    pub fn header(&self, name: &str) -> Option<String> {
        let values = self.header_values(name);
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// Appends a header field, keeping any existing values for the name
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replaces every value of the named header with a single one
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_header(&name);
        self.fields.push((name, value.into()));
    }

    /// Removes every value of the named header
    pub fn remove_header(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// `;`-delimited `key=value` parameters of the named header.
    ///
    /// This is a deliberately naive split (no quoting support); it is only
    /// used for `Via` parameters such as `received` and `rport`.
    pub fn header_parameters(&self, name: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let value = match self.header(name) {
            Some(v) => v,
            None => return params,
        };
        for bit in value.split(';').skip(1) {
            if let Some(eq) = bit.find('=') {
                params.insert(bit[..eq].trim().to_string(), bit[eq + 1..].trim().to_string());
            }
        }
        params
    }

    /// Numeric prefix of the `CSeq` header
    pub fn sequence_number(&self) -> Option<u32> {
        self.header("CSeq")?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    /// Method suffix of the `CSeq` header
    pub fn cseq_method(&self) -> Option<String> {
        self.header("CSeq")?
            .split_whitespace()
            .last()
            .map(str::to_string)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }
}

fn find_crlf(bytes: &[u8], from: usize) -> Option<usize> {
    if bytes.len() < 2 || from > bytes.len() - 2 {
        return None;
    }
    (from..=bytes.len() - 2).find(|&i| bytes[i] == b'\r' && bytes[i + 1] == b'\n')
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        // "SIP/2.0 200 OK"
        if rest.len() < 3 || !rest.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
            return Err(Error::MalformedStartLine(line.to_string()));
        }
        let status: u16 = rest[..3]
            .parse()
            .map_err(|_| Error::MalformedStartLine(line.to_string()))?;
        let reason = rest.get(4..).unwrap_or("").to_string();
        Ok(StartLine::Reply { status, reason })
    } else if let Some(head) = line.strip_suffix(" SIP/2.0") {
        // "INVITE sip:bob@example.com SIP/2.0"
        let n = head
            .find(' ')
            .ok_or_else(|| Error::MalformedStartLine(line.to_string()))?;
        let (method, uri) = head.split_at(n);
        let uri = uri[1..].trim();
        if method.is_empty() || uri.is_empty() {
            return Err(Error::MalformedStartLine(line.to_string()));
        }
        Ok(StartLine::Request {
            method: method.to_string(),
            uri: uri.to_string(),
        })
    } else {
        Err(Error::MalformedStartLine(line.to_string()))
    }
}

/// Expands single-letter compact header names to their canonical form
fn expand_compact_name(name: &str) -> String {
    if name.len() == 1 {
        match name.to_ascii_lowercase().as_str() {
            "c" => return "Content-Type".to_string(),
            "f" => return "From".to_string(),
            "i" => return "Call-ID".to_string(),
            "k" => return "Supported".to_string(),
            "l" => return "Content-Length".to_string(),
            "m" => return "Contact".to_string(),
            "t" => return "To".to_string(),
            "v" => return "Via".to_string(),
            _ => {}
        }
    }
    name.to_string()
}
