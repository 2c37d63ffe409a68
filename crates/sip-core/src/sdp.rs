//! SDP session description parsing and building
//!
//! SDP bodies are an ordered sequence of `type=value` lines. The engine
//! only cares about three things in a peer's description: the connection
//! address (`c=`), the audio media line (`m=audio <port> RTP/AVP <ids>`)
//! and the `a=rtpmap` attributes naming each payload type.

use std::net::IpAddr;

use bytes::Bytes;

/// An SDP session description as an ordered list of typed lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpMessage {
    fields: Vec<(char, String)>,
}

impl SdpMessage {
    pub fn new() -> Self {
        SdpMessage { fields: Vec::new() }
    }

    /// Parses an SDP body.
    ///
    /// Parsing stops silently at the first line that does not look like
    /// `x=value`; everything gathered up to that point is kept. SDP inside
    /// SIP arrives over the same lossy transport as the SIP message itself,
    /// so there is nobody to report an error to.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut fields = Vec::new();
        let text = String::from_utf8_lossy(bytes);
        for line in text.split("\r\n") {
            // byte offsets, not char counts: a lossy decode can put a
            // multi-byte replacement char in the name position
            let mut chars = line.char_indices();
            let name = match chars.next() {
                Some((_, c)) => c,
                None => break,
            };
            let value_start = match chars.next() {
                Some((at, '=')) => at + 1,
                _ => break,
            };
            fields.push((name, line[value_start..].to_string()));
        }
        SdpMessage { fields }
    }

    pub fn add_field(&mut self, name: char, value: impl Into<String>) {
        self.fields.push((name, value.into()));
    }

    pub fn fields(&self) -> &[(char, String)] {
        &self.fields
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        for (name, value) in &self.fields {
            out.push(*name);
            out.push('=');
            out.push_str(value);
            out.push_str("\r\n");
        }
        Bytes::from(out.into_bytes())
    }

    /// The session-level connection address, from `c=IN IP4 <addr>`
    pub fn connection_address(&self) -> Option<IpAddr> {
        self.fields
            .iter()
            .find(|(name, _)| *name == 'c')
            .and_then(|(_, value)| value.strip_prefix("IN IP4 "))
            .and_then(|addr| addr.trim().parse().ok())
    }

    /// The audio media port and payload type ids, from the `m=audio` line
    pub fn audio_media(&self) -> Option<(u16, Vec<u8>)> {
        for (name, value) in &self.fields {
            if *name != 'm' {
                continue;
            }
            let bits: Vec<&str> = value.split(' ').collect();
            if bits.len() < 3 || bits[0] != "audio" || bits[2] != "RTP/AVP" {
                continue;
            }
            let port = bits[1].parse().ok()?;
            let ids = bits[3..].iter().filter_map(|id| id.parse().ok()).collect();
            return Some((port, ids));
        }
        None
    }

    /// The `a=rtpmap` value for a payload type id, e.g. `PCMU/8000`
    pub fn rtpmap(&self, id: u8) -> Option<&str> {
        let prefix = format!("rtpmap:{} ", id);
        self.fields
            .iter()
            .filter(|(name, _)| *name == 'a')
            .find_map(|(_, value)| value.strip_prefix(&prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &[u8] = b"v=0\r\n\
        o=- 1289387706660194 1 IN IP4 10.0.0.2\r\n\
        s=phone\r\n\
        c=IN IP4 10.0.0.2\r\n\
        t=0 0\r\n\
        m=audio 40052 RTP/AVP 0 8 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=sendrecv\r\n";

    #[test]
    fn round_trips() {
        let sdp = SdpMessage::parse(ANSWER);
        assert_eq!(sdp.to_bytes().as_ref(), ANSWER);
    }

    #[test]
    fn reads_connection_address() {
        let sdp = SdpMessage::parse(ANSWER);
        assert_eq!(
            sdp.connection_address(),
            Some("10.0.0.2".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn reads_audio_media_line() {
        let sdp = SdpMessage::parse(ANSWER);
        let (port, ids) = sdp.audio_media().unwrap();
        assert_eq!(port, 40052);
        assert_eq!(ids, vec![0, 8, 101]);
    }

    #[test]
    fn looks_up_rtpmap() {
        let sdp = SdpMessage::parse(ANSWER);
        assert_eq!(sdp.rtpmap(0), Some("PCMU/8000"));
        assert_eq!(sdp.rtpmap(101), Some("telephone-event/8000"));
        assert_eq!(sdp.rtpmap(9), None);
    }

    #[test]
    fn ignores_non_audio_media() {
        let sdp = SdpMessage::parse(b"v=0\r\nm=video 5000 RTP/AVP 96\r\n");
        assert_eq!(sdp.audio_media(), None);
    }

    #[test]
    fn tolerates_multibyte_field_names() {
        // an invalid UTF-8 prefix decodes to a three-byte replacement char
        let sdp = SdpMessage::parse(b"\xE2\x82=x\r\nc=IN IP4 10.0.0.2\r\n");
        assert_eq!(sdp.fields().len(), 2);
        assert_eq!(
            sdp.connection_address(),
            Some("10.0.0.2".parse::<IpAddr>().unwrap())
        );

        let sdp = SdpMessage::parse("é=1\r\n".as_bytes());
        assert_eq!(sdp.fields(), &[('é', "1".to_string())]);
    }

    #[test]
    fn stops_at_malformed_line() {
        let sdp = SdpMessage::parse(b"v=0\r\nbogus line\r\nc=IN IP4 10.0.0.2\r\n");
        assert_eq!(sdp.fields().len(), 1);
        assert_eq!(sdp.connection_address(), None);
    }
}
