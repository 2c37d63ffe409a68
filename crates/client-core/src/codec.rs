//! Audio codec descriptions and offer/answer selection

use serde::{Deserialize, Serialize};

/// Payload type id reserved for DTMF events in every offer we build
pub const TELEPHONE_EVENT_ID: u8 = 101;

/// A static-payload audio codec the client is willing to negotiate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCodec {
    /// RTP payload type id
    pub id: u8,
    /// Encoding name as it appears in `a=rtpmap`
    pub name: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl AudioCodec {
    /// G.711 mu-law, payload type 0
    pub fn pcmu() -> Self {
        AudioCodec {
            id: 0,
            name: "PCMU".to_string(),
            clock_rate: 8000,
            channels: 1,
        }
    }

    /// G.711 A-law, payload type 8
    pub fn pcma() -> Self {
        AudioCodec {
            id: 8,
            name: "PCMA".to_string(),
            clock_rate: 8000,
            channels: 1,
        }
    }

    /// The `a=rtpmap` encoding description, e.g. `PCMU/8000`
    pub fn rtpmap(&self) -> String {
        if self.channels > 1 {
            format!("{}/{}/{}", self.name, self.clock_rate, self.channels)
        } else {
            format!("{}/{}", self.name, self.clock_rate)
        }
    }
}

/// The codecs offered by default, in preference order
pub fn default_codecs() -> Vec<AudioCodec> {
    vec![AudioCodec::pcmu(), AudioCodec::pcma()]
}

/// Picks the codec for a call: the first payload id in the peer's media
/// line order that we also support. `None` means the call cannot proceed.
pub fn select_codec(supported: &[AudioCodec], offered: &[u8]) -> Option<AudioCodec> {
    offered
        .iter()
        .find_map(|id| supported.iter().find(|codec| codec.id == *id))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_follows_remote_order() {
        let supported = default_codecs();
        // Remote prefers PCMA, so PCMA wins even though we list PCMU first.
        let codec = select_codec(&supported, &[8, 0, 101]).unwrap();
        assert_eq!(codec.id, 8);
        assert_eq!(codec.name, "PCMA");
    }

    #[test]
    fn selection_skips_unknown_ids() {
        let supported = default_codecs();
        let codec = select_codec(&supported, &[96, 97, 0]).unwrap();
        assert_eq!(codec.id, 0);
    }

    #[test]
    fn selection_fails_without_overlap() {
        let supported = default_codecs();
        assert_eq!(select_codec(&supported, &[96, 97, 101]), None);
        assert_eq!(select_codec(&supported, &[]), None);
    }

    #[test]
    fn rtpmap_formats() {
        assert_eq!(AudioCodec::pcmu().rtpmap(), "PCMU/8000");
        let stereo = AudioCodec {
            id: 10,
            name: "L16".to_string(),
            clock_rate: 44100,
            channels: 2,
        };
        assert_eq!(stereo.rtpmap(), "L16/44100/2");
    }
}
