//! The line-codec contract shared by the stream protocols.
//!
//! A codec is a pure function over one framed line: it never touches the
//! transport.  The Connection Manager frames inbound bytes, hands each line
//! to the codec, and acts on the [`Decoded`] result.

use scalelink_types::{ProtocolError, ProtocolKind, RawReading};

use crate::adi::AdiLineCodec;
use crate::ascii::AsciiCodec;
use crate::scp::ScpCodec;

/// What one framed line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A candidate reading; still subject to normalisation.
    Reading(RawReading),
    /// The device acknowledged a command.
    Ack,
    /// Version/model reply, e.g. `XR5000 v2.1`.
    Identity(String),
    /// Nothing this codec recognises.  Not an error.
    Unrecognized,
}

impl Decoded {
    pub fn is_reading(&self) -> bool {
        matches!(self, Decoded::Reading(_))
    }
}

/// Decoder for one device protocol.
pub trait Codec: Send {
    fn protocol(&self) -> ProtocolKind;

    /// Decode one framed line.
    ///
    /// `Err` is reserved for replies that prove the device is unusable as
    /// configured; unknown text is [`Decoded::Unrecognized`].
    fn decode(&mut self, line: &str) -> Result<Decoded, ProtocolError>;

    /// Commands written once the link opens.  A device sent a handshake is
    /// expected to identify itself.
    fn handshake(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Command written on every poll tick; `None` for devices that push.
    fn poll_command(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Pick the codec for a configured protocol.  Never sniffs.
pub fn codec_for(protocol: ProtocolKind) -> Box<dyn Codec> {
    match protocol {
        ProtocolKind::Adi => Box::new(AdiLineCodec::new()),
        ProtocolKind::Scp => Box::new(ScpCodec::new()),
        ProtocolKind::Ascii => Box::new(AsciiCodec::new()),
    }
}

/// Parse a decimal weight token, accepting a comma as decimal separator.
pub(crate) fn parse_weight(token: &str) -> Option<f64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    token.replace(',', ".").parse::<f64>().ok()
}

/// `None` for empty or whitespace-only fields.
pub(crate) fn non_empty(field: &str) -> Option<String> {
    let field = field.trim();
    (!field.is_empty()).then(|| field.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_matches_configured_protocol() {
        for p in [ProtocolKind::Adi, ProtocolKind::Scp, ProtocolKind::Ascii] {
            assert_eq!(codec_for(p).protocol(), p);
        }
    }

    #[test]
    fn weight_tokens() {
        assert_eq!(parse_weight(" 87.3 "), Some(87.3));
        assert_eq!(parse_weight("87,3"), Some(87.3));
        assert_eq!(parse_weight(""), None);
        assert_eq!(parse_weight("abc"), None);
    }
}
