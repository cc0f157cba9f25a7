//! SCP – the indicator's serial command protocol.
//!
//! Commands are `{XX}` tokens terminated by CR LF.  Replies are bracketed
//! weights (`[123.5]`, `[U123.5]` while unsettled), comma-separated records
//! (`id,visualId,electronicId,weight`), a bare `^` acknowledgement, or a
//! bracketed version string containing the model name.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use scalelink_types::{ProtocolError, ProtocolKind, RawReading};
use tracing::debug;

use crate::codec::{Codec, Decoded, non_empty, parse_weight};
use crate::rules::RuleSet;

/// Tokens that identify a supported indicator in a `{VM}` reply.
pub const MODEL_TOKENS: [&str; 6] = ["XR5000", "XR3000", "ID5000", "ID3000", "5000", "Tru-Test"];

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpCommand {
    /// `{VM}` – version / model query.
    VersionModel,
    /// `{FN}` – fetch the next stored record.
    FetchNext,
    /// `{ZA1}` – enable acknowledgements.
    AckOn,
    /// `{ZA0}` – disable acknowledgements.
    AckOff,
    /// Any other token, sent verbatim inside braces.
    Custom(String),
}

impl ScpCommand {
    pub fn token(&self) -> &str {
        match self {
            ScpCommand::VersionModel => "VM",
            ScpCommand::FetchNext => "FN",
            ScpCommand::AckOn => "ZA1",
            ScpCommand::AckOff => "ZA0",
            ScpCommand::Custom(t) => t.trim_matches(|c| c == '{' || c == '}'),
        }
    }

    /// Wire bytes, CR LF included.
    pub fn encode(&self) -> Vec<u8> {
        format!("{{{}}}\r\n", self.token()).into_bytes()
    }
}

impl fmt::Display for ScpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.token())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reply rules
// ────────────────────────────────────────────────────────────────────────────

static WEIGHT_REGEX: OnceLock<Regex> = OnceLock::new();

fn weight_regex() -> &'static Regex {
    WEIGHT_REGEX.get_or_init(|| {
        Regex::new(r"(?i)^\[\s*(U)?\s*(-?\d+(?:[.,]\d+)?)\s*(?:kg)?\s*\]$")
            .expect("Invalid SCP weight Regex")
    })
}

fn is_model_reply(inner: &str) -> bool {
    let upper = inner.to_ascii_uppercase();
    MODEL_TOKENS
        .iter()
        .any(|t| upper.contains(&t.to_ascii_uppercase()))
}

fn strip_brackets(line: &str) -> &str {
    line.strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .unwrap_or(line)
}

fn bracketed_weight(line: &str) -> Option<Decoded> {
    let caps = weight_regex().captures(line)?;
    let weight = parse_weight(caps.get(2)?.as_str())?;
    let stable = caps.get(1).is_none();
    Some(Decoded::Reading(RawReading::weight(weight, stable, line)))
}

/// `id,visualId,electronicId,weight`, bracketed or bare.  The weight field
/// may be empty (the normalizer rejects it) or carry a `U` prefix.
fn csv_record(line: &str) -> Option<Decoded> {
    let fields: Vec<&str> = strip_brackets(line).split(',').collect();
    let [_id, visual, electronic, weight] = fields.as_slice() else {
        return None;
    };
    let weight = weight.trim();
    let (weight_token, stable) = match weight.strip_prefix(['U', 'u']) {
        Some(rest) => (rest, false),
        None => (weight, true),
    };
    let weight = if weight_token.is_empty() {
        None
    } else {
        Some(parse_weight(weight_token)?)
    };
    Some(Decoded::Reading(RawReading {
        weight,
        visual_id: non_empty(visual),
        electronic_id: non_empty(electronic),
        stable,
        source_raw: line.to_string(),
    }))
}

fn identity(line: &str) -> Option<Decoded> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?.trim();
    is_model_reply(inner).then(|| Decoded::Identity(inner.to_string()))
}

/// Default SCP rules, highest priority first.
pub fn scp_rules() -> RuleSet<Decoded> {
    RuleSet::new()
        .with("ack", |l: &str| (l == "^").then_some(Decoded::Ack))
        .with("command_echo", |l: &str| {
            (l.starts_with('{') && l.ends_with('}')).then_some(Decoded::Unrecognized)
        })
        .with("bracketed_weight", bracketed_weight)
        .with("csv_record", csv_record)
        .with("identity", identity)
}

// ────────────────────────────────────────────────────────────────────────────
// Codec
// ────────────────────────────────────────────────────────────────────────────

pub struct ScpCodec {
    rules: RuleSet<Decoded>,
}

impl ScpCodec {
    pub fn new() -> Self {
        Self { rules: scp_rules() }
    }

    /// Codec with a caller-supplied rule set (firmware quirks).
    pub fn with_rules(rules: RuleSet<Decoded>) -> Self {
        Self { rules }
    }
}

impl Default for ScpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for ScpCodec {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Scp
    }

    fn decode(&mut self, line: &str) -> Result<Decoded, ProtocolError> {
        let line = line.trim();
        match self.rules.evaluate(line) {
            Some(m) => {
                debug!(rule = %m.rule, line, "scp frame decoded");
                Ok(m.value)
            }
            None => {
                debug!(line, "scp frame unrecognized");
                Ok(Decoded::Unrecognized)
            }
        }
    }

    /// Turn acknowledgements on, then ask for version and model.
    fn handshake(&self) -> Vec<Vec<u8>> {
        vec![ScpCommand::AckOn.encode(), ScpCommand::VersionModel.encode()]
    }

    fn poll_command(&self) -> Option<Vec<u8>> {
        Some(ScpCommand::FetchNext.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> Decoded {
        ScpCodec::new().decode(line).expect("scp never errors")
    }

    fn reading(line: &str) -> RawReading {
        match decode(line) {
            Decoded::Reading(r) => r,
            other => panic!("expected reading for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn session_commands_come_from_the_codec() {
        let codec = ScpCodec::new();
        assert_eq!(codec.handshake(), vec![b"{ZA1}\r\n".to_vec(), b"{VM}\r\n".to_vec()]);
        assert_eq!(codec.poll_command(), Some(b"{FN}\r\n".to_vec()));
        assert!(crate::ascii::AsciiCodec::new().handshake().is_empty());
        assert_eq!(crate::ascii::AsciiCodec::new().poll_command(), None);
    }

    #[test]
    fn commands_are_braced_and_crlf_terminated() {
        assert_eq!(ScpCommand::VersionModel.encode(), b"{VM}\r\n");
        assert_eq!(ScpCommand::FetchNext.encode(), b"{FN}\r\n");
        assert_eq!(ScpCommand::AckOn.encode(), b"{ZA1}\r\n");
        assert_eq!(ScpCommand::AckOff.to_string(), "{ZA0}");
        assert_eq!(ScpCommand::Custom("{RW}".into()).encode(), b"{RW}\r\n");
    }

    #[test]
    fn unstable_and_stable_bracketed_weights() {
        let r = reading("[U87.3]");
        assert_eq!(r.weight, Some(87.3));
        assert!(!r.stable);

        let r = reading("[87.3]");
        assert_eq!(r.weight, Some(87.3));
        assert!(r.stable);
        assert_eq!(r.source_raw, "[87.3]");
    }

    #[test]
    fn csv_record_maps_ids_and_weight() {
        let r = reading("42,VIS001,EID123,310.5");
        assert_eq!(r.visual_id.as_deref(), Some("VIS001"));
        assert_eq!(r.electronic_id.as_deref(), Some("EID123"));
        assert_eq!(r.weight, Some(310.5));
        assert!(r.stable);

        let r = reading("[7,,982000123456789,U412]");
        assert_eq!(r.visual_id, None);
        assert_eq!(r.electronic_id.as_deref(), Some("982000123456789"));
        assert_eq!(r.weight, Some(412.0));
        assert!(!r.stable);
    }

    #[test]
    fn csv_record_with_empty_weight_is_still_a_candidate() {
        let r = reading("1,TAG9,,");
        assert_eq!(r.weight, None);
        assert_eq!(r.animal_id(), Some("TAG9"));
    }

    #[test]
    fn ack_identity_and_noise() {
        assert_eq!(decode("^"), Decoded::Ack);
        assert_eq!(decode("[XR5000 v2.1]"), Decoded::Identity("XR5000 v2.1".into()));
        assert_eq!(decode("[Tru-Test ID3000]"), Decoded::Identity("Tru-Test ID3000".into()));
        assert_eq!(decode("{VM}"), Decoded::Unrecognized);
        assert_eq!(decode("hello"), Decoded::Unrecognized);
        assert_eq!(decode("a,b,c,notaweight"), Decoded::Unrecognized);
    }

    #[test]
    fn custom_rule_can_be_inserted_ahead() {
        let mut rules = scp_rules();
        rules.insert_before(
            "bracketed_weight",
            Box::new(crate::rules::FnRule::new("overload", |l: &str| {
                (l == "[OL]").then_some(Decoded::Unrecognized)
            })),
        );
        let mut codec = ScpCodec::with_rules(rules);
        assert_eq!(codec.decode("[OL]").expect("decode"), Decoded::Unrecognized);
        assert!(codec.decode("[12.0]").expect("decode").is_reading());
    }
}
