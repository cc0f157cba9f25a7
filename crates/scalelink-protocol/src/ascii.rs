//! Raw ASCII stream codec.
//!
//! Indicators in streaming mode push loosely formatted text.  Three shapes
//! are recognised, in priority order:
//!
//! 1. `W <weight> <unit> [S]` – unit `kg` or `lb`/`lbs`, trailing `S` = stable.
//! 2. `Weight:<w>,ID:<id>,Stable:<0|1>`
//! 3. a bare numeric token, only inside the plausible livestock range.
//!
//! An `EID[:=]?<value>` token anywhere on the line is merged into the
//! reading.  A line carrying only an EID is held and attached to the next
//! reading.

use std::sync::OnceLock;

use regex::Regex;
use scalelink_types::{ProtocolError, ProtocolKind, RawReading};
use tracing::debug;

use crate::codec::{Codec, Decoded, parse_weight};
use crate::rules::RuleSet;

/// Bare numbers must fall strictly inside `(0, BARE_NUMBER_LIMIT)`.
pub const BARE_NUMBER_LIMIT: f64 = 10_000.0;

const KG_PER_LB: f64 = 0.453_592_37;

static W_UNIT_REGEX: OnceLock<Regex> = OnceLock::new();
static WEIGHT_FIELD_REGEX: OnceLock<Regex> = OnceLock::new();
static ID_FIELD_REGEX: OnceLock<Regex> = OnceLock::new();
static STABLE_FIELD_REGEX: OnceLock<Regex> = OnceLock::new();
static EID_REGEX: OnceLock<Regex> = OnceLock::new();

fn w_unit_regex() -> &'static Regex {
    W_UNIT_REGEX.get_or_init(|| {
        Regex::new(r"(?i)(?:^|\s)W\s*(-?\d+(?:[.,]\d+)?)\s*(kgs?|lbs?)\b(?:\s+(S)\b)?")
            .expect("Invalid W-unit Regex")
    })
}

fn weight_field_regex() -> &'static Regex {
    WEIGHT_FIELD_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\bWeight\s*:\s*(-?\d+(?:[.,]\d+)?)").expect("Invalid Weight Regex")
    })
}

fn id_field_regex() -> &'static Regex {
    ID_FIELD_REGEX.get_or_init(|| {
        Regex::new(r"(?i)(?:^|[,;\s])ID\s*:\s*([^,;\s]+)").expect("Invalid ID Regex")
    })
}

fn stable_field_regex() -> &'static Regex {
    STABLE_FIELD_REGEX
        .get_or_init(|| Regex::new(r"(?i)\bStable\s*:\s*([01])").expect("Invalid Stable Regex"))
}

fn eid_regex() -> &'static Regex {
    EID_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\bEID\s*[:=]?\s*([0-9A-Z]+)").expect("Invalid EID Regex")
    })
}

/// Electronic ID token on the line, if any.
pub fn extract_eid(line: &str) -> Option<String> {
    eid_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn w_unit(line: &str) -> Option<RawReading> {
    let caps = w_unit_regex().captures(line)?;
    let value = parse_weight(caps.get(1)?.as_str())?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let kg = if unit.starts_with("lb") {
        value * KG_PER_LB
    } else {
        value
    };
    Some(RawReading::weight(kg, caps.get(3).is_some(), line))
}

fn labelled_fields(line: &str) -> Option<RawReading> {
    let weight = parse_weight(weight_field_regex().captures(line)?.get(1)?.as_str())?;
    let visual_id = id_field_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let stable = stable_field_regex()
        .captures(line)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str() == "1");
    Some(RawReading {
        weight: Some(weight),
        visual_id,
        electronic_id: None,
        stable,
        source_raw: line.to_string(),
    })
}

fn bare_number(line: &str) -> Option<RawReading> {
    let without_eid = eid_regex().replace_all(line, " ");
    let weight = without_eid
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .find_map(|token| {
            let token = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            token.parse::<f64>().ok()
        })?;
    if !(weight > 0.0 && weight < BARE_NUMBER_LIMIT) {
        debug!(weight, "bare number outside plausible range");
        return None;
    }
    Some(RawReading::weight(weight, true, line))
}

/// Default ASCII rules, highest priority first.
pub fn ascii_rules() -> RuleSet<RawReading> {
    RuleSet::new()
        .with("w_unit", w_unit)
        .with("labelled_fields", labelled_fields)
        .with("bare_number", bare_number)
}

pub struct AsciiCodec {
    rules: RuleSet<RawReading>,
    pending_eid: Option<String>,
}

impl AsciiCodec {
    pub fn new() -> Self {
        Self::with_rules(ascii_rules())
    }

    pub fn with_rules(rules: RuleSet<RawReading>) -> Self {
        Self {
            rules,
            pending_eid: None,
        }
    }
}

impl Default for AsciiCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for AsciiCodec {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Ascii
    }

    fn decode(&mut self, line: &str) -> Result<Decoded, ProtocolError> {
        let line = line.trim();
        let eid = extract_eid(line);

        let Some(m) = self.rules.evaluate(line) else {
            if let Some(eid) = eid {
                debug!(eid = %eid, "holding EID for the next weight");
                self.pending_eid = Some(eid);
            } else {
                debug!(line, "ascii line unrecognized");
            }
            return Ok(Decoded::Unrecognized);
        };

        let mut reading = m.value;
        if reading.electronic_id.is_none() {
            reading.electronic_id = eid.or_else(|| self.pending_eid.take());
        }
        self.pending_eid = None;
        debug!(rule = %m.rule, weight = ?reading.weight, "ascii line decoded");
        Ok(Decoded::Reading(reading))
    }
}
