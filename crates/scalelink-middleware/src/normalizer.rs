//! [`Normalizer`] – turns decoded [`RawReading`]s into publishable
//! [`ScaleReading`]s.
//!
//! Every candidate passes through three steps:
//!
//! 1. **Validation** – weight present, finite, positive and within
//!    [`NormalizerConfig::max_weight_kg`]; optionally an animal ID.
//! 2. **De-duplication** – indicators repeat the same stable weight for as
//!    long as the animal stands on the platform.  A reading is dropped when
//!    it matches the last emitted one on identity, falls inside the time
//!    window and lies within the weight tolerance of the emitted weight.
//! 3. **Stamping** – the receipt time becomes `timestamp`; the device clock
//!    is never consulted.
//!
//! Rejections are data problems, not connection problems: they are logged at
//! `debug` and counted, never turned into an error status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use scalelink_types::{RawReading, ScaleReading, ValidationError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    pub max_weight_kg: f64,
    pub dedupe_window: Duration,
    pub dedupe_tolerance_kg: f64,
    pub require_identifier: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_weight_kg: 10_000.0,
            dedupe_window: Duration::from_secs(2),
            dedupe_tolerance_kg: 0.5,
            require_identifier: false,
        }
    }
}

/// Counters since construction (not cleared by [`Normalizer::reset`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Identity and weight of the last emitted reading, and when a matching
/// reading was last seen.
#[derive(Debug, Clone)]
struct LastSeen {
    key: Option<String>,
    weight: f64,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
    last: Option<LastSeen>,
    stats: NormalizerStats,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            last: None,
            stats: NormalizerStats::default(),
        }
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats
    }

    /// Check `raw` without touching the de-duplication history.
    ///
    /// Returns the validated weight.
    pub fn validate(&self, raw: &RawReading) -> Result<f64, ValidationError> {
        let weight = raw.weight.ok_or(ValidationError::MissingWeight)?;
        if !weight.is_finite() {
            return Err(ValidationError::NotFinite(weight));
        }
        if weight <= 0.0 {
            return Err(ValidationError::NonPositiveWeight(weight));
        }
        if weight > self.config.max_weight_kg {
            return Err(ValidationError::OutOfRange {
                weight,
                max: self.config.max_weight_kg,
            });
        }
        if self.config.require_identifier && raw.animal_id().is_none() {
            return Err(ValidationError::MissingIdentifier);
        }
        Ok(weight)
    }

    /// Validate, de-duplicate and stamp `raw` as received at `now`.
    ///
    /// `Ok(None)` means the reading was a duplicate.
    pub fn try_ingest_at(
        &mut self,
        raw: RawReading,
        now: DateTime<Utc>,
    ) -> Result<Option<ScaleReading>, ValidationError> {
        let weight = match self.validate(&raw) {
            Ok(w) => w,
            Err(e) => {
                self.stats.rejected += 1;
                return Err(e);
            }
        };

        let key = raw.animal_id().map(str::to_owned);
        let duplicate = self
            .last
            .as_ref()
            .is_some_and(|last| self.is_duplicate(last, key.as_deref(), weight, now));

        if duplicate {
            // A repeat refreshes the window, not the reference weight.
            if let Some(last) = self.last.as_mut() {
                last.at = now;
            }
            self.stats.duplicates += 1;
            debug!(weight, "duplicate reading dropped");
            return Ok(None);
        }

        self.last = Some(LastSeen {
            key,
            weight,
            at: now,
        });
        self.stats.accepted += 1;
        Ok(Some(ScaleReading {
            weight,
            visual_id: raw.visual_id,
            electronic_id: raw.electronic_id,
            stable: raw.stable,
            timestamp: now,
            source_raw: raw.source_raw,
        }))
    }

    /// Like [`try_ingest_at`](Self::try_ingest_at), with rejections logged
    /// and swallowed.
    pub fn ingest_at(&mut self, raw: RawReading, now: DateTime<Utc>) -> Option<ScaleReading> {
        let source = raw.source_raw.clone();
        match self.try_ingest_at(raw, now) {
            Ok(reading) => reading,
            Err(e) => {
                debug!(error = %e, raw = %source, "reading rejected");
                None
            }
        }
    }

    pub fn ingest(&mut self, raw: RawReading) -> Option<ScaleReading> {
        self.ingest_at(raw, Utc::now())
    }

    /// Forget the de-duplication history.  Called for every new connection.
    pub fn reset(&mut self) {
        self.last = None;
    }

    fn is_duplicate(
        &self,
        last: &LastSeen,
        key: Option<&str>,
        weight: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if last.key.as_deref() != key {
            return false;
        }
        let gap = match (now - last.at).to_std() {
            Ok(gap) => gap,
            // Clock went backwards; treat as simultaneous.
            Err(_) => Duration::ZERO,
        };
        gap < self.config.dedupe_window
            && (weight - last.weight).abs() < self.config.dedupe_tolerance_kg
    }
}
