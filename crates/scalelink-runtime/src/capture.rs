//! Session capture – persisting accepted readings.
//!
//! The core never stores anything itself.  A weighing session hands each
//! accepted [`ScaleReading`] to an external [`RecordSink`] together with the
//! farm/lot the operator picked from a [`ReferenceSource`].
//!
//! [`SessionCapture`] listens on the reading topic of the [`EventBus`], so it
//! sees exactly what every other consumer sees, and counts what it persisted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use scalelink_middleware::{EventBus, Topic};
use scalelink_types::{EventPayload, ScaleReading};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("reference data unavailable: {0}")]
    Unavailable(String),

    #[error("unknown {kind} '{name}'")]
    UnknownReference { kind: &'static str, name: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Farm {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: String,
    pub farm_id: String,
    pub name: String,
}

/// Where a captured reading belongs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureContext {
    pub farm_id: Option<String>,
    pub lot_id: Option<String>,
}

/// One reading as handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRecord {
    pub reading: ScaleReading,
    #[serde(flatten)]
    pub context: CaptureContext,
}

/// Persists records somewhere outside the core (database, API, file).
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn persist(&self, record: CapturedRecord) -> Result<(), CaptureError>;
}

/// Supplies the farms and lots an operator can assign readings to.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn farms(&self) -> Result<Vec<Farm>, CaptureError>;

    async fn lots(&self, farm_id: &str) -> Result<Vec<Lot>, CaptureError>;
}

/// Resolve a farm (and optionally a lot) by id or case-insensitive name.
pub async fn resolve_context(
    source: &dyn ReferenceSource,
    farm: &str,
    lot: Option<&str>,
) -> Result<CaptureContext, CaptureError> {
    let farms = source.farms().await?;
    let farm = farms
        .into_iter()
        .find(|f| f.id == farm || f.name.eq_ignore_ascii_case(farm))
        .ok_or_else(|| CaptureError::UnknownReference {
            kind: "farm",
            name: farm.to_string(),
        })?;

    let lot_id = match lot {
        None => None,
        Some(wanted) => {
            let lots = source.lots(&farm.id).await?;
            let lot = lots
                .into_iter()
                .find(|l| l.id == wanted || l.name.eq_ignore_ascii_case(wanted))
                .ok_or_else(|| CaptureError::UnknownReference {
                    kind: "lot",
                    name: wanted.to_string(),
                })?;
            Some(lot.id)
        }
    };

    Ok(CaptureContext {
        farm_id: Some(farm.id),
        lot_id,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionCapture
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub persisted: u64,
    pub skipped_unstable: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    persisted: AtomicU64,
    skipped_unstable: AtomicU64,
    failed: AtomicU64,
}

/// Forwards published readings to a [`RecordSink`] until stopped or dropped.
pub struct SessionCapture {
    counters: Arc<Counters>,
    task: Option<JoinHandle<()>>,
}

impl SessionCapture {
    /// Start capturing.  Readings published before this call are not seen.
    ///
    /// With `stable_only` unstable readings are counted and skipped.
    pub fn start(
        bus: &EventBus,
        sink: Arc<dyn RecordSink>,
        context: CaptureContext,
        stable_only: bool,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let mut rx = bus.subscribe_to(Topic::Readings);
        let tally = Arc::clone(&counters);

        let task = tokio::spawn(async move {
            info!(farm = ?context.farm_id, lot = ?context.lot_id, stable_only, "capture started");
            loop {
                let reading = match rx.recv().await {
                    Ok(event) => match event.payload {
                        EventPayload::Reading(reading) => reading,
                        EventPayload::StatusChanged(_) => continue,
                    },
                    Err(RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "capture fell behind; readings dropped");
                        tally.failed.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if stable_only && !reading.stable {
                    debug!(weight = reading.weight, "unstable reading not captured");
                    tally.skipped_unstable.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let record = CapturedRecord {
                    reading,
                    context: context.clone(),
                };
                match sink.persist(record).await {
                    Ok(()) => {
                        tally.persisted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "record not persisted");
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        Self {
            counters,
            task: Some(task),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            skipped_unstable: self.counters.skipped_unstable.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop capturing and return the final counts.
    pub fn stop(mut self) -> CaptureStats {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.stats()
    }
}

impl Drop for SessionCapture {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scalelink_types::Event;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<CapturedRecord>>,
        reject_below: Option<f64>,
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn persist(&self, record: CapturedRecord) -> Result<(), CaptureError> {
            if self.reject_below.is_some_and(|min| record.reading.weight < min) {
                return Err(CaptureError::Rejected("too light".into()));
            }
            self.records.lock().expect("records").push(record);
            Ok(())
        }
    }

    struct StaticReferences;

    #[async_trait]
    impl ReferenceSource for StaticReferences {
        async fn farms(&self) -> Result<Vec<Farm>, CaptureError> {
            Ok(vec![Farm {
                id: "F1".into(),
                name: "Hill Station".into(),
            }])
        }

        async fn lots(&self, farm_id: &str) -> Result<Vec<Lot>, CaptureError> {
            Ok(vec![Lot {
                id: "L7".into(),
                farm_id: farm_id.to_string(),
                name: "Weaners".into(),
            }])
        }
    }

    fn publish(bus: &EventBus, weight: f64, stable: bool) {
        let reading = ScaleReading {
            weight,
            visual_id: Some("VIS001".into()),
            electronic_id: None,
            stable,
            timestamp: Utc::now(),
            source_raw: format!("{weight}"),
        };
        let _ = bus.publish(Event::new("test", EventPayload::Reading(reading)));
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn stable_only_capture_skips_unstable_readings() {
        let bus = EventBus::default();
        let sink = Arc::new(MemorySink::default());
        let capture = SessionCapture::start(&bus, sink.clone(), CaptureContext::default(), true);

        publish(&bus, 300.0, true);
        publish(&bus, 301.0, false);
        settle().await;

        let stats = capture.stop();
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.skipped_unstable, 1);
        assert_eq!(sink.records.lock().expect("records")[0].reading.weight, 300.0);
    }

    #[tokio::test]
    async fn sink_failures_are_counted() {
        let bus = EventBus::default();
        let sink = Arc::new(MemorySink {
            reject_below: Some(100.0),
            ..MemorySink::default()
        });
        let capture = SessionCapture::start(&bus, sink, CaptureContext::default(), false);

        publish(&bus, 50.0, true);
        publish(&bus, 150.0, false);
        settle().await;

        assert_eq!(
            capture.stats(),
            CaptureStats {
                persisted: 1,
                skipped_unstable: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn records_carry_the_resolved_context() -> Result<(), Box<dyn std::error::Error>> {
        let context = resolve_context(&StaticReferences, "hill station", Some("weaners")).await?;
        assert_eq!(context.farm_id.as_deref(), Some("F1"));
        assert_eq!(context.lot_id.as_deref(), Some("L7"));

        let bus = EventBus::default();
        let sink = Arc::new(MemorySink::default());
        let _capture = SessionCapture::start(&bus, sink.clone(), context.clone(), false);
        publish(&bus, 222.0, true);
        settle().await;

        assert_eq!(sink.records.lock().expect("records")[0].context, context);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_farm_is_reported() {
        let err = resolve_context(&StaticReferences, "Nowhere", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CaptureError::UnknownReference {
                kind: "farm",
                name: "Nowhere".into()
            }
        );
    }
}
