//! `scalelink-runtime` – runs a connection to the weighing indicator.
//!
//! Wires the lower crates together: transports from `scalelink-transport`,
//! codecs from `scalelink-protocol`, lifecycle rules from `scalelink-kernel`
//! and delivery from `scalelink-middleware`.
//!
//! # Modules
//!
//! - [`manager`] – [`ConnectionManager`][manager::ConnectionManager]: the
//!   single owner of the indicator connection.  `connect` runs one bounded
//!   attempt; a spawned session task then decodes, normalises, polls and
//!   watches liveness until `disconnect` cancels it.
//! - [`capture`] – [`SessionCapture`][capture::SessionCapture]: forwards
//!   published readings to an external
//!   [`RecordSink`][capture::RecordSink], tagged with the farm/lot from a
//!   [`ReferenceSource`][capture::ReferenceSource].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP span export.

pub mod capture;
pub mod manager;
pub mod telemetry;

pub use capture::{
    CaptureContext, CaptureError, CaptureStats, CapturedRecord, Farm, Lot, RecordSink,
    ReferenceSource, SessionCapture, resolve_context,
};
pub use manager::{ConnectionManager, ManagerConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
