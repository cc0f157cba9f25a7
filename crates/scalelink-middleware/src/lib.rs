//! `scalelink-middleware` – what happens to a reading after it is decoded.
//!
//! # Modules
//!
//! - [`normalizer`] – [`Normalizer`][normalizer::Normalizer]: validation,
//!   de-duplication and receipt-time stamping of decoded readings.
//! - [`bus`] – [`EventBus`][bus::EventBus]: per-topic broadcast delivery of
//!   readings and status changes, plus callback-style
//!   [`Subscription`][bus::Subscription]s.

pub mod bus;
pub mod normalizer;

pub use bus::{EventBus, Subscription, Topic, TopicReceiver};
pub use normalizer::{Normalizer, NormalizerConfig, NormalizerStats};
