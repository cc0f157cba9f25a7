//! `scalelink-protocol` – what the indicator's bytes mean.
//!
//! Everything here is a pure function over data the Connection Manager
//! hands in, except [`adi::AdiClient`], which owns its HTTP requests.
//!
//! # Modules
//!
//! - [`framing`] – [`LineFramer`]: byte chunks → text frames.
//! - [`rules`] – [`RuleSet`]: ordered, named pattern rules; first match wins.
//! - [`codec`] – the [`Codec`] trait, [`Decoded`] results and [`codec_for`].
//! - [`scp`] – serial command protocol (`{VM}`, `{FN}`, `[U123.5]`, …).
//! - [`ascii`] – free-form streaming text.
//! - [`adi`] – the REST interface, its error-page detection and typed calls.

pub mod adi;
pub mod ascii;
pub mod codec;
pub mod framing;
pub mod rules;
pub mod scp;

pub use adi::{AdiClient, DeviceInfo, Reachability, SessionSummary, classify_body};
pub use ascii::AsciiCodec;
pub use codec::{Codec, Decoded, codec_for};
pub use framing::LineFramer;
pub use rules::{Rule, RuleSet};
pub use scp::{ScpCodec, ScpCommand};
