//! `scalelink-kernel` – connection rules.
//!
//! Holds no I/O.  It decides which lifecycle steps are legal, whether a link
//! has gone quiet, and whether a connect attempt may start.
//!
//! # Modules
//!
//! - [`state_machine`] – [`check_transition`] and
//!   [`ConnectionStateMachine`][state_machine::ConnectionStateMachine]:
//!   the `Idle → Connecting → Connected → Stale/Error → Idle` lifecycle.
//! - [`liveness`] – [`LivenessMonitor`][liveness::LivenessMonitor]:
//!   heartbeat bookkeeping for staleness, expiry and the "data actively
//!   flowing" short-circuit.
//! - [`guard`] – [`ConnectGate`][guard::ConnectGate]: the in-progress flag
//!   that rejects overlapping connect attempts.

pub mod guard;
pub mod liveness;
pub mod state_machine;

pub use guard::{ConnectGate, ConnectGuard};
pub use liveness::{Liveness, LivenessMonitor};
pub use state_machine::{ConnectionStateMachine, check_transition};
