//! Connection lifecycle rules.
//!
//! ```text
//! Idle ──► Connecting ──► Connected ◄──► Stale
//!   ▲           │              │           │
//!   │           ▼              ▼           ▼
//!   └──────── Error ◄──────────┴───────────┘
//! ```
//!
//! Every live state may also drop straight back to `Idle` (explicit
//! disconnect) or start over at `Connecting` (a new connect tears the old
//! session down first).  [`check_transition`] is the single authority; the
//! Connection Manager routes every status change through
//! [`ConnectionStateMachine::transition`].

use scalelink_types::{ConnectionState, ScaleError};
use tracing::{debug, info};

use ConnectionState::{Connected, Connecting, Error, Idle, Stale};

/// `Ok(())` when `from → to` is a legal lifecycle step.
///
/// Staying in the same state is always allowed.
pub fn check_transition(from: ConnectionState, to: ConnectionState) -> Result<(), ScaleError> {
    let allowed = from == to
        || matches!(
            (from, to),
            (Idle, Connecting)
                | (Idle, Error)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Idle)
                | (Connected, Stale)
                | (Connected, Error)
                | (Connected, Idle)
                | (Connected, Connecting)
                | (Stale, Connected)
                | (Stale, Error)
                | (Stale, Idle)
                | (Stale, Connecting)
                | (Error, Idle)
                | (Error, Connecting)
        );
    if allowed {
        Ok(())
    } else {
        Err(ScaleError::InvalidTransition { from, to })
    }
}

/// Current lifecycle state guarded by [`check_transition`].
#[derive(Debug, Default, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState, ScaleError> {
        let from = self.state;
        check_transition(from, to)?;
        if from != to {
            info!(%from, %to, "connection state changed");
        } else {
            debug!(state = %to, "connection state unchanged");
        }
        self.state = to;
        Ok(from)
    }

    /// Back to `Idle` from anywhere.
    pub fn reset(&mut self) -> ConnectionState {
        std::mem::replace(&mut self.state, Idle)
    }
}
