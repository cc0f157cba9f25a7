//! [`ConnectGate`] – rejects overlapping connect attempts.
//!
//! Only one connect attempt may be in flight per manager.  The first caller
//! gets a [`ConnectGuard`]; everyone else gets `None` until that guard is
//! dropped, however the attempt ends (success, error, timeout, panic).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ConnectGate {
    in_progress: Arc<AtomicBool>,
}

impl ConnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, or `None` when another attempt holds it.
    pub fn try_acquire(&self) -> Option<ConnectGuard> {
        match self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(ConnectGuard {
                in_progress: Arc::clone(&self.in_progress),
            }),
            Err(_) => {
                debug!("connect attempt already in progress");
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

/// Held for the duration of one connect attempt; releases the gate on drop.
#[derive(Debug)]
pub struct ConnectGuard {
    in_progress: Arc<AtomicBool>,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::Release);
    }
}
