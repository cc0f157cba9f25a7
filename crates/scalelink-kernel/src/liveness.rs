//! [`LivenessMonitor`] – data-staleness tracking for one connection.
//!
//! The session task calls [`LivenessMonitor::heartbeat`] whenever anything
//! arrives from the device.  [`LivenessMonitor::assess`] then says whether
//! the link is fresh, stale (quiet for `stale_after`) or expired (quiet for
//! `expire_after`, time to tear it down).
//!
//! A separate, shorter question is "is data actively flowing right now?",
//! answered by [`LivenessMonitor::flowing_within`].  The Connection Manager
//! asks it before tearing down a working session for a repeated connect.

use std::time::{Duration, Instant};

/// Verdict of [`LivenessMonitor::assess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Fresh,
    Stale,
    Expired,
}

/// Tracks the last time the device said anything.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use scalelink_kernel::liveness::{Liveness, LivenessMonitor};
///
/// let start = Instant::now();
/// let mut monitor = LivenessMonitor::starting_at(
///     start,
///     Duration::from_secs(300),
///     Duration::from_secs(900),
/// );
/// assert_eq!(monitor.assess_at(start + Duration::from_secs(301)), Liveness::Stale);
///
/// monitor.heartbeat_at(start + Duration::from_secs(400));
/// assert_eq!(monitor.assess_at(start + Duration::from_secs(401)), Liveness::Fresh);
/// ```
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    /// Connection start, or the last heartbeat.
    last_seen: Instant,
    /// `true` once at least one heartbeat arrived.
    has_data: bool,
    stale_after: Duration,
    expire_after: Duration,
}

impl LivenessMonitor {
    /// Start monitoring now.  The connection itself counts as the first
    /// sign of life.
    pub fn new(stale_after: Duration, expire_after: Duration) -> Self {
        Self::starting_at(Instant::now(), stale_after, expire_after)
    }

    pub fn starting_at(start: Instant, stale_after: Duration, expire_after: Duration) -> Self {
        Self {
            last_seen: start,
            has_data: false,
            stale_after,
            expire_after: expire_after.max(stale_after),
        }
    }

    /// Record inbound data now.
    pub fn heartbeat(&mut self) {
        self.heartbeat_at(Instant::now());
    }

    pub fn heartbeat_at(&mut self, at: Instant) {
        if at >= self.last_seen {
            self.last_seen = at;
        }
        self.has_data = true;
    }

    pub fn assess(&self) -> Liveness {
        self.assess_at(Instant::now())
    }

    pub fn assess_at(&self, now: Instant) -> Liveness {
        let quiet = self.quiet_for_at(now);
        if quiet >= self.expire_after {
            Liveness::Expired
        } else if quiet >= self.stale_after {
            Liveness::Stale
        } else {
            Liveness::Fresh
        }
    }

    /// Time since the last sign of life.
    pub fn quiet_for_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// `true` when real data (not just the connect itself) arrived within
    /// `window`.
    pub fn flowing_within(&self, window: Duration) -> bool {
        self.flowing_within_at(window, Instant::now())
    }

    pub fn flowing_within_at(&self, window: Duration, now: Instant) -> bool {
        self.has_data && self.quiet_for_at(now) < window
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }
}
