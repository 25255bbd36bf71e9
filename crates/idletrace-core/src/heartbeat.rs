//! Heartbeat stall detection
//!
//! Every beat compares the current activity fingerprint with the previous
//! one. Three consecutive identical snapshots mean nothing has started or
//! finished for a while, and the transaction is force-finished. The timer
//! loop itself lives on the idle transaction; this module holds the counter.

use std::time::Duration;

/// Default time between beats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Unchanged beats after which the transaction is force-finished
pub const MAX_UNCHANGED_BEATS: u32 = 3;

/// Tag set on transactions finished by the heartbeat
pub const HEARTBEAT_TAG: &str = "heartbeat";

/// Value of [`HEARTBEAT_TAG`]
pub const HEARTBEAT_FAILED: &str = "failed";

/// Result of a single beat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Activity changed or not stalled long enough; schedule another beat
    Continue,
    /// Stalled; finish the transaction
    Stalled,
}

/// Counter and last fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatState {
    counter: u32,
    previous: String,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self {
            counter: 1,
            previous: String::new(),
        }
    }
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint and decide whether the transaction has stalled
    pub fn observe(&mut self, fingerprint: String) -> Beat {
        if fingerprint == self.previous {
            self.counter += 1;
        } else {
            self.counter = 1;
        }
        self.previous = fingerprint;

        if self.counter >= MAX_UNCHANGED_BEATS {
            Beat::Stalled
        } else {
            Beat::Continue
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn previous(&self) -> &str {
        &self.previous
    }
}
