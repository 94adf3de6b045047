//! The wall-clock seam.
//!
//! Every window (bids, challenges, leases) is measured through this trait so
//! tests can step time manually instead of sleeping.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    /// Current time, milliseconds.
    fn now_ms(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl TimeSource for Arc<dyn TimeSource> {
    fn now_ms(&self) -> u64 {
        self.as_ref().now_ms()
    }
}
