//! Clock offset shared by the components of one client.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock plus a correction toward the object store's clock.
///
/// One context is shared by everything a client owns, so independent
/// clients in one process keep independent estimates.
#[derive(Debug, Default)]
pub struct ClockContext {
    offset_ms: AtomicI64,
}

impl ClockContext {
    /// Creates a context with no correction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context with a starting correction, e.g. to simulate skew.
    pub fn with_offset(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// Returns the corrected time in milliseconds since the epoch.
    pub fn now(&self) -> u64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        (local + self.offset_ms()).max(0) as u64
    }

    /// Returns the current correction.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    /// Replaces the correction.
    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::SeqCst);
    }

    /// Shifts the correction by `delta_ms`.
    pub fn adjust(&self, delta_ms: i64) {
        self.offset_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}
