//! Wall-clock access behind a one-method seam.
//!
//! Every timer the engine keeps (retry backoff, recovery schedules, the
//! key-republish interval) compares wall-clock milliseconds. Routing the
//! single read through [`Clock`] lets the timer tests drive time by hand
//! instead of sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gossip_proto::board::Timestamp;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Timestamp;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A hand-driven clock for tests.
///
/// Cloning shares the underlying instant, so a test can hold one handle
/// while the engine holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock starting at the given epoch offset.
    #[must_use]
    pub fn starting_at(millis: u64) -> Self {
        let clock = Self::default();
        clock.set(millis);
        clock
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
