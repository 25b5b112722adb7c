//! Wall-clock seam for the lateness policy.
//!
//! The summarizer compares event timestamps against wall-clock time when
//! deciding whether an observation is too late and whether a window may be
//! emitted. Reading the clock through this handle lets tests pin time to an
//! exact second instead of sleeping against the real clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in Unix seconds.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    /// The system wall clock.
    #[default]
    System,
    /// A fixed, test-controlled clock.
    Fixed(Arc<AtomicI64>),
}

impl Clock {
    /// A fixed clock starting at `secs`, plus the handle used to move it.
    pub fn fixed(secs: i64) -> (Clock, Arc<AtomicI64>) {
        let cell = Arc::new(AtomicI64::new(secs));
        (Clock::Fixed(Arc::clone(&cell)), cell)
    }

    /// Current time in Unix seconds.
    pub fn now_unix(&self) -> i64 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs() as i64),
            Clock::Fixed(cell) => cell.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_reads_and_advances() {
        let (clock, handle) = Clock::fixed(20);
        assert_eq!(clock.now_unix(), 20);
        handle.store(35, Ordering::Relaxed);
        assert_eq!(clock.now_unix(), 35);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(Clock::System.now_unix() > 1_577_836_800);
    }
}
