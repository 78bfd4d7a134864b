//! Time authority consumed by the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timer {
    MigrationTick,
    StopApplications,
}

pub trait Clock {
    /// Time elapsed since the run started.
    fn now(&self) -> Duration;
}

pub trait Scheduler: Clock {
    fn schedule_after(&mut self, delay: Duration, timer: Timer) -> TimerId;

    /// Fires every `period`, first at `now + period`, until cancelled.
    fn schedule_repeating(&mut self, period: Duration, timer: Timer) -> TimerId;

    fn cancel(&mut self, id: TimerId) -> bool;
}

/// Seconds with millisecond precision, the way run reports print time.
pub fn seconds(at: Duration) -> f64 {
    (at.as_millis() as f64) / 1000.0
}

/// External stop signal shared between the driver and whoever ends the run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::new();
        let other = handle.clone();
        assert!(!other.is_raised());

        handle.raise();
        assert!(other.is_raised());
    }

    #[test]
    fn test_seconds() {
        assert_eq!(seconds(Duration::from_millis(300)), 0.3);
        assert_eq!(seconds(Duration::from_secs(5)), 5.0);
    }
}
