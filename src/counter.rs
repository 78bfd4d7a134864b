//! Byte accounting that survives reconnection.
//!
//! [`ByteCounter`] holds the cumulative totals of a session; nothing but a new
//! session resets it. [`ConnectionCounter`] is the transient per-connection
//! tally that a reconnect throws away.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounter {
    sent: u64,
    received: u64,
    completed: u64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.sent = self.sent.saturating_add(bytes as u64);
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.received = self.received.saturating_add(bytes as u64);
    }

    /// Credits a finished transfer. The credit is capped so that completed
    /// bytes never exceed received bytes; returns the amount actually credited.
    pub fn complete_transfer(&mut self, bytes: u64) -> u64 {
        let credit = bytes.min(self.received - self.completed);
        self.completed += credit;
        credit
    }

    pub fn total_sent(&self) -> u64 {
        self.sent
    }

    pub fn total_received(&self) -> u64 {
        self.received
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCounter {
    pub sent: u64,
    pub received: u64,
}

impl ConnectionCounter {
    pub fn record_sent(&mut self, bytes: usize) {
        self.sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.received += bytes as u64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let mut counter = ByteCounter::new();
        counter.record_sent(512);
        counter.record_sent(100);
        counter.record_received(13);

        assert_eq!(counter.total_sent(), 612);
        assert_eq!(counter.total_received(), 13);
        assert_eq!(counter.completed(), 0);
    }

    #[test]
    fn test_completed_never_exceeds_received() {
        let mut counter = ByteCounter::new();
        counter.record_received(1000);

        assert_eq!(counter.complete_transfer(600), 600);
        assert_eq!(counter.complete_transfer(600), 400);
        assert_eq!(counter.complete_transfer(1), 0);
        assert_eq!(counter.completed(), 1000);
        assert!(counter.completed() <= counter.total_received());
    }

    #[test]
    fn test_connection_reset_leaves_totals_alone() {
        let mut totals = ByteCounter::new();
        let mut connection = ConnectionCounter::default();

        for _ in 0..3 {
            connection.record_received(512);
            totals.record_received(512);
        }
        connection.reset();

        assert_eq!(connection, ConnectionCounter::default());
        assert_eq!(totals.total_received(), 1536);
    }
}
