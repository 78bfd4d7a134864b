use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::session::ClientId;
use crate::transport::EndpointId;

pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Observable milestones of the sessions, for external reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected {
        client: ClientId,
        endpoint: EndpointId,
    },
    ClientConnectFailed {
        client: ClientId,
    },
    ClientClosed {
        client: ClientId,
        received_this_connection: u64,
    },
    TransferCompleted {
        client: ClientId,
        bytes: u64,
    },
    Migrated {
        client: ClientId,
        at: Duration,
        from: IpAddr,
        to: IpAddr,
    },
    ServerAccepted {
        endpoint: EndpointId,
    },
    BulkPhaseStarted {
        endpoint: EndpointId,
        budget: u64,
    },
    BulkPhaseFinished {
        endpoint: EndpointId,
        bytes: u64,
    },
    /// Stands in for events a lagging subscriber never saw.
    EventsDropped {
        count: u64,
    },
}

/// Fans session milestones out to any number of observers.
///
/// Publishing never blocks and never fails. A subscriber that falls more
/// than the channel capacity behind loses the oldest events; the loss is
/// counted here and reported in the gap when it drains.
#[derive(Debug, Clone)]
pub struct SessionEventBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
    lost: Arc<AtomicU64>,
}

impl SessionEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            lost: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn send(&self, event: SessionEvent) {
        // Only fails when nobody is subscribed.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> SessionEventReceiver {
        SessionEventReceiver {
            inner: self.tx.subscribe(),
            lost: self.lost.clone(),
        }
    }

    /// Events missed by lagging subscribers, summed over all of them.
    pub fn total_drops(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl Default for SessionEventBroadcaster {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[derive(Debug)]
pub struct SessionEventReceiver {
    inner: broadcast::Receiver<SessionEvent>,
    lost: Arc<AtomicU64>,
}

impl SessionEventReceiver {
    /// Everything published since the last drain, oldest first.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match self.inner.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(count)) => {
                    self.lost.fetch_add(count, Ordering::Relaxed);
                    events.push(SessionEvent::EventsDropped { count });
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(n: u64) -> SessionEvent {
        SessionEvent::ServerAccepted {
            endpoint: EndpointId(n),
        }
    }

    #[test]
    fn test_drain_returns_events_in_order() {
        let broadcaster = SessionEventBroadcaster::default();
        let mut receiver = broadcaster.subscribe();

        broadcaster.send(SessionEvent::ClientConnectFailed {
            client: ClientId(3),
        });
        broadcaster.send(accepted(2));

        assert_eq!(
            receiver.drain(),
            vec![
                SessionEvent::ClientConnectFailed {
                    client: ClientId(3)
                },
                accepted(2),
            ]
        );
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn test_every_subscriber_sees_each_event() {
        let broadcaster = SessionEventBroadcaster::default();
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.clone().subscribe();

        broadcaster.send(accepted(7));

        assert_eq!(first.drain(), vec![accepted(7)]);
        assert_eq!(second.drain(), vec![accepted(7)]);
    }

    #[test]
    fn test_lagging_subscriber_sees_the_gap() {
        let broadcaster = SessionEventBroadcaster::new(4);
        let mut receiver = broadcaster.subscribe();

        for i in 0..10 {
            broadcaster.send(accepted(i));
        }

        let events = receiver.drain();
        assert_eq!(events[0], SessionEvent::EventsDropped { count: 6 });
        assert_eq!(events[1..], [accepted(6), accepted(7), accepted(8), accepted(9)]);
        assert_eq!(broadcaster.total_drops(), 6);
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = SessionEventBroadcaster::default();
        broadcaster.send(accepted(0));
        assert_eq!(broadcaster.total_drops(), 0);
    }
}
