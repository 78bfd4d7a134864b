use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tracing::trace;

use crate::clock::{Clock, Scheduler, Timer, TimerId};

/// Time-ordered queue; entries due at the same instant pop in insertion order.
#[derive(Debug)]
pub struct EventQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry<T> {
    at: Duration,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: Duration, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { at, seq, item }));
    }

    pub fn pop(&mut self) -> Option<(Duration, T)> {
        self.heap.pop().map(|Reverse(entry)| (entry.at, entry.item))
    }

    pub fn peek_time(&self) -> Option<Duration> {
        self.heap.peek().map(|Reverse(entry)| entry.at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Virtual clock plus timer queue.
///
/// Time only moves when the driver advances it or pops a timer. Cancelled
/// timers stay in the queue and are skipped when they surface.
#[derive(Debug, Default)]
pub struct SimScheduler {
    now: Duration,
    queue: EventQueue<(TimerId, Timer)>,
    next_id: u64,
    live: HashSet<TimerId>,
    periods: HashMap<TimerId, Duration>,
}

impl SimScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward. Never moves it back.
    pub fn advance_to(&mut self, at: Duration) {
        if at > self.now {
            self.now = at;
        }
    }

    /// When the earliest queued timer is due, cancelled ones included.
    pub fn next_time(&self) -> Option<Duration> {
        self.queue.peek_time()
    }

    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Pops the next live timer and advances the clock to it.
    ///
    /// Repeating timers are requeued one period later.
    pub fn pop(&mut self) -> Option<(Duration, TimerId, Timer)> {
        while let Some((at, (id, timer))) = self.queue.pop() {
            if !self.live.contains(&id) {
                trace!(timer = %id, "skipping cancelled timer");
                continue;
            }
            self.advance_to(at);
            match self.periods.get(&id) {
                Some(period) => self.queue.push(at + *period, (id, timer)),
                None => {
                    self.live.remove(&id);
                }
            }
            return Some((at, id, timer));
        }
        None
    }

    fn allocate(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        id
    }
}

impl Clock for SimScheduler {
    fn now(&self) -> Duration {
        self.now
    }
}

impl Scheduler for SimScheduler {
    fn schedule_after(&mut self, delay: Duration, timer: Timer) -> TimerId {
        let id = self.allocate();
        self.queue.push(self.now + delay, (id, timer));
        id
    }

    fn schedule_repeating(&mut self, period: Duration, timer: Timer) -> TimerId {
        let id = self.allocate();
        self.periods.insert(id, period);
        self.queue.push(self.now + period, (id, timer));
        id
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        self.periods.remove(&id);
        self.live.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_queue_orders_by_time_then_insertion() {
        let mut queue = EventQueue::new();
        queue.push(ms(20), "late");
        queue.push(ms(10), "first");
        queue.push(ms(10), "second");

        assert_eq!(queue.peek_time(), Some(ms(10)));
        assert_eq!(queue.pop(), Some((ms(10), "first")));
        assert_eq!(queue.pop(), Some((ms(10), "second")));
        assert_eq!(queue.pop(), Some((ms(20), "late")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut scheduler = SimScheduler::new();
        let id = scheduler.schedule_after(ms(50), Timer::StopApplications);

        assert_eq!(scheduler.pop(), Some((ms(50), id, Timer::StopApplications)));
        assert_eq!(scheduler.now(), ms(50));
        assert_eq!(scheduler.pop(), None);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_repeating_requeues_until_cancelled() {
        let mut scheduler = SimScheduler::new();
        let id = scheduler.schedule_repeating(ms(100), Timer::MigrationTick);

        let fired: Vec<_> = (0..3).filter_map(|_| scheduler.pop()).map(|(at, _, _)| at).collect();
        assert_eq!(fired, vec![ms(100), ms(200), ms(300)]);

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.pop(), None);
    }

    #[test]
    fn test_cancelled_one_shot_is_skipped() {
        let mut scheduler = SimScheduler::new();
        let early = scheduler.schedule_after(ms(10), Timer::MigrationTick);
        let late = scheduler.schedule_after(ms(20), Timer::StopApplications);
        scheduler.cancel(early);

        assert_eq!(scheduler.pop(), Some((ms(20), late, Timer::StopApplications)));
    }

    #[test]
    fn test_clock_never_goes_back() {
        let mut scheduler = SimScheduler::new();
        scheduler.advance_to(ms(30));
        scheduler.advance_to(ms(10));
        assert_eq!(scheduler.now(), ms(30));
    }
}
