//! Time/priority-ordered event queue.
//!
//! Safe for concurrent producers and consumers. Ordering key is
//! `(next_fire_time, priority, insertion_seq)`; the insertion sequence is the
//! tie-break that keeps equal-priority, equal-time events FIFO.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::event::Event;

/// Queue operation failures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `put` attempted after the hosting engine shut the queue down.
    #[error("Queue is closed")]
    Closed,

    /// The event's trigger reported no further occurrences.
    #[error("Trigger for event '{0}' is exhausted")]
    TriggerExhausted(String),
}

/// Heap entry. `Ord` is inverted so the `BinaryHeap` max-heap pops the
/// earliest `(fire_at, priority, seq)` first.
struct QueuedEvent {
    fire_at: DateTime<Utc>,
    priority: i64,
    seq: u64,
    event: Event,
}

impl QueuedEvent {
    fn key(&self) -> (DateTime<Utc>, i64, u64) {
        (self.fire_at, self.priority, self.seq)
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct Inner {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
    closed: bool,
}

/// Thread-safe priority queue ordering events for dispatch.
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl EventQueue {
    /// Create an open, empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an event.
    ///
    /// If the event carries a trigger, its next occurrence is computed here;
    /// an exhausted trigger rejects the event without touching queue state.
    /// Events without a trigger fire immediately.
    pub fn put(&self, mut event: Event) -> Result<(), QueueError> {
        let now = Utc::now();
        let fire_at = match event.trigger.as_mut() {
            Some(trigger) => match trigger.next(now) {
                Some(at) => at,
                None => {
                    debug!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        "Dropping event with exhausted trigger"
                    );
                    return Err(QueueError::TriggerExhausted(event.event_type));
                }
            },
            None => now,
        };
        event.next_fire_time = Some(fire_at);

        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueuedEvent {
                fire_at,
                priority: event.priority,
                seq,
                event,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Pop the earliest event whose fire time has arrived, if any.
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Option<Event> {
        let mut inner = self.lock();
        let due = matches!(inner.heap.peek(), Some(head) if head.fire_at <= now);
        if due {
            inner.heap.pop().map(|q| q.event)
        } else {
            None
        }
    }

    /// Pop all currently-ready events in dispatch order.
    pub fn drain_ready(&self, now: DateTime<Utc>) -> Vec<Event> {
        let mut inner = self.lock();
        let mut ready = Vec::new();
        while matches!(inner.heap.peek(), Some(head) if head.fire_at <= now) {
            if let Some(q) = inner.heap.pop() {
                ready.push(q.event);
            }
        }
        ready
    }

    /// Wait until an event is ready, a new insertion arrives, or the timeout
    /// elapses. Returns `true` if an event may be ready.
    ///
    /// This is the deadline-aware wait that lets the dispatch loop avoid
    /// busy-polling between ticks.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();

            let next_fire = {
                let inner = self.lock();
                if inner.closed {
                    return false;
                }
                inner.heap.peek().map(|head| head.fire_at)
            };

            let now = Utc::now();
            if matches!(next_fire, Some(at) if at <= now) {
                return true;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }

            let sleep_for = match next_fire {
                Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(remaining),
                None => remaining,
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Mark the queue closed. Pending events remain drainable; further `put`
    /// calls fail with [`QueueError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// True if no events are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{Repeat, Trigger};
    use chrono::Duration as ChronoDuration;

    fn far_future() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::days(365)
    }

    #[test]
    fn test_orders_by_fire_time_then_priority() {
        let queue = EventQueue::new();
        let soon = Utc::now() - ChronoDuration::seconds(10);

        queue
            .put(Event::new("late").trigger(Trigger::once(soon + ChronoDuration::seconds(5))))
            .unwrap();
        queue
            .put(Event::new("low").priority(20).trigger(Trigger::once(soon)))
            .unwrap();
        queue
            .put(Event::new("high").priority(1).trigger(Trigger::once(soon)))
            .unwrap();

        let drained = queue.drain_ready(Utc::now());
        let order: Vec<&str> = drained.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(order, vec!["high", "low", "late"]);
    }

    #[test]
    fn test_ties_preserve_insertion_order() {
        let queue = EventQueue::new();
        let at = Utc::now() - ChronoDuration::seconds(1);
        for name in ["a", "b", "c", "d"] {
            queue.put(Event::new(name).trigger(Trigger::once(at))).unwrap();
        }

        let order: Vec<String> = queue
            .drain_ready(Utc::now())
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_pop_ready_respects_fire_time() {
        let queue = EventQueue::new();
        queue
            .put(Event::new("future").trigger(Trigger::once(far_future())))
            .unwrap();

        assert!(queue.pop_ready(Utc::now()).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_untriggered_event_fires_immediately() {
        let queue = EventQueue::new();
        queue.put(Event::new("now")).unwrap();
        assert!(queue.pop_ready(Utc::now()).is_some());
    }

    #[test]
    fn test_exhausted_trigger_rejected_without_queue_change() {
        let queue = EventQueue::new();
        queue.put(Event::new("keeper")).unwrap();

        let mut spent = Trigger::once(Utc::now());
        spent.next(Utc::now());
        spent.next(Utc::now());

        let err = queue.put(Event::new("spent").trigger(spent)).unwrap_err();
        assert!(matches!(err, QueueError::TriggerExhausted(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_put_after_close_fails() {
        let queue = EventQueue::new();
        queue.close();
        let err = queue.put(Event::new("x")).unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[test]
    fn test_rearm_cycle_through_put() {
        let queue = EventQueue::new();
        let start = Utc::now() - ChronoDuration::seconds(60);
        queue
            .put(Event::new("tick").trigger(Trigger::interval_with(
                Duration::from_secs(10),
                Some(start),
                Repeat::Times(2),
            )))
            .unwrap();

        let first = queue.pop_ready(Utc::now()).unwrap();
        queue.put(first.clone()).unwrap();
        let second = queue.pop_ready(Utc::now()).unwrap();
        assert!(second.next_fire_time.unwrap() > first.next_fire_time.unwrap());

        // Third occurrence does not exist.
        assert!(matches!(
            queue.put(second).unwrap_err(),
            QueueError::TriggerExhausted(_)
        ));
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_insert() {
        let queue = std::sync::Arc::new(EventQueue::new());
        let waiter = queue.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_ready(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(Event::new("wake")).unwrap();

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_when_empty() {
        let queue = EventQueue::new();
        assert!(!queue.wait_ready(Duration::from_millis(30)).await);
    }
}
