//! # Audio Message Queue
//!
//! Bounded, time-expiring FIFO buffer for outbound agent messages while the
//! agent connection is unavailable.
//!
//! ## Retention Policy:
//! - Entries expire after `expiration` (default 5s): stale buffered audio
//!   is treated as worse than silence.
//! - When full (default 100 entries), the oldest entry is evicted to make
//!   room; the newest audio is always kept.
//! - `flush` delivers at most once: a failed send drops the message instead
//!   of requeueing it, favoring call continuity over completeness.
//!
//! All wall-clock reads go through the injected [`Clock`] so expiry-boundary
//! behavior is deterministic under test.

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Relative importance of a queued message.
///
/// Stored with each entry; ordering is still strictly FIFO. Priority-aware
/// draining is a possible future change and the field keeps the wire-side
/// bookkeeping ready for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
    Normal,
    High,
}

/// One buffered outbound message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Serialized agent-protocol message, ready to write to the socket.
    pub payload: String,
    pub priority: MessagePriority,
    pub enqueued_at: Instant,
}

/// Result of a `flush` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
}

/// Bounded FIFO with time-based expiry.
pub struct AudioMessageQueue {
    items: VecDeque<QueuedMessage>,
    max_size: usize,
    expiration: Duration,
    clock: Arc<dyn Clock>,

    /// Cumulative messages lost to eviction, expiry, or failed sends.
    dropped_total: u64,
    /// Residency accounting for successfully drained messages.
    drained_total: u64,
    residency_total: Duration,
}

impl AudioMessageQueue {
    pub fn new(max_size: usize, expiration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: VecDeque::with_capacity(max_size),
            max_size,
            expiration,
            clock,
            dropped_total: 0,
            drained_total: 0,
            residency_total: Duration::ZERO,
        }
    }

    /// Buffer a message, expiring stale entries first and evicting the
    /// oldest entry if the queue is at capacity.
    pub fn enqueue(&mut self, payload: String, priority: MessagePriority) {
        self.expire_stale();

        if self.items.len() >= self.max_size {
            self.items.pop_front();
            self.dropped_total += 1;
        }

        self.items.push_back(QueuedMessage {
            payload,
            priority,
            enqueued_at: self.clock.now(),
        });
    }

    /// Pop the oldest non-expired message.
    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.expire_stale();
        let item = self.items.pop_front()?;
        self.record_residency(&item);
        Some(item)
    }

    /// Drain the queue in FIFO order through the supplied sender.
    ///
    /// A send returning `false` drops that message (counted, not requeued)
    /// and continues with the rest: at-most-once delivery.
    pub fn flush<F>(&mut self, mut send: F) -> FlushReport
    where
        F: FnMut(&str) -> bool,
    {
        self.expire_stale();

        let mut report = FlushReport::default();
        while let Some(item) = self.items.pop_front() {
            self.record_residency(&item);
            if send(&item.payload) {
                report.sent += 1;
            } else {
                report.dropped += 1;
                self.dropped_total += 1;
            }
        }

        if report.dropped > 0 {
            debug!(
                sent = report.sent,
                dropped = report.dropped,
                "Flush dropped undeliverable messages"
            );
        }

        report
    }

    /// Remove everything without delivery (used at teardown).
    pub fn clear(&mut self) {
        self.dropped_total += self.items.len() as u64;
        self.items.clear();
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Cumulative count of messages lost to eviction, expiry, or failed
    /// sends since the queue was created.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Mean time successfully drained messages spent in the queue.
    pub fn average_residency_ms(&self) -> f64 {
        if self.drained_total > 0 {
            self.residency_total.as_millis() as f64 / self.drained_total as f64
        } else {
            0.0
        }
    }

    fn record_residency(&mut self, item: &QueuedMessage) {
        self.drained_total += 1;
        self.residency_total += self
            .clock
            .now()
            .saturating_duration_since(item.enqueued_at);
    }

    /// Drop entries older than the expiration window off the front.
    ///
    /// Entries are in arrival order, so expiry only ever removes a prefix.
    fn expire_stale(&mut self) {
        let now = self.clock.now();
        while let Some(front) = self.items.front() {
            if now.saturating_duration_since(front.enqueued_at) > self.expiration {
                self.items.pop_front();
                self.dropped_total += 1;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn queue_with_clock(max: usize, expiry_ms: u64) -> (AudioMessageQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let queue = AudioMessageQueue::new(
            max,
            Duration::from_millis(expiry_ms),
            clock.clone() as Arc<dyn Clock>,
        );
        (queue, clock)
    }

    /// Overflowing the queue retains exactly the `max_size` most recent
    /// items and counts the overflow as dropped.
    #[test]
    fn test_capacity_evicts_oldest() {
        let (mut queue, _clock) = queue_with_clock(3, 5_000);

        for i in 0..5 {
            queue.enqueue(format!("msg-{}", i), MessagePriority::Normal);
        }

        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.dropped_total(), 2);
        assert_eq!(queue.dequeue().unwrap().payload, "msg-2");
        assert_eq!(queue.dequeue().unwrap().payload, "msg-3");
        assert_eq!(queue.dequeue().unwrap().payload, "msg-4");
    }

    /// An item enqueued at T is gone (and counted dropped) when queried at
    /// T + expiration + 1ms.
    #[test]
    fn test_expiry_boundary() {
        let (mut queue, clock) = queue_with_clock(10, 5_000);

        queue.enqueue("stale".to_string(), MessagePriority::Normal);
        clock.advance(Duration::from_millis(5_000));
        // Exactly at the window the item is still live
        queue.enqueue("fresh".to_string(), MessagePriority::Normal);
        assert_eq!(queue.depth(), 2);

        clock.advance(Duration::from_millis(1));
        assert_eq!(queue.dequeue().unwrap().payload, "fresh");
        assert_eq!(queue.dropped_total(), 1);
    }

    #[test]
    fn test_flush_preserves_fifo_order() {
        let (mut queue, _clock) = queue_with_clock(10, 5_000);

        for i in 0..4 {
            queue.enqueue(format!("frame-{}", i), MessagePriority::Normal);
        }

        let mut seen = Vec::new();
        let report = queue.flush(|payload| {
            seen.push(payload.to_string());
            true
        });

        assert_eq!(report.sent, 4);
        assert_eq!(report.dropped, 0);
        assert_eq!(seen, vec!["frame-0", "frame-1", "frame-2", "frame-3"]);
        assert!(queue.is_empty());
    }

    /// Failed sends are dropped, not requeued.
    #[test]
    fn test_flush_drops_failed_sends() {
        let (mut queue, _clock) = queue_with_clock(10, 5_000);

        queue.enqueue("a".to_string(), MessagePriority::Normal);
        queue.enqueue("b".to_string(), MessagePriority::High);
        queue.enqueue("c".to_string(), MessagePriority::Normal);

        let report = queue.flush(|payload| payload != "b");

        assert_eq!(report.sent, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(queue.dropped_total(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_average_residency() {
        let (mut queue, clock) = queue_with_clock(10, 60_000);

        queue.enqueue("a".to_string(), MessagePriority::Normal);
        clock.advance(Duration::from_millis(100));
        queue.enqueue("b".to_string(), MessagePriority::Normal);
        clock.advance(Duration::from_millis(100));

        // a waited 200ms, b waited 100ms
        queue.flush(|_| true);
        assert!((queue.average_residency_ms() - 150.0).abs() < f64::EPSILON);
    }
}
