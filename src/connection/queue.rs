//! Bounded, lossy outbound queue
//!
//! Holds messages while the socket is not open. Pushing onto a full queue
//! evicts the oldest 10% (at least one entry) instead of failing.

use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub text: String,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of entries evicted when pushing onto a full queue
    pub fn eviction_batch(&self) -> usize {
        self.max_size.div_ceil(10).max(1)
    }

    /// Append `text`; returns how many old entries were evicted to make room.
    pub fn push(&mut self, text: String) -> usize {
        let mut evicted = 0;
        if self.entries.len() >= self.max_size {
            evicted = self.eviction_batch().min(self.entries.len());
            self.entries.drain(..evicted);
        }
        self.entries.push_back(QueuedMessage {
            text,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Put a message back at the head after a failed send.
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        self.entries.push_front(message);
        if self.entries.len() > self.max_size {
            self.entries.pop_back();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Snapshot of queued texts, oldest first
    pub fn texts(&self) -> Vec<String> {
        self.entries.iter().map(|m| m.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_settles_at_max() {
        let mut queue = OutboundQueue::new(100);
        let mut evicted = 0;
        for i in 0..150 {
            evicted += queue.push(format!("m{}", i));
            assert!(queue.len() <= 100);
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(evicted, 50);
        // newest survives, oldest gone
        let texts = queue.texts();
        assert_eq!(texts.last().map(String::as_str), Some("m149"));
        assert_eq!(texts.first().map(String::as_str), Some("m50"));
    }

    #[test]
    fn test_small_queue_evicts_one() {
        let mut queue = OutboundQueue::new(3);
        assert_eq!(queue.eviction_batch(), 1);
        for i in 0..5 {
            queue.push(i.to_string());
        }
        assert_eq!(queue.texts(), vec!["2", "3", "4"]);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut queue = OutboundQueue::new(10);
        queue.push("a".into());
        queue.push("b".into());
        let head = queue.pop_front().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.texts(), vec!["a", "b"]);
    }
}
