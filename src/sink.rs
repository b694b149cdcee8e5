//! Best-effort record sink.
//!
//! Fire-and-forget recording (failure reports to the expertise service,
//! watchdog telemetry) must never block or crash the path that records.
//! The sink is a bounded in-memory queue with drop-oldest on overflow; a
//! consumer drains it when it gets around to it, and anything undrained at
//! shutdown is simply lost.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct BestEffortSink<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: Mutex<u64>,
}

impl<T> BestEffortSink<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: Mutex::new(0),
        }
    }

    /// Offer an item. Never fails; on overflow the oldest queued item is
    /// dropped to make room.
    pub fn offer(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
            *self.dropped.lock().unwrap() += 1;
        }
        queue.push_back(item);
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items lost to overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        *self.dropped.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_and_drain_preserve_order() {
        let sink = BestEffortSink::new(10);
        sink.offer(1);
        sink.offer(2);
        sink.offer(3);
        assert_eq!(sink.drain(), vec![1, 2, 3]);
        assert!(sink.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let sink = BestEffortSink::new(3);
        for i in 0..5 {
            sink.offer(i);
        }
        assert_eq!(sink.drain(), vec![2, 3, 4]);
        assert_eq!(sink.dropped_count(), 2);
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let sink = BestEffortSink::new(0);
        sink.offer("a");
        sink.offer("b");
        assert_eq!(sink.drain(), vec!["b"]);
    }

    #[test]
    fn drain_on_empty_is_empty() {
        let sink: BestEffortSink<u8> = BestEffortSink::new(4);
        assert!(sink.drain().is_empty());
        assert_eq!(sink.dropped_count(), 0);
    }
}
