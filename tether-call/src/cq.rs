//! Completion queue: the sink where accepted batches report completion.
//!
//! Tags are opaque `u64`s chosen by the application, in the same spirit as
//! user_data tags on ring completions. For every accepted batch the call
//! performs one `begin_op` before submission and exactly one `end_op` when
//! the batch's group of sub-operations finishes.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A completed-batch event. Every event signals op completion for its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tag: u64,
}

struct CqInner {
    /// Batches accepted but not yet completed.
    pending: usize,
    events: VecDeque<Event>,
}

/// A multi-producer completion queue drained by the application.
pub struct CompletionQueue {
    inner: Mutex<CqInner>,
    cv: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CqInner {
                pending: 0,
                events: VecDeque::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Record that a batch was accepted and will eventually complete.
    pub(crate) fn begin_op(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending += 1;
    }

    /// Post the completion event for an accepted batch.
    pub(crate) fn end_op(&self, tag: u64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.pending > 0, "end_op without matching begin_op");
        inner.pending = inner.pending.saturating_sub(1);
        inner.events.push_back(Event { tag });
        drop(inner);
        self.cv.notify_all();
    }

    /// Number of accepted batches that have not yet completed.
    pub fn pending_ops(&self) -> usize {
        self.inner.lock().unwrap().pending
    }

    /// Pop the next event, blocking up to `timeout`. Returns `None` on
    /// timeout.
    pub fn next(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timeout) = self.cv.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Pop the next event without blocking.
    pub fn try_next(&self) -> Option<Event> {
        self.inner.lock().unwrap().events.pop_front()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn begin_end_pairing() {
        let cq = CompletionQueue::new();
        cq.begin_op();
        assert_eq!(cq.pending_ops(), 1);
        assert!(cq.try_next().is_none());

        cq.end_op(7);
        assert_eq!(cq.pending_ops(), 0);
        assert_eq!(cq.try_next(), Some(Event { tag: 7 }));
    }

    #[test]
    fn events_are_fifo() {
        let cq = CompletionQueue::new();
        for tag in 0..4 {
            cq.begin_op();
            cq.end_op(tag);
        }
        for tag in 0..4 {
            assert_eq!(cq.next(Duration::from_secs(1)), Some(Event { tag }));
        }
    }

    #[test]
    fn next_times_out() {
        let cq = CompletionQueue::new();
        let start = Instant::now();
        assert!(cq.next(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn next_wakes_cross_thread() {
        let cq = Arc::new(CompletionQueue::new());
        cq.begin_op();

        let producer = Arc::clone(&cq);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.end_op(42);
        });

        assert_eq!(cq.next(Duration::from_secs(5)), Some(Event { tag: 42 }));
        handle.join().unwrap();
    }
}
