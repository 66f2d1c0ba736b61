//! Deadline alarm scheduler.
//!
//! One background thread services all alarms of a channel. A scheduled
//! alarm's callback runs exactly once: with `fired = true` when the deadline
//! passes, or with `fired = false` when the alarm is cancelled first.
//! Callbacks run with no scheduler lock held, so they may re-enter the call
//! layer freely.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

type AlarmCallback = Box<dyn FnOnce(bool) + Send>;

struct TimerState {
    /// Pending alarms ordered by deadline. The id breaks ties.
    queue: BTreeMap<(Instant, u64), AlarmCallback>,
    /// Deadline per alarm id, so cancellation can find its queue entry.
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Handle for a scheduled alarm.
pub struct AlarmHandle {
    id: u64,
    shared: Arc<TimerShared>,
}

impl AlarmHandle {
    /// Cancel the alarm. If it has not fired yet, its callback runs now, on
    /// this thread, with `fired = false`. If it already fired this is a
    /// no-op.
    pub fn cancel(self) {
        let callback = {
            let mut state = self.shared.state.lock().unwrap();
            match state.deadlines.remove(&self.id) {
                Some(deadline) => state.queue.remove(&(deadline, self.id)),
                None => None,
            }
        };
        if let Some(callback) = callback {
            callback(false);
        }
    }
}

/// Scheduler owning the timer thread. Dropping it cancels all pending
/// alarms (callbacks run with `fired = false`) and joins the thread.
pub struct AlarmScheduler {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl AlarmScheduler {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BTreeMap::new(),
                deadlines: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("tether-alarm".into())
            .spawn(move || run_timer(thread_shared))
            .expect("spawn alarm thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Schedule `callback` to run when `deadline` passes.
    pub fn schedule(&self, deadline: Instant, callback: AlarmCallback) -> AlarmHandle {
        let id = {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.insert((deadline, id), callback);
            state.deadlines.insert(id, deadline);
            id
        };
        self.shared.cv.notify_all();
        AlarmHandle {
            id,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for AlarmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        let cancelled: Vec<AlarmCallback> = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.deadlines.clear();
            std::mem::take(&mut state.queue).into_values().collect()
        };
        self.shared.cv.notify_all();
        for callback in cancelled {
            callback(false);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.queue.keys().next().copied() {
            Some((deadline, id)) if deadline <= now => {
                let callback = state.queue.remove(&(deadline, id)).unwrap();
                state.deadlines.remove(&id);
                // Fire with no lock held; the callback may schedule or
                // cancel other alarms.
                drop(state);
                callback(true);
                state = shared.state.lock().unwrap();
            }
            Some((deadline, _)) => {
                let (guard, _timeout) = shared
                    .cv
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                state = guard;
            }
            None => {
                state = shared.cv.wait(state).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn alarm_fires() {
        let scheduler = AlarmScheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(
            Instant::now() + Duration::from_millis(10),
            Box::new(move |fired| tx.send(fired).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn cancel_runs_callback_inline() {
        let scheduler = AlarmScheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule(
            Instant::now() + Duration::from_secs(600),
            Box::new(move |fired| tx.send(fired).unwrap()),
        );
        handle.cancel();
        assert_eq!(rx.try_recv(), Ok(false));
    }

    #[test]
    fn alarms_fire_in_deadline_order() {
        let scheduler = AlarmScheduler::new();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        for (label, offset) in [(1u8, 30u64), (0, 10)] {
            let tx = tx.clone();
            scheduler.schedule(
                now + Duration::from_millis(offset),
                Box::new(move |_| tx.send(label).unwrap()),
            );
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
    }

    #[test]
    fn shutdown_cancels_pending() {
        static CANCELLED: AtomicUsize = AtomicUsize::new(0);
        let scheduler = AlarmScheduler::new();
        scheduler.schedule(
            Instant::now() + Duration::from_secs(600),
            Box::new(|fired| {
                assert!(!fired);
                CANCELLED.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(scheduler);
        assert_eq!(CANCELLED.load(Ordering::SeqCst), 1);
    }
}
