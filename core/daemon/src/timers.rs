//! Cancellable one-shot and repeating timers.
//!
//! Each timer is a thread parked on a cancel channel. Timers never touch
//! session state themselves; callbacks post events back to the coordinator.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type TimerId = u64;

struct TimerHandle {
    cancel: Sender<()>,
    join: JoinHandle<()>,
}

#[derive(Default)]
pub struct TimerRegistry {
    next_id: TimerId,
    timers: HashMap<TimerId, TimerHandle>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_once<F>(&mut self, delay: Duration, fire: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let join = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                fire();
            }
        });
        self.track(cancel, join)
    }

    pub fn schedule_repeating<F>(&mut self, interval: Duration, mut fire: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let join = thread::spawn(move || loop {
            match cancelled.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => fire(),
                _ => break,
            }
        });
        self.track(cancel, join)
    }

    /// Cancels a timer. Returns false when it already fired or is unknown.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(handle) => {
                let finished = handle.join.is_finished();
                stop(handle);
                !finished
            }
            None => false,
        }
    }

    /// Cancels every outstanding timer and waits for their threads.
    pub fn cancel_all(&mut self) -> usize {
        let handles: Vec<_> = self.timers.drain().map(|(_, handle)| handle).collect();
        let count = handles.len();
        for handle in handles {
            stop(handle);
        }
        count
    }

    pub fn pending(&mut self) -> usize {
        self.prune();
        self.timers.len()
    }

    fn track(&mut self, cancel: Sender<()>, join: JoinHandle<()>) -> TimerId {
        self.prune();
        self.next_id += 1;
        self.timers.insert(self.next_id, TimerHandle { cancel, join });
        self.next_id
    }

    fn prune(&mut self) {
        self.timers.retain(|_, handle| !handle.join.is_finished());
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn stop(handle: TimerHandle) {
    let _ = handle.cancel.send(());
    drop(handle.cancel);
    let _ = handle.join.join();
}
