//! Cross-thread rendezvous primitives
//!
//! [`WakeSignal`] lets a producer notify a consumer of new work without ever
//! blocking, and without losing a notification that arrives before the
//! consumer starts waiting. [`TaskGroup`] tracks the short-lived RPC fan-out
//! threads so shutdown can join them instead of leaking detached threads.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Idle,
    /// A signal arrived while nobody was waiting; the next wait consumes it.
    Notified,
    /// A consumer is parked on the condvar.
    Waiting,
}

/// Coalescing one-shot wake signal.
///
/// Multiple signals before a wait collapse into a single wake. That is
/// sufficient here because the consumer drains its entire work queue on every
/// wake rather than processing one item per signal.
pub struct WakeSignal {
    state: Mutex<SignalState>,
    wake: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::Idle),
            wake: Condvar::new(),
        }
    }

    /// Notify the consumer. Never blocks.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        match *state {
            SignalState::Notified => {}
            SignalState::Waiting => {
                *state = SignalState::Idle;
                self.wake.notify_all();
            }
            SignalState::Idle => *state = SignalState::Notified,
        }
    }

    /// Consume a pending notification, or block until one arrives.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        match *state {
            SignalState::Notified => *state = SignalState::Idle,
            SignalState::Waiting => {
                // Single-consumer primitive; a second waiter indicates a bug
                // in the calling code. Bail out rather than corrupt state.
                tracing::error!("WakeSignal::wait called while another wait is in progress");
            }
            SignalState::Idle => {
                *state = SignalState::Waiting;
                while *state == SignalState::Waiting {
                    self.wake.wait(&mut state);
                }
            }
        }
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks threads spawned for per-peer RPC rounds.
///
/// `spawn` never blocks the caller: it starts the thread, stashes the join
/// handle, and opportunistically reaps handles whose threads have already
/// finished. `join_all` drains the rest for orderly shutdown.
pub struct TaskGroup {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn<F>(&self, name: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("failed to spawn fan-out thread");

        let mut handles = self.handles.lock();
        // Joining a finished thread is immediate, so this keeps the vec
        // bounded by the number of in-flight rounds.
        let mut live = Vec::with_capacity(handles.len() + 1);
        for h in handles.drain(..) {
            if h.is_finished() {
                let _ = h.join();
            } else {
                live.push(h);
            }
        }
        live.push(handle);
        *handles = live;
    }

    /// Join every tracked thread. Called once the engine's loops have
    /// stopped issuing new rounds.
    pub fn join_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in drained {
            let _ = handle.join();
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_signal_before_wait_is_not_lost() {
        let signal = WakeSignal::new();
        signal.signal();
        // must return immediately instead of blocking
        signal.wait();
    }

    #[test]
    fn test_signals_coalesce() {
        let signal = Arc::new(WakeSignal::new());
        signal.signal();
        signal.signal();
        signal.signal();
        signal.wait();

        // a second wait must block until a fresh signal arrives
        let sig = signal.clone();
        let waiter = thread::spawn(move || sig.wait());
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        signal.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn test_signal_wakes_parked_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let sig = signal.clone();
        let waiter = thread::spawn(move || {
            sig.wait();
        });
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn test_task_group_joins_all() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..16 {
            let counter = counter.clone();
            group.spawn(&format!("task-{i}"), move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        group.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
