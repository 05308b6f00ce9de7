//! Promise/future rendezvous between client threads and engine workers
//!
//! A client thread that submits an operation must block until whichever
//! worker thread eventually commits (or discards) it produces a result. The
//! [`PromiseStore`] decouples the two sides through an opaque handle, so the
//! bare command can travel through queues, the log and AppendEntries payloads
//! while the promise stays in-process.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque token linking a blocked caller to the eventual result of its
/// submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseHandle(u64);

struct Slot<T> {
    value: Mutex<Option<T>>,
    filled: Condvar,
}

/// Write side of a one-shot rendezvous
pub struct Promise<T> {
    slot: Arc<Slot<T>>,
}

/// Read side of a one-shot rendezvous
pub struct Ticket<T> {
    slot: Arc<Slot<T>>,
}

/// Create a connected promise/ticket pair.
pub fn promise_pair<T>() -> (Promise<T>, Ticket<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        filled: Condvar::new(),
    });
    (
        Promise { slot: slot.clone() },
        Ticket { slot },
    )
}

impl<T> Promise<T> {
    /// Deliver the result and wake the waiting ticket.
    pub fn fulfil(self, value: T) {
        let mut guard = self.slot.value.lock();
        *guard = Some(value);
        self.slot.filled.notify_all();
    }
}

impl<T> Ticket<T> {
    /// Block until the paired promise is fulfilled.
    pub fn wait(self) -> T {
        let mut guard = self.slot.value.lock();
        while guard.is_none() {
            self.slot.filled.wait(&mut guard);
        }
        guard.take().unwrap()
    }
}

/// Handle-indexed store of in-flight promises.
///
/// Accessed concurrently by client threads, the replication loop and the
/// executor loop; internally sharded, independent of the replica-state lock.
pub struct PromiseStore<T> {
    slots: DashMap<PromiseHandle, Promise<T>>,
    next: AtomicU64,
}

impl<T> PromiseStore<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next: AtomicU64::new(0),
        }
    }

    /// Register a promise, returning the handle that travels with the
    /// operation.
    pub fn insert(&self, promise: Promise<T>) -> PromiseHandle {
        let handle = PromiseHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.slots.insert(handle, promise);
        handle
    }

    /// Remove and return the promise behind `handle`.
    ///
    /// Each handle is consumed exactly once (the operation is either executed
    /// or aborted, never both); taking it twice is a logic error.
    pub fn take(&self, handle: PromiseHandle) -> Promise<T> {
        self.slots
            .remove(&handle)
            .map(|(_, promise)| promise)
            .expect("promise handle consumed twice")
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T> Default for PromiseStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fulfil_before_wait() {
        let (promise, ticket) = promise_pair();
        promise.fulfil(42);
        assert_eq!(ticket.wait(), 42);
    }

    #[test]
    fn test_fulfil_from_other_thread() {
        let (promise, ticket) = promise_pair();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.fulfil("done");
        });
        assert_eq!(ticket.wait(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn test_store_insert_take() {
        let store = PromiseStore::new();
        let (promise, ticket) = promise_pair();
        let handle = store.insert(promise);
        assert_eq!(store.len(), 1);

        store.take(handle).fulfil(7);
        assert_eq!(ticket.wait(), 7);
        assert!(store.is_empty());
    }

    #[test]
    #[should_panic(expected = "promise handle consumed twice")]
    fn test_double_take_panics() {
        let store = PromiseStore::new();
        let (promise, _ticket) = promise_pair();
        let handle = store.insert(promise);
        store.take(handle).fulfil(1);
        let _ = store.take(handle);
    }

    #[test]
    fn test_handles_are_distinct_across_threads() {
        let store = Arc::new(PromiseStore::<i32>::new());
        let mut workers = vec![];
        for _ in 0..8 {
            let store = store.clone();
            workers.push(thread::spawn(move || {
                let mut handles = vec![];
                for _ in 0..100 {
                    let (promise, _ticket) = promise_pair();
                    handles.push(store.insert(promise));
                }
                handles
            }));
        }
        let mut all: Vec<_> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_by_key(|h| h.0);
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
