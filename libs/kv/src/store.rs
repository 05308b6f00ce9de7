//! The in-memory key/value state machine

use parking_lot::RwLock;
use std::collections::HashMap;

use quorumkv_consensus::StateMachine;

/// Keyed integer store applied by the consensus executor.
///
/// All mutation goes through the committed log, so one writer at a time;
/// the lock exists for the read side, which client threads hit directly.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<i32, i32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl StateMachine for MemoryStore {
    fn get(&self, key: i32) -> Option<i32> {
        self.map.read().get(&key).copied()
    }

    fn put(&self, key: i32, value: i32) -> bool {
        self.map.write().insert(key, value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() {
        let store = MemoryStore::new();
        assert!(store.put(3, 30));
        assert_eq!(store.get(3), Some(30));
        assert_eq!(store.get(4), None);
    }

    #[test]
    fn test_put_overwrites() {
        let store = MemoryStore::new();
        store.put(1, 10);
        store.put(1, 11);
        assert_eq!(store.get(1), Some(11));
        assert_eq!(store.len(), 1);
    }
}
