//! Operation (command) representation
//!
//! An [`Operation`] pairs a replicated command with an optional handle to a
//! blocked caller's promise. The handle is process-local: only the bare
//! command ever crosses the wire or reaches disk.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::promise::{PromiseHandle, PromiseStore};
use crate::types::{ReplicaId, ServerInfo};

/// Trait for keyed state machines driven by the committed log prefix
///
/// Implement this to plug a real store under the consensus engine. Commands
/// are applied strictly in log order by the executor loop.
pub trait StateMachine: Send + Sync + 'static {
    fn get(&self, key: i32) -> Option<i32>;

    /// Returns whether the write was accepted.
    fn put(&self, key: i32, value: i32) -> bool;
}

/// The replicable command variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get { key: i32 },
    Put { key: i32, value: i32 },
    AddServer(ServerInfo),
    RemoveServer(ReplicaId),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get { key } => write!(f, "GET({key})"),
            Command::Put { key, value } => write!(f, "PUT({key}, {value})"),
            Command::AddServer(info) => write!(f, "ADD_SERVER({})", info.id),
            Command::RemoveServer(id) => write!(f, "REMOVE_SERVER({id})"),
        }
    }
}

/// Outcome of applying (or discarding) a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Get(Option<i32>),
    Put(bool),
    Config(bool),
}

/// A command plus the optional promise of the caller waiting on it.
///
/// Consumed exactly once: either [`execute`](Operation::execute)d after the
/// entry commits, or [`abort`](Operation::abort)ed when log truncation
/// discards it before commit.
#[derive(Debug, Clone)]
pub struct Operation {
    pub command: Command,
    pub promise: Option<PromiseHandle>,
}

impl Operation {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            promise: None,
        }
    }

    pub fn with_promise(command: Command, handle: PromiseHandle) -> Self {
        Self {
            command,
            promise: Some(handle),
        }
    }

    /// Apply the command to the state machine and resolve the caller's
    /// promise with the result, if one is attached.
    ///
    /// Membership commands are a no-op here: their effect on the cluster is
    /// applied when the entry is appended to the log.
    pub fn execute(mut self, machine: &dyn StateMachine, promises: &PromiseStore<OpResult>) {
        tracing::debug!(command = %self.command, "executing committed operation");
        let result = match &self.command {
            Command::Get { key } => OpResult::Get(machine.get(*key)),
            Command::Put { key, value } => OpResult::Put(machine.put(*key, *value)),
            Command::AddServer(_) | Command::RemoveServer(_) => OpResult::Config(true),
        };
        if let Some(handle) = self.promise.take() {
            promises.take(handle).fulfil(result);
        }
    }

    /// Resolve the caller's promise with the kind-specific failure value.
    ///
    /// Called when the entry holding this operation is truncated away before
    /// it could commit; without this the caller would block forever.
    pub fn abort(mut self, promises: &PromiseStore<OpResult>) {
        let Some(handle) = self.promise.take() else {
            return;
        };
        tracing::debug!(command = %self.command, "aborting uncommitted operation");
        let failure = match &self.command {
            Command::Get { .. } => OpResult::Get(None),
            Command::Put { .. } => OpResult::Put(false),
            Command::AddServer(_) | Command::RemoveServer(_) => OpResult::Config(false),
        };
        promises.take(handle).fulfil(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::promise_pair;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    struct MapMachine(RwLock<HashMap<i32, i32>>);

    impl StateMachine for MapMachine {
        fn get(&self, key: i32) -> Option<i32> {
            self.0.read().get(&key).copied()
        }

        fn put(&self, key: i32, value: i32) -> bool {
            self.0.write().insert(key, value);
            true
        }
    }

    #[test]
    fn test_execute_resolves_promise() {
        let machine = MapMachine(RwLock::new(HashMap::new()));
        let promises = PromiseStore::new();

        let (promise, ticket) = promise_pair();
        let handle = promises.insert(promise);
        Operation::with_promise(Command::Put { key: 1, value: 9 }, handle)
            .execute(&machine, &promises);
        assert_eq!(ticket.wait(), OpResult::Put(true));

        let (promise, ticket) = promise_pair();
        let handle = promises.insert(promise);
        Operation::with_promise(Command::Get { key: 1 }, handle).execute(&machine, &promises);
        assert_eq!(ticket.wait(), OpResult::Get(Some(9)));
    }

    #[test]
    fn test_abort_resolves_failure() {
        let machine = MapMachine(RwLock::new(HashMap::new()));
        let promises = PromiseStore::new();

        let (promise, ticket) = promise_pair();
        let handle = promises.insert(promise);
        Operation::with_promise(Command::Put { key: 4, value: 2 }, handle).abort(&promises);
        assert_eq!(ticket.wait(), OpResult::Put(false));

        // nothing was applied
        assert_eq!(machine.get(4), None);
        assert_eq!(promises.len(), 0);
    }
}
