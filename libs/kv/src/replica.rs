//! One replicated key/value server
//!
//! A [`Replica`] owns a [`MemoryStore`] and the consensus engine that drives
//! it. `get` and `put` block the calling thread until the command has been
//! committed and applied, or fail fast with a leader redirect.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use quorumkv_consensus::{
    promise_pair, Command, OpResult, Operation, RaftConfig, RaftEngine, RaftTransport, ReplicaId,
    ServerInfo,
};

use crate::store::MemoryStore;
use crate::DbError;

pub struct Replica<T: RaftTransport> {
    engine: RaftEngine<T>,
    store: Arc<MemoryStore>,
}

impl<T: RaftTransport> Replica<T> {
    pub fn new(
        id: ReplicaId,
        config: RaftConfig,
        cluster: HashMap<ReplicaId, ServerInfo>,
        store_dir: impl AsRef<Path>,
        bootstrap: bool,
        connect: impl Fn(&ServerInfo) -> T + Send + Sync + 'static,
    ) -> quorumkv_consensus::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let engine = RaftEngine::new(
            id,
            config,
            cluster,
            store_dir,
            bootstrap,
            Arc::clone(&store) as Arc<dyn quorumkv_consensus::StateMachine>,
            connect,
        )?;
        Ok(Self { engine, store })
    }

    pub fn start(&self) {
        self.engine.start();
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    /// The underlying engine, for membership and fault-injection calls.
    pub fn engine(&self) -> &RaftEngine<T> {
        &self.engine
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Read `key` through the replicated log. Blocks until the read commits.
    pub fn get(&self, key: i32) -> Result<i32, DbError> {
        match self.roundtrip(Command::Get { key })? {
            OpResult::Get(Some(value)) => Ok(value),
            OpResult::Get(None) => Err(DbError::KeyNotFound),
            other => unreachable!("GET resolved with {other:?}"),
        }
    }

    /// Write `key = value`. Blocks until the write commits and applies.
    pub fn put(&self, key: i32, value: i32) -> Result<(), DbError> {
        match self.roundtrip(Command::Put { key, value })? {
            OpResult::Put(true) => Ok(()),
            OpResult::Put(false) => Err(DbError::Rejected),
            other => unreachable!("PUT resolved with {other:?}"),
        }
    }

    fn roundtrip(&self, command: Command) -> Result<OpResult, DbError> {
        let promises = self.engine.promises();
        let (promise, ticket) = promise_pair();
        let handle = promises.insert(promise);

        let (accepted, _leader) = self
            .engine
            .submit(Operation::with_promise(command, handle));
        if !accepted {
            // Reclaim the parked promise; nothing will ever resolve it.
            drop(promises.take(handle));
            debug!(id = %self.engine.id(), "redirecting to leader");
            return Err(DbError::NotLeader(self.engine.leader_db_addr()));
        }

        Ok(ticket.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumkv_consensus::testkit::{LoopbackTransport, Router};

    fn solo_cluster() -> HashMap<ReplicaId, ServerInfo> {
        let mut cluster = HashMap::new();
        cluster.insert(
            ReplicaId(1),
            ServerInfo {
                id: ReplicaId(1),
                ip: "127.0.0.1".into(),
                raft_port: 7101,
                db_port: 8101,
                name: "solo".into(),
            },
        );
        cluster
    }

    #[test]
    fn test_follower_get_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new();
        let replica = Replica::new(
            ReplicaId(1),
            RaftConfig::default(),
            solo_cluster(),
            dir.path(),
            false,
            move |info: &ServerInfo| LoopbackTransport::new(Arc::clone(&router), info.id),
        )
        .unwrap();

        // Never started, so still a follower.
        match replica.get(1) {
            Err(DbError::NotLeader(_)) => {}
            other => panic!("expected redirect, got {other:?}"),
        }
        assert!(replica.engine.promises().is_empty());
    }
}
