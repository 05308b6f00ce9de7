//! Raft consensus engine for replicated key/value state
//!
//! This library implements leader election, log replication, durable
//! term/vote/log state and one-at-a-time membership changes over a
//! pluggable transport. It is built on native threads: each replica runs
//! an election monitor, a replication driver and a commit executor, with
//! per-RPC fan-out threads for the actual network calls.
//!
//! # Example
//!
//! ```no_run
//! use quorumkv_consensus::{
//!     Command, Operation, RaftConfig, RaftEngine, ReplicaId, ServerInfo, StateMachine,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! struct Nop;
//! impl StateMachine for Nop {
//!     fn get(&self, _key: i32) -> Option<i32> { None }
//!     fn put(&self, _key: i32, _value: i32) -> bool { true }
//! }
//!
//! # fn example() -> quorumkv_consensus::Result<()> {
//! # fn connect(_info: &ServerInfo) -> quorumkv_consensus::testkit::LoopbackTransport { unimplemented!() }
//! let id = ReplicaId(1);
//! let cluster: HashMap<ReplicaId, ServerInfo> = HashMap::new();
//! let engine = RaftEngine::new(
//!     id,
//!     RaftConfig::default(),
//!     cluster,
//!     "/tmp/replica-1",
//!     false,
//!     Arc::new(Nop),
//!     connect,
//! )?;
//! engine.start();
//!
//! // Submissions succeed once this replica wins an election.
//! let (accepted, _leader) = engine.submit(Operation::new(Command::Put { key: 1, value: 2 }));
//! # let _ = accepted;
//! engine.stop();
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod log;
mod op;
mod promise;
mod rpc;
mod state;
mod store;
mod sync;
pub mod testkit;
mod types;

pub use config::{RaftConfig, RaftConfigBuilder};
pub use engine::RaftEngine;
pub use op::{Command, OpResult, Operation, StateMachine};
pub use promise::{promise_pair, Promise, PromiseHandle, PromiseStore, Ticket};
pub use rpc::{
    AddServerRequest, AppendEntriesRequest, AppendEntriesResponse, MembershipCode,
    MembershipResponse, PeerLink, RaftHandler, RaftTransport, RemoveServerRequest,
    RequestVoteRequest, RequestVoteResponse, WireEntry,
};
pub use state::RaftRole;
pub use types::{LogEntry, PeerNetworkConfig, ReplicaId, ServerInfo, Term};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur inside the engine
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("corrupt record in durable log at offset {0}")]
    CorruptRecord(u64),
}
