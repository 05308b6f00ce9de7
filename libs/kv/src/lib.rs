//! Replicated key/value store over the consensus engine
//!
//! Each process hosts one [`Replica`]: an in-memory integer map kept
//! consistent across the cluster by replicating every GET and PUT through
//! the log. Reads go through the log too, so a successful GET reflects all
//! writes committed before it.

mod replica;
mod store;

pub use replica::Replica;
pub use store::MemoryStore;

/// Client-visible failures of a key/value call
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// This replica is not the leader; retry against the given address.
    #[error("not the leader, try {0}")]
    NotLeader(String),

    #[error("key not found")]
    KeyNotFound,

    /// The command was dropped before it could commit, usually because
    /// leadership changed while it was in flight.
    #[error("command rejected")]
    Rejected,
}
