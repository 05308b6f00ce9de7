//! Core types used throughout the consensus implementation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a replica in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ReplicaId(pub i32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replica({})", self.0)
    }
}

/// Election term number
///
/// Terms are used to detect stale leaders and ensure safety.
/// Each time a replica starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Term(pub i32);

impl Term {
    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Cluster membership descriptor: where a replica lives and how to reach
/// both its raft endpoint and its database endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: ReplicaId,
    pub ip: String,
    pub raft_port: u16,
    pub db_port: u16,
    pub name: String,
}

impl ServerInfo {
    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.ip, self.raft_port)
    }

    pub fn db_addr(&self) -> String {
        format!("{}:{}", self.ip, self.db_port)
    }
}

/// Fault-injection directive for a single outbound peer link.
///
/// Applied via the NetworkUpdate RPC to simulate partitions and latency in
/// tests; never persisted and irrelevant to protocol correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNetworkConfig {
    pub peer_id: ReplicaId,
    pub enabled: bool,
    pub delayed: bool,
    pub delay_ms: u32,
}

impl PeerNetworkConfig {
    pub fn enabled(peer_id: ReplicaId) -> Self {
        Self {
            peer_id,
            enabled: true,
            delayed: false,
            delay_ms: 0,
        }
    }

    pub fn disabled(peer_id: ReplicaId) -> Self {
        Self {
            peer_id,
            enabled: false,
            delayed: false,
            delay_ms: 0,
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,

    /// The operation to apply to the state machine
    pub op: crate::op::Operation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_next() {
        assert_eq!(Term(5).next(), Term(6));
    }

    #[test]
    fn test_term_ordering() {
        assert!(Term(1) < Term(2));
        assert!(Term(100) > Term(50));
        // Option<Term> ordering treats None as older than any real term,
        // which is what the vote up-to-date check relies on.
        assert!(None < Some(Term(0)));
    }

    #[test]
    fn test_server_addrs() {
        let info = ServerInfo {
            id: ReplicaId(3),
            ip: "10.0.0.7".into(),
            raft_port: 5000,
            db_port: 5001,
            name: "node3".into(),
        };
        assert_eq!(info.raft_addr(), "10.0.0.7:5000");
        assert_eq!(info.db_addr(), "10.0.0.7:5001");
    }
}
