//! RPC messages and the peer-link seam
//!
//! The actual wire transport lives outside this crate; everything here is
//! serde-serializable so an external layer can marshal it. Outbound calls go
//! through [`RaftTransport`]; inbound delivery lands on [`RaftHandler`]
//! (implemented by the engine).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::op::Command;
use crate::types::{PeerNetworkConfig, ReplicaId, Term};

/// Log entry in transit: term, position, bare command. Promise handles are
/// process-local and never cross the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntry {
    pub term: Term,
    pub index: usize,
    pub command: Command,
}

/// AppendEntries RPC - heartbeat plus log replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So followers can redirect clients
    pub leader_id: ReplicaId,

    /// Index of the entry immediately preceding `entries`, `None` when the
    /// new entries start at the head of the log
    pub prev_log_index: Option<usize>,

    /// Term of the entry at `prev_log_index`
    pub prev_log_term: Option<Term>,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<WireEntry>,

    /// Leader's commit index
    pub leader_commit: Option<usize>,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// True if the follower matched `prev_log_index`/`prev_log_term`
    pub success: bool,
}

/// RequestVote RPC - sent by candidates to gather votes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub candidate_id: ReplicaId,
    pub term: Term,
    pub last_log_index: Option<usize>,
    pub last_log_term: Option<Term>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AddServer RPC - leader-only membership add
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddServerRequest {
    pub server_id: ReplicaId,
    pub ip: String,
    pub raft_port: u16,
    pub db_port: u16,
    pub name: String,
}

/// RemoveServer RPC - leader-only membership remove
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemoveServerRequest {
    pub server_id: ReplicaId,
}

/// Outcome taxonomy for membership RPCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipCode {
    Ok,
    NotLeader,
    /// An earlier membership change has not committed within the poll budget
    PrevNotCommittedTimeout,
    /// This change was submitted but has not committed within the poll budget
    CurNotCommittedTimeout,
    ServerExists,
    ServerNotFound,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipResponse {
    pub code: MembershipCode,
    /// Raft address of the last known leader, for client-side redirection;
    /// empty on success
    pub leader_addr: String,
}

impl MembershipResponse {
    pub fn ok() -> Self {
        Self {
            code: MembershipCode::Ok,
            leader_addr: String::new(),
        }
    }

    pub fn redirect(code: MembershipCode, leader_addr: String) -> Self {
        Self { code, leader_addr }
    }
}

/// Outbound peer calls.
///
/// `None` means the call produced no reply (link down, peer unreachable) - a
/// transient failure that the next periodic round retries. Implementations
/// must not block forever.
pub trait RaftTransport: Send + Sync + 'static {
    fn append_entries(&self, req: AppendEntriesRequest) -> Option<AppendEntriesResponse>;
    fn request_vote(&self, req: RequestVoteRequest) -> Option<RequestVoteResponse>;
}

/// Inbound RPC delivery, implemented by the engine. Object-safe so loopback
/// and server layers can hold engines of different transports uniformly.
pub trait RaftHandler: Send + Sync {
    fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;
    fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse;
}

/// Per-peer outbound link with fault-injection switches.
///
/// NetworkUpdate toggles these to simulate partitions (disabled link behaves
/// like a peer that never replies) and latency. Protocol correctness does not
/// depend on them.
pub struct PeerLink<T> {
    inner: T,
    enabled: AtomicBool,
    delayed: AtomicBool,
    delay_ms: AtomicU32,
}

impl<T: RaftTransport> PeerLink<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            enabled: AtomicBool::new(true),
            delayed: AtomicBool::new(false),
            delay_ms: AtomicU32::new(0),
        }
    }

    pub fn apply(&self, directive: &PeerNetworkConfig) {
        self.enabled.store(directive.enabled, Ordering::Relaxed);
        self.delayed.store(directive.delayed, Ordering::Relaxed);
        self.delay_ms.store(directive.delay_ms, Ordering::Relaxed);
    }

    fn gate(&self) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        if self.delayed.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(u64::from(
                self.delay_ms.load(Ordering::Relaxed),
            )));
        }
        true
    }

    pub fn append_entries(&self, req: AppendEntriesRequest) -> Option<AppendEntriesResponse> {
        self.gate().then(|| self.inner.append_entries(req)).flatten()
    }

    pub fn request_vote(&self, req: RequestVoteRequest) -> Option<RequestVoteResponse> {
        self.gate().then(|| self.inner.request_vote(req)).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysGrant;

    impl RaftTransport for AlwaysGrant {
        fn append_entries(&self, req: AppendEntriesRequest) -> Option<AppendEntriesResponse> {
            Some(AppendEntriesResponse {
                term: req.term,
                success: true,
            })
        }

        fn request_vote(&self, req: RequestVoteRequest) -> Option<RequestVoteResponse> {
            Some(RequestVoteResponse {
                term: req.term,
                vote_granted: true,
            })
        }
    }

    fn heartbeat() -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term(1),
            leader_id: ReplicaId(0),
            prev_log_index: None,
            prev_log_term: None,
            entries: vec![],
            leader_commit: None,
        }
    }

    #[test]
    fn test_heartbeat_has_no_entries() {
        assert!(heartbeat().is_heartbeat());
    }

    #[test]
    fn test_disabled_link_drops_calls() {
        let link = PeerLink::new(AlwaysGrant);
        assert!(link.append_entries(heartbeat()).is_some());

        link.apply(&PeerNetworkConfig {
            peer_id: ReplicaId(1),
            enabled: false,
            delayed: false,
            delay_ms: 0,
        });
        assert!(link.append_entries(heartbeat()).is_none());
        assert!(link
            .request_vote(RequestVoteRequest {
                candidate_id: ReplicaId(0),
                term: Term(1),
                last_log_index: None,
                last_log_term: None,
            })
            .is_none());

        // re-enabling restores the link
        link.apply(&PeerNetworkConfig {
            peer_id: ReplicaId(1),
            enabled: true,
            delayed: false,
            delay_ms: 0,
        });
        assert!(link.append_entries(heartbeat()).is_some());
    }

    #[test]
    fn test_delayed_link_still_delivers() {
        let link = PeerLink::new(AlwaysGrant);
        link.apply(&PeerNetworkConfig {
            peer_id: ReplicaId(1),
            enabled: true,
            delayed: true,
            delay_ms: 10,
        });
        let started = std::time::Instant::now();
        assert!(link.append_entries(heartbeat()).is_some());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
