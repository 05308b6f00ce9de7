//! Replica state and role management

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::log::DurableLog;
use crate::store::ScalarStore;
use crate::types::{ReplicaId, ServerInfo, Term};
use crate::Result;

const KEY_CURRENT_TERM: &str = "CurrentTerm";
const KEY_VOTED_FOR: &str = "VotedFor";
const NO_VOTE: i32 = -1;

/// The role a replica can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    /// Accepts log entries from the leader, starts an election on timeout
    Follower,
    /// Attempting to become leader
    Candidate,
    /// Accepts client requests and replicates the log
    Leader,
    /// Terminal: removed from the cluster or shut down; all loops exit
    Dead,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
            RaftRole::Dead => write!(f, "Dead"),
        }
    }
}

/// Everything the consensus algorithm needs, one instance per process.
///
/// The engine guards the whole struct behind a single exclusive lock; every
/// read or mutation of term/role/log/commit-index/peer-index/cluster-config
/// happens under it. Coarse, but simple to reason about.
pub struct ReplicaState {
    // durable
    pub current_term: Term,
    pub voted_for: Option<ReplicaId>,
    pub log: DurableLog,

    // volatile
    pub role: RaftRole,
    /// Timestamp of the last valid leader contact or vote cast
    pub election_reset_at: Instant,
    /// Highest log index known committed; monotone, `< log.len()`
    pub commit_index: Option<usize>,
    /// Highest index handed to the executor; monotone, `<= commit_index`
    pub last_applied: Option<usize>,
    pub last_known_leader: ReplicaId,
    pub cluster_config: HashMap<ReplicaId, ServerInfo>,
    /// Index of the most recent membership-change entry, if any
    pub last_config_change: Option<usize>,

    // candidate only
    pub votes_received: usize,

    // leader only: peer id -> next/match index
    pub next_index: HashMap<ReplicaId, usize>,
    pub match_index: HashMap<ReplicaId, Option<usize>>,

    scalars: ScalarStore,
}

impl ReplicaState {
    /// Open the durable stores under `store_prefix` (e.g. `/data/raft.3.`).
    /// With `bootstrap`, recover the log and scalars from previous runs;
    /// otherwise start clean and persist the fresh defaults.
    pub fn open(store_prefix: impl Into<PathBuf>, bootstrap: bool) -> Result<Self> {
        let prefix = store_prefix.into();
        let mut log_path = prefix.as_os_str().to_os_string();
        log_path.push("log.persist");
        let log = DurableLog::open(PathBuf::from(log_path), bootstrap)?;
        let scalars = ScalarStore::new(&prefix);

        let mut state = Self {
            current_term: Term(0),
            voted_for: None,
            log,
            role: RaftRole::Follower,
            election_reset_at: Instant::now(),
            commit_index: None,
            last_applied: None,
            last_known_leader: ReplicaId(0),
            cluster_config: HashMap::new(),
            last_config_change: None,
            votes_received: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            scalars,
        };

        if bootstrap {
            state.current_term = Term(state.scalars.load(KEY_CURRENT_TERM, 0));
            let vote = state.scalars.load(KEY_VOTED_FOR, NO_VOTE);
            state.voted_for = (vote != NO_VOTE).then_some(ReplicaId(vote));
            tracing::info!(
                term = %state.current_term,
                voted_for = ?state.voted_for,
                log_len = state.log.len(),
                "recovered replica state"
            );
        } else {
            state.persist_scalars()?;
        }
        Ok(state)
    }

    /// Durably record the current term and vote.
    pub fn persist_scalars(&self) -> Result<()> {
        self.scalars
            .store(KEY_VOTED_FOR, self.voted_for.map_or(NO_VOTE, |id| id.0))?;
        self.scalars.store(KEY_CURRENT_TERM, self.current_term.0)?;
        Ok(())
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.persist_scalars() {
            tracing::error!(error = %e, "failed to persist term/vote");
        }
    }

    pub fn become_follower(&mut self, term: Term) {
        tracing::info!(%term, "becoming follower");
        self.current_term = term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.election_reset_at = Instant::now();
        self.persist_or_log();
    }

    pub fn become_candidate(&mut self, self_id: ReplicaId) {
        self.current_term = self.current_term.next();
        tracing::info!(term = %self.current_term, "becoming candidate");
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self_id);
        self.votes_received = 1; // own vote
        self.election_reset_at = Instant::now();
        self.persist_or_log();
    }

    pub fn become_leader(&mut self, self_id: ReplicaId, peer_ids: &[ReplicaId]) {
        tracing::info!(term = %self.current_term, "becoming leader");
        self.role = RaftRole::Leader;
        self.election_reset_at = Instant::now();
        self.last_known_leader = self_id;
        self.next_index.clear();
        self.match_index.clear();
        for &peer in peer_ids {
            self.next_index.insert(peer, self.log.len());
            self.match_index.insert(peer, None);
        }
        self.persist_or_log();
    }

    pub fn become_dead(&mut self) {
        tracing::info!("becoming dead");
        self.role = RaftRole::Dead;
        self.persist_or_log();
    }

    /// Raft/db address of the last replica known to be leader, from the
    /// current cluster config.
    pub fn leader_raft_addr(&self) -> String {
        self.cluster_config
            .get(&self.last_known_leader)
            .map(ServerInfo::raft_addr)
            .unwrap_or_default()
    }

    pub fn leader_db_addr(&self) -> String {
        self.cluster_config
            .get(&self.last_known_leader)
            .map(ServerInfo::db_addr)
            .unwrap_or_default()
    }

    /// Point the scalar store somewhere unwritable so persists fail.
    #[cfg(test)]
    pub(crate) fn break_scalar_store(&mut self) {
        self.scalars = ScalarStore::new("/dev/null/raft.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Command, Operation};
    use crate::types::LogEntry;

    fn fresh_state(dir: &std::path::Path) -> ReplicaState {
        ReplicaState::open(dir.join("raft.0."), false).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let me = ReplicaId(0);

        assert_eq!(state.role, RaftRole::Follower);

        state.become_candidate(me);
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, Term(1));
        assert_eq!(state.voted_for, Some(me));
        assert_eq!(state.votes_received, 1);

        state.become_leader(me, &[ReplicaId(1), ReplicaId(2)]);
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.last_known_leader, me);
        assert_eq!(state.next_index.get(&ReplicaId(1)), Some(&0));
        assert_eq!(state.match_index.get(&ReplicaId(2)), Some(&None));

        state.become_follower(Term(3));
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, Term(3));
        assert_eq!(state.voted_for, None);

        state.become_dead();
        assert_eq!(state.role, RaftRole::Dead);
    }

    #[test]
    fn test_scalars_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = fresh_state(dir.path());
            state.current_term = Term(5);
            state.voted_for = Some(ReplicaId(2));
            state.persist_scalars().unwrap();
        }
        let state = ReplicaState::open(dir.path().join("raft.0."), true).unwrap();
        assert_eq!(state.current_term, Term(5));
        assert_eq!(state.voted_for, Some(ReplicaId(2)));
    }

    #[test]
    fn test_leader_next_index_points_past_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        for i in 0..4 {
            state.log.append(LogEntry {
                term: Term(1),
                op: Operation::new(Command::Put { key: i, value: i }),
            });
        }
        state.become_leader(ReplicaId(0), &[ReplicaId(1)]);
        assert_eq!(state.next_index[&ReplicaId(1)], 4);
    }

    #[test]
    fn test_leader_addrs_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        state.cluster_config.insert(
            ReplicaId(1),
            ServerInfo {
                id: ReplicaId(1),
                ip: "10.0.0.1".into(),
                raft_port: 7000,
                db_port: 7001,
                name: "n1".into(),
            },
        );
        state.last_known_leader = ReplicaId(1);
        assert_eq!(state.leader_raft_addr(), "10.0.0.1:7000");
        assert_eq!(state.leader_db_addr(), "10.0.0.1:7001");

        state.last_known_leader = ReplicaId(9);
        assert_eq!(state.leader_raft_addr(), "");
    }
}
