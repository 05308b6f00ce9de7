//! The consensus engine
//!
//! One [`RaftEngine`] per process. Three long-lived threads drive it: the
//! election monitor, the leader replication driver and the commit executor.
//! Every RequestVote/AppendEntries round additionally fans out one short
//! tracked thread per peer; the engine never waits on those, relying on the
//! next periodic round for convergence.
//!
//! All algorithm state lives in one [`ReplicaState`] behind a single
//! exclusive lock. The client-facing queues have their own locks and are
//! handed between threads by swapping whole queue contents, so handoff is
//! O(1) and lock hold times stay bounded.

use parking_lot::Mutex;
use std::cmp;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::op::{Command, OpResult, Operation, StateMachine};
use crate::promise::PromiseStore;
use crate::rpc::{
    AddServerRequest, AppendEntriesRequest, AppendEntriesResponse, MembershipCode,
    MembershipResponse, PeerLink, RaftHandler, RaftTransport, RemoveServerRequest,
    RequestVoteRequest, RequestVoteResponse, WireEntry,
};
use crate::state::{RaftRole, ReplicaState};
use crate::sync::{TaskGroup, WakeSignal};
use crate::types::{LogEntry, PeerNetworkConfig, ReplicaId, ServerInfo, Term};
use crate::Result;

/// Granularity of the interruptible sleeps inside the long-lived loops, so
/// `stop()` does not have to wait out a whole election window.
const SLEEP_STEP: Duration = Duration::from_millis(20);

/// Handle to a running consensus engine; cheap to clone.
pub struct RaftEngine<T: RaftTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: RaftTransport> Clone for RaftEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T> {
    id: ReplicaId,
    config: RaftConfig,

    /// The single coarse lock over all algorithm state.
    state: Mutex<ReplicaState>,

    /// Live outbound links, peer id -> link. Mutated by membership changes.
    /// Lock order: `state` before `peers` when both are held.
    peers: Mutex<HashMap<ReplicaId, Arc<PeerLink<T>>>>,

    /// Client-submitted operations awaiting the replication driver.
    submitted: Mutex<Vec<Operation>>,

    /// Committed operations awaiting the executor.
    committed: Mutex<Vec<Operation>>,
    exec_ready: WakeSignal,

    running: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
    fanout: TaskGroup,

    machine: Arc<dyn StateMachine>,
    promises: Arc<PromiseStore<OpResult>>,
    connect: Box<dyn Fn(&ServerInfo) -> T + Send + Sync>,
}

impl<T: RaftTransport> RaftEngine<T> {
    /// Build an engine for replica `id` over the given cluster.
    ///
    /// Durable state lives under `store_dir` as `raft.<id>.*.persist`; with
    /// `bootstrap` the log and term/vote are recovered from a previous run.
    /// `connect` builds the outbound transport for a peer - injected so the
    /// engine stays independent of any concrete wire layer.
    pub fn new(
        id: ReplicaId,
        config: RaftConfig,
        cluster: HashMap<ReplicaId, ServerInfo>,
        store_dir: impl AsRef<Path>,
        bootstrap: bool,
        machine: Arc<dyn StateMachine>,
        connect: impl Fn(&ServerInfo) -> T + Send + Sync + 'static,
    ) -> Result<Self> {
        let prefix = store_dir.as_ref().join(format!("raft.{}.", id.0));
        let mut state = ReplicaState::open(prefix, bootstrap)?;

        let mut peers = HashMap::new();
        for (peer, info) in &cluster {
            if *peer == id {
                continue;
            }
            peers.insert(*peer, Arc::new(PeerLink::new(connect(info))));
            state.next_index.insert(*peer, 0);
            state.match_index.insert(*peer, None);
        }
        state.cluster_config = cluster;
        state.persist_scalars()?;

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                state: Mutex::new(state),
                peers: Mutex::new(peers),
                submitted: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
                exec_ready: WakeSignal::new(),
                running: AtomicBool::new(false),
                loops: Mutex::new(Vec::new()),
                fanout: TaskGroup::new(),
                machine,
                promises: Arc::new(PromiseStore::new()),
                connect: Box::new(connect),
            }),
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.shared.id
    }

    /// The handle store client threads park their promises in.
    pub fn promises(&self) -> Arc<PromiseStore<OpResult>> {
        Arc::clone(&self.shared.promises)
    }

    pub fn role(&self) -> RaftRole {
        self.shared.state.lock().role
    }

    pub fn current_term(&self) -> Term {
        self.shared.state.lock().current_term
    }

    pub fn commit_index(&self) -> Option<usize> {
        self.shared.state.lock().commit_index
    }

    pub fn cluster_config(&self) -> HashMap<ReplicaId, ServerInfo> {
        self.shared.state.lock().cluster_config.clone()
    }

    pub fn leader_raft_addr(&self) -> String {
        self.shared.state.lock().leader_raft_addr()
    }

    pub fn leader_db_addr(&self) -> String {
        self.shared.state.lock().leader_db_addr()
    }

    /// Launch the three persistent loops.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut loops = self.shared.loops.lock();
        for (name, body) in [
            ("raft-election", Shared::election_loop as fn(&Arc<Shared<T>>)),
            ("raft-replicate", Shared::replication_loop),
            ("raft-execute", Shared::executor_loop),
        ] {
            let shared = Arc::clone(&self.shared);
            loops.push(
                thread::Builder::new()
                    .name(name.into())
                    .spawn(move || body(&shared))
                    .expect("failed to spawn engine loop"),
            );
        }
        info!(id = %self.shared.id, "engine started");
    }

    /// Stop the loops and join everything. Idempotent and terminal: the
    /// replica goes Dead and rejects all further RPCs.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.role != RaftRole::Dead {
                state.become_dead();
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.exec_ready.signal();
        let loops: Vec<_> = std::mem::take(&mut *self.shared.loops.lock());
        for handle in loops {
            let _ = handle.join();
        }
        self.shared.fanout.join_all();

        // The loops exit without draining their queues, so anything still
        // sitting in them has a caller blocked on a promise. Fail those
        // callers now; nothing will ever execute these operations.
        let mut stranded: Vec<Operation> = std::mem::take(&mut *self.shared.submitted.lock());
        stranded.extend(std::mem::take(&mut *self.shared.committed.lock()));
        for op in stranded {
            op.abort(&self.shared.promises);
        }
    }

    /// Enqueue a client-originated operation.
    ///
    /// GET/PUT fail fast on a non-leader, returning the last known leader id
    /// as a redirect hint. Membership operations are enqueued regardless;
    /// leadership for those is enforced at the RPC-handler layer.
    pub fn submit(&self, op: Operation) -> (bool, ReplicaId) {
        let leader = {
            let state = self.shared.state.lock();
            let needs_leader = matches!(
                op.command,
                Command::Get { .. } | Command::Put { .. }
            );
            if needs_leader && state.role != RaftRole::Leader {
                debug!(command = %op.command, "not the leader, rejecting submission");
                return (false, state.last_known_leader);
            }
            state.last_known_leader
        };
        self.shared.submitted.lock().push(op);
        (true, leader)
    }

    /// Apply fault-injection directives to outbound peer links. Test-only
    /// plumbing; unknown peers are logged and skipped.
    pub fn network_update(&self, directives: Vec<PeerNetworkConfig>) {
        let peers = self.shared.peers.lock();
        for directive in &directives {
            match peers.get(&directive.peer_id) {
                Some(link) => {
                    link.apply(directive);
                    info!(peer = %directive.peer_id, ?directive, "applied network update");
                }
                None => warn!(peer = %directive.peer_id, "unknown peer in NetworkUpdate"),
            }
        }
    }

    /// AppendEntries RPC: heartbeat, consistency check, truncate-and-append,
    /// commit-index advance.
    pub fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        if !req.is_heartbeat() {
            debug!(leader = %req.leader_id, count = req.entries.len(), "received AppendEntries");
        }
        let shared = &self.shared;
        let mut state = shared.state.lock();

        // We are going to accept this RPC, so the leader is alive: reset the
        // election timer before anything else.
        if req.term >= state.current_term {
            state.election_reset_at = Instant::now();
        }

        if state.role == RaftRole::Dead {
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
            };
        }

        state.last_known_leader = req.leader_id;

        if req.term > state.current_term {
            info!(ours = %state.current_term, theirs = %req.term, "term out of date");
            state.become_follower(req.term);
        }

        let mut success = false;
        if req.term == state.current_term {
            if state.role != RaftRole::Follower {
                state.become_follower(req.term);
            }

            let consistent = match req.prev_log_index {
                None => true,
                Some(prev) => prev < state.log.len() && state.log.term_at(prev) == req.prev_log_term,
            };

            if consistent {
                success = true;

                // Walk to the first point where the existing log and the
                // incoming entries diverge.
                let mut insert_at = req.prev_log_index.map_or(0, |p| p + 1);
                let mut new_at = 0;
                while insert_at < state.log.len()
                    && new_at < req.entries.len()
                    && state.log.term_at(insert_at) == Some(req.entries[new_at].term)
                {
                    insert_at += 1;
                    new_at += 1;
                }

                if new_at < req.entries.len() {
                    match state.log.resize(insert_at) {
                        Ok(discarded) => {
                            // Fail the promise of every entry we are about to
                            // overwrite; they will never commit here.
                            for entry in discarded {
                                entry.op.abort(&shared.promises);
                            }
                        }
                        Err(e) => error!(error = %e, "failed to truncate log"),
                    }
                    for wire in &req.entries[new_at..] {
                        state.log.append(LogEntry {
                            term: wire.term,
                            op: Operation::new(wire.command.clone()),
                        });
                        match &wire.command {
                            Command::AddServer(info) => {
                                Shared::apply_add_server(shared, &mut state, info)
                            }
                            Command::RemoveServer(id) => {
                                Shared::apply_remove_server(shared, &mut state, *id)
                            }
                            _ => {}
                        }
                        if state.log.len() - 1 != wire.index {
                            error!(
                                expected = wire.index,
                                actual = state.log.len() - 1,
                                "log index mismatch"
                            );
                        }
                    }
                    if let Err(e) = state.log.persist() {
                        // Not durable, so not acknowledged: a crash now would
                        // lose entries the leader already counts as matched.
                        error!(error = %e, "failed to persist log");
                        success = false;
                    }
                }

                if success && req.leader_commit > state.commit_index {
                    let new_commit = cmp::min(req.leader_commit, state.log.len().checked_sub(1));
                    if new_commit > state.commit_index {
                        state.commit_index = new_commit;
                        Shared::queue_newly_committed(shared, &mut state);
                    }
                }
            }
        }

        AppendEntriesResponse {
            term: state.current_term,
            success,
        }
    }

    /// RequestVote RPC: grant iff the candidate is a member, its term is
    /// current, we have not voted for anyone else, and its log is at least as
    /// up to date as ours.
    pub fn request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        debug!(candidate = %req.candidate_id, term = %req.term, "received RequestVote");
        let member = self.shared.peers.lock().contains_key(&req.candidate_id);

        let mut state = self.shared.state.lock();
        if !member {
            debug!(candidate = %req.candidate_id, "candidate is not a member");
            return RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        if req.term > state.current_term {
            state.become_follower(req.term);
        }

        let (last_log_index, last_log_term) = state.log.last_position();
        let up_to_date = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
        let mut granted = req.term == state.current_term
            && state.voted_for.map_or(true, |v| v == req.candidate_id)
            && up_to_date;

        if granted {
            state.voted_for = Some(req.candidate_id);
            state.election_reset_at = Instant::now();
            debug!(candidate = %req.candidate_id, term = %req.term, "granting vote");
        }
        if let Err(e) = state.persist_scalars() {
            // A vote that is not on disk could be recast after a restart.
            error!(error = %e, "failed to persist vote, withholding grant");
            granted = false;
        }

        RequestVoteResponse {
            term: state.current_term,
            vote_granted: granted,
        }
    }

    /// AddServer RPC. Leader-only; serialized with any other in-flight
    /// membership change through bounded commit polling.
    pub fn add_server(&self, req: AddServerRequest) -> MembershipResponse {
        info!(server = %req.server_id, "received AddServer");
        {
            let state = self.shared.state.lock();
            if state.role != RaftRole::Leader {
                return MembershipResponse::redirect(
                    MembershipCode::NotLeader,
                    state.leader_raft_addr(),
                );
            }
            if state.cluster_config.contains_key(&req.server_id) {
                return MembershipResponse::redirect(
                    MembershipCode::ServerExists,
                    state.leader_raft_addr(),
                );
            }
        }

        let info = ServerInfo {
            id: req.server_id,
            ip: req.ip,
            raft_port: req.raft_port,
            db_port: req.db_port,
            name: req.name,
        };

        if !self.wait_prev_change_committed() {
            return MembershipResponse::redirect(
                MembershipCode::PrevNotCommittedTimeout,
                self.leader_raft_addr(),
            );
        }

        let prev_change = self.shared.state.lock().last_config_change;
        let (accepted, _) = self.submit(Operation::new(Command::AddServer(info)));
        if !accepted {
            return MembershipResponse::redirect(MembershipCode::Other, self.leader_raft_addr());
        }

        // A newly added replica can carry a large term and push us out of
        // leadership, so this wait also watches the role.
        match self.wait_cur_change_committed(prev_change, true) {
            MembershipCode::Ok => MembershipResponse::ok(),
            code => MembershipResponse::redirect(code, self.leader_raft_addr()),
        }
    }

    /// RemoveServer RPC. Leader-only; a replica that removes itself reverts
    /// to Follower once the change commits.
    pub fn remove_server(&self, req: RemoveServerRequest) -> MembershipResponse {
        info!(server = %req.server_id, "received RemoveServer");
        {
            let state = self.shared.state.lock();
            if state.role != RaftRole::Leader {
                return MembershipResponse::redirect(
                    MembershipCode::NotLeader,
                    state.leader_raft_addr(),
                );
            }
            if !state.cluster_config.contains_key(&req.server_id) {
                return MembershipResponse::redirect(
                    MembershipCode::ServerNotFound,
                    state.leader_raft_addr(),
                );
            }
        }

        if !self.wait_prev_change_committed() {
            return MembershipResponse::redirect(
                MembershipCode::PrevNotCommittedTimeout,
                self.leader_raft_addr(),
            );
        }

        let prev_change = self.shared.state.lock().last_config_change;
        let (accepted, _) = self.submit(Operation::new(Command::RemoveServer(req.server_id)));
        if !accepted {
            return MembershipResponse::redirect(MembershipCode::Other, self.leader_raft_addr());
        }

        match self.wait_cur_change_committed(prev_change, false) {
            MembershipCode::Ok => {}
            code => return MembershipResponse::redirect(code, self.leader_raft_addr()),
        }

        if req.server_id == self.shared.id {
            info!("removed from the cluster, stepping down");
            let mut state = self.shared.state.lock();
            let term = state.current_term;
            state.become_follower(term);
        }

        MembershipResponse::ok()
    }

    /// Poll (bounded) until any previous membership change is committed.
    fn wait_prev_change_committed(&self) -> bool {
        for _ in 0..self.shared.config.membership_poll_budget {
            {
                let state = self.shared.state.lock();
                let committed = match state.last_config_change {
                    None => true,
                    Some(index) => state.commit_index >= Some(index),
                };
                if committed {
                    return true;
                }
            }
            debug!("waiting for the previous config change to commit");
            thread::sleep(self.shared.config.membership_poll_interval);
        }
        false
    }

    /// Poll (bounded) until a change submitted after `prev_change` is
    /// committed. The submitted change is not withdrawn on timeout; it may
    /// still commit later.
    fn wait_cur_change_committed(
        &self,
        prev_change: Option<usize>,
        bail_when_not_leader: bool,
    ) -> MembershipCode {
        for _ in 0..self.shared.config.membership_poll_budget {
            {
                let state = self.shared.state.lock();
                if bail_when_not_leader && state.role != RaftRole::Leader {
                    return MembershipCode::NotLeader;
                }
                if state.last_config_change > prev_change
                    && state.commit_index >= state.last_config_change
                {
                    return MembershipCode::Ok;
                }
            }
            debug!("waiting for the new config change to commit");
            thread::sleep(self.shared.config.membership_poll_interval);
        }
        MembershipCode::CurNotCommittedTimeout
    }
}

impl<T: RaftTransport> RaftHandler for RaftEngine<T> {
    fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        self.append_entries(req)
    }

    fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        self.request_vote(req)
    }
}

impl<T: RaftTransport> Shared<T> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep in short steps so stop() stays prompt.
    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(cmp::min(SLEEP_STEP, deadline - now));
        }
    }

    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.exec_ready.signal();
    }

    // ---- election monitor ------------------------------------------------

    fn election_loop(shared: &Arc<Self>) {
        // Randomized per replica to reduce split-vote collisions.
        let timeout_ms = rand::thread_rng().gen_range(
            shared.config.election_timeout_min.as_millis() as u64
                ..shared.config.election_timeout_max.as_millis() as u64,
        );
        let timeout = Duration::from_millis(timeout_ms);
        debug!(?timeout, "election monitor running");

        while shared.is_running() {
            shared.sleep_while_running(timeout);
            if !shared.is_running() {
                break;
            }
            let mut state = shared.state.lock();
            match state.role {
                RaftRole::Leader | RaftRole::Candidate => {}
                RaftRole::Follower => {
                    if state.election_reset_at.elapsed() > timeout {
                        Self::start_election(shared, &mut state);
                    }
                }
                RaftRole::Dead => {
                    shared.halt();
                    break;
                }
            }
        }
    }

    /// State lock held. Become candidate and fan out RequestVote; replies
    /// are handled by the fan-out threads.
    fn start_election(shared: &Arc<Self>, state: &mut ReplicaState) {
        state.become_candidate(shared.id);
        let saved_term = state.current_term;
        info!(term = %saved_term, "starting election");

        // The self-vote alone can carry a shrunken cluster.
        if state.votes_received * 2 > state.cluster_config.len() {
            info!(id = %shared.id, term = %saved_term, "elected as leader");
            let peers: Vec<ReplicaId> = shared.peers.lock().keys().copied().collect();
            state.become_leader(shared.id, &peers);
            return;
        }

        let peer_ids: Vec<ReplicaId> = shared.peers.lock().keys().copied().collect();
        for peer in peer_ids {
            let worker = Arc::clone(shared);
            let name = format!("vote-{}", peer.0);
            shared
                .fanout
                .spawn(&name, move || Self::solicit_vote(&worker, peer, saved_term));
        }
    }

    fn solicit_vote(shared: &Arc<Self>, peer: ReplicaId, saved_term: Term) {
        let (last_log_index, last_log_term) = {
            let state = shared.state.lock();
            state.log.last_position()
        };
        // All requests in this round use the term the election started with;
        // if a new term began meanwhile they will simply be turned down.
        let req = RequestVoteRequest {
            candidate_id: shared.id,
            term: saved_term,
            last_log_index,
            last_log_term,
        };

        let link = shared.peers.lock().get(&peer).cloned();
        let Some(link) = link else { return };
        debug!(%peer, term = %saved_term, "sending RequestVote");
        let Some(reply) = link.request_vote(req) else {
            return;
        };

        let mut state = shared.state.lock();
        if state.role != RaftRole::Candidate {
            return;
        }
        if reply.term > saved_term {
            state.become_follower(reply.term);
            return;
        }
        if reply.term == saved_term && reply.vote_granted {
            state.votes_received += 1;
            if state.votes_received * 2 > state.cluster_config.len() {
                info!(id = %shared.id, term = %saved_term, "elected as leader");
                let peers: Vec<ReplicaId> = shared.peers.lock().keys().copied().collect();
                state.become_leader(shared.id, &peers);
            }
        }
    }

    // ---- leader replication driver ---------------------------------------

    fn replication_loop(shared: &Arc<Self>) {
        while shared.is_running() {
            let batch: Vec<Operation> = std::mem::take(&mut *shared.submitted.lock());
            let role = shared.state.lock().role;

            match role {
                RaftRole::Leader => Self::leader_round(shared, batch),
                RaftRole::Dead => {
                    for op in batch {
                        op.abort(&shared.promises);
                    }
                    shared.halt();
                    break;
                }
                _ => {
                    // Leadership was lost between submit and drain; fail the
                    // callers instead of leaving their promises hanging.
                    for op in batch {
                        op.abort(&shared.promises);
                    }
                }
            }

            shared.sleep_while_running(shared.config.replication_interval);
        }
    }

    /// One leader round: drain client submissions into the log, persist,
    /// then fan out AppendEntries to every peer.
    fn leader_round(shared: &Arc<Self>, batch: Vec<Operation>) {
        let saved_term = {
            let mut state = shared.state.lock();
            let term = state.current_term;
            for op in batch {
                match op.command.clone() {
                    Command::AddServer(info) => {
                        state.log.append(LogEntry { term, op });
                        Self::apply_add_server(shared, &mut state, &info);
                    }
                    Command::RemoveServer(id) => {
                        state.log.append(LogEntry { term, op });
                        Self::apply_remove_server(shared, &mut state, id);
                    }
                    _ => state.log.append(LogEntry { term, op }),
                }
            }
            if let Err(e) = state.log.persist() {
                // Do not replicate or count entries that are not on our own
                // disk yet; persist retries the whole suffix next round.
                error!(error = %e, "failed to persist log, skipping round");
                return;
            }
            // With no reachable peers left (or none at all) the reply path
            // never runs, so check the commit rule here as well.
            Self::advance_commit(shared, &mut state);
            term
        };

        let peer_ids: Vec<ReplicaId> = shared.peers.lock().keys().copied().collect();
        for peer in peer_ids {
            let worker = Arc::clone(shared);
            let name = format!("append-{}", peer.0);
            shared.fanout.spawn(&name, move || {
                Self::replicate_to_peer(&worker, peer, saved_term)
            });
        }
    }

    fn replicate_to_peer(shared: &Arc<Self>, peer: ReplicaId, saved_term: Term) {
        let (req, next) = {
            let state = shared.state.lock();
            let Some(&next) = state.next_index.get(&peer) else {
                return; // peer was removed since the round started
            };
            let prev_log_index = next.checked_sub(1);
            let prev_log_term = prev_log_index.and_then(|i| state.log.term_at(i));
            let entries: Vec<WireEntry> = state
                .log
                .iter()
                .enumerate()
                .skip(next)
                .map(|(index, entry)| WireEntry {
                    term: entry.term,
                    index,
                    command: entry.op.command.clone(),
                })
                .collect();
            (
                AppendEntriesRequest {
                    term: saved_term,
                    leader_id: shared.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: state.commit_index,
                },
                next,
            )
        };
        let sent = req.entries.len();

        let link = shared.peers.lock().get(&peer).cloned();
        let Some(link) = link else { return };
        if sent > 0 {
            debug!(%peer, entries = sent, "sending AppendEntries");
        }
        let Some(reply) = link.append_entries(req) else {
            return;
        };

        let mut state = shared.state.lock();
        if reply.term > saved_term {
            state.become_follower(reply.term);
            return;
        }
        if state.role != RaftRole::Leader || reply.term != saved_term {
            return;
        }
        if !state.next_index.contains_key(&peer) {
            return; // removed while the RPC was in flight
        }

        if reply.success {
            let new_next = next + sent;
            state.next_index.insert(peer, new_next);
            state.match_index.insert(peer, new_next.checked_sub(1));
            Self::advance_commit(shared, &mut state);
        } else {
            // Log mismatch: back up one entry and retry next round.
            debug!(%peer, "AppendEntries rejected, decrementing next_index");
            state.next_index.insert(peer, next.saturating_sub(1));
        }
    }

    /// State lock held, leader only. Advance the commit index over entries
    /// from the current term that a strict majority has replicated; entries
    /// from earlier terms are never committed by match count alone.
    fn advance_commit(shared: &Arc<Self>, state: &mut ReplicaState) {
        if state.role != RaftRole::Leader {
            return;
        }
        let start = state.commit_index.map_or(0, |c| c + 1);
        let saved = state.commit_index;
        for i in start..state.log.len() {
            if state.log.term_at(i) != Some(state.current_term) {
                continue;
            }
            let mut replicas = usize::from(state.cluster_config.contains_key(&shared.id));
            for matched in state.match_index.values() {
                if matched.is_some_and(|m| m >= i) {
                    replicas += 1;
                }
            }
            if replicas * 2 > state.cluster_config.len() {
                state.commit_index = Some(i);
            }
        }
        if state.commit_index != saved {
            debug!(commit = ?state.commit_index, "commit index advanced");
            Self::queue_newly_committed(shared, &mut *state);
        }
    }

    /// State lock held. Hand every committed-but-unapplied operation to the
    /// executor and wake it.
    fn queue_newly_committed(shared: &Shared<T>, state: &mut ReplicaState) {
        let Some(commit) = state.commit_index else {
            return;
        };
        let from = state.last_applied.map_or(0, |a| a + 1);
        if from > commit {
            return;
        }
        {
            let mut committed = shared.committed.lock();
            for i in from..=commit {
                if let Some(entry) = state.log.get(i) {
                    committed.push(entry.op.clone());
                }
            }
        }
        state.last_applied = state.commit_index;
        shared.exec_ready.signal();
    }

    // ---- commit executor -------------------------------------------------

    fn executor_loop(shared: &Arc<Self>) {
        while shared.is_running() {
            shared.exec_ready.wait();
            if !shared.is_running() {
                break;
            }
            let batch: Vec<Operation> = std::mem::take(&mut *shared.committed.lock());
            if !batch.is_empty() {
                debug!(count = batch.len(), "executing committed operations");
            }
            for op in batch {
                op.execute(&*shared.machine, &shared.promises);
            }
        }
    }

    // ---- membership side effects -----------------------------------------

    /// State lock held. Applied as soon as the membership entry is appended
    /// (pre-commit), so replication to the new peer can start immediately.
    fn apply_add_server(shared: &Shared<T>, state: &mut ReplicaState, info: &ServerInfo) {
        info!(server = %info.id, "applying add server");
        state.last_config_change = state.log.len().checked_sub(1);
        state.cluster_config.insert(info.id, info.clone());
        if let Err(e) = state.persist_scalars() {
            error!(error = %e, "failed to persist after config change");
        }
        if info.id != shared.id {
            let link = Arc::new(PeerLink::new((shared.connect)(info)));
            shared.peers.lock().insert(info.id, link);
            state.next_index.insert(info.id, 0);
            state.match_index.insert(info.id, None);
        }
    }

    /// State lock held. Same append-time semantics as `apply_add_server`.
    fn apply_remove_server(shared: &Shared<T>, state: &mut ReplicaState, id: ReplicaId) {
        info!(server = %id, "applying remove server");
        state.last_config_change = state.log.len().checked_sub(1);
        state.cluster_config.remove(&id);
        if let Err(e) = state.persist_scalars() {
            error!(error = %e, "failed to persist after config change");
        }
        if id != shared.id {
            shared.peers.lock().remove(&id);
            state.next_index.remove(&id);
            state.match_index.remove(&id);
        }
    }
}

impl<T: RaftTransport> Drop for RaftEngine<T> {
    fn drop(&mut self) {
        // Last handle going away stops the loops; earlier drops just detach.
        if Arc::strong_count(&self.shared) == 1 {
            self.stop();
        }
    }
}
