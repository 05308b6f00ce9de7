//! In-process transport for multi-replica tests
//!
//! A [`Router`] maps replica ids to their inbound handlers, and a
//! [`LoopbackTransport`] delivers RPCs through it by direct function call.
//! An unregistered peer behaves like a dead link: every call returns `None`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftHandler, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::types::ReplicaId;

/// Shared registry of live replicas in a test cluster.
#[derive(Default)]
pub struct Router {
    handlers: Mutex<HashMap<ReplicaId, Arc<dyn RaftHandler>>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: ReplicaId, handler: Arc<dyn RaftHandler>) {
        self.handlers.lock().insert(id, handler);
    }

    /// Take a replica off the network. Calls to it start returning `None`,
    /// like a crashed process.
    pub fn deregister(&self, id: ReplicaId) {
        self.handlers.lock().remove(&id);
    }

    fn resolve(&self, id: ReplicaId) -> Option<Arc<dyn RaftHandler>> {
        self.handlers.lock().get(&id).cloned()
    }
}

/// Outbound link to one peer, resolved through the router on every call so
/// registration changes take effect immediately.
pub struct LoopbackTransport {
    router: Arc<Router>,
    peer: ReplicaId,
}

impl LoopbackTransport {
    pub fn new(router: Arc<Router>, peer: ReplicaId) -> Self {
        Self { router, peer }
    }
}

impl RaftTransport for LoopbackTransport {
    fn append_entries(&self, req: AppendEntriesRequest) -> Option<AppendEntriesResponse> {
        self.router
            .resolve(self.peer)
            .map(|h| h.handle_append_entries(req))
    }

    fn request_vote(&self, req: RequestVoteRequest) -> Option<RequestVoteResponse> {
        self.router
            .resolve(self.peer)
            .map(|h| h.handle_request_vote(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Term;

    struct Echo(Term);

    impl RaftHandler for Echo {
        fn handle_append_entries(&self, _req: AppendEntriesRequest) -> AppendEntriesResponse {
            AppendEntriesResponse {
                term: self.0,
                success: true,
            }
        }

        fn handle_request_vote(&self, _req: RequestVoteRequest) -> RequestVoteResponse {
            RequestVoteResponse {
                term: self.0,
                vote_granted: false,
            }
        }
    }

    fn vote_req() -> RequestVoteRequest {
        RequestVoteRequest {
            candidate_id: ReplicaId(1),
            term: Term(1),
            last_log_index: None,
            last_log_term: None,
        }
    }

    #[test]
    fn test_unregistered_peer_is_dead_link() {
        let router = Router::new();
        let transport = LoopbackTransport::new(Arc::clone(&router), ReplicaId(2));
        assert!(transport.request_vote(vote_req()).is_none());
    }

    #[test]
    fn test_registration_takes_effect_per_call() {
        let router = Router::new();
        let transport = LoopbackTransport::new(Arc::clone(&router), ReplicaId(2));

        router.register(ReplicaId(2), Arc::new(Echo(Term(7))));
        let reply = transport.request_vote(vote_req()).unwrap();
        assert_eq!(reply.term, Term(7));

        router.deregister(ReplicaId(2));
        assert!(transport.request_vote(vote_req()).is_none());
    }
}
