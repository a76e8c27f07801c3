//! In-process transport: nodes of one runtime talk through their handles.
//! Supports partitioning single nodes off, for failure tests and demos.

use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::server::RaftHandle;
use super::transport::{Transport, TransportError};
use async_trait::async_trait;
use nidus_common::types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct NetworkState<R> {
    nodes: HashMap<NodeId, RaftHandle<R>>,
    isolated: HashSet<NodeId>,
}

/// Shared switchboard between in-memory nodes.
pub struct InMemoryNetwork<R> {
    state: Arc<Mutex<NetworkState<R>>>,
}

impl<R> Clone for InMemoryNetwork<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<R: Send + 'static> Default for InMemoryNetwork<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> InMemoryNetwork<R> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                nodes: HashMap::new(),
                isolated: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes a running node reachable under its id.
    pub fn register(&self, handle: RaftHandle<R>) {
        self.lock().nodes.insert(handle.id().clone(), handle);
    }

    /// Drops all traffic to and from `id` until healed.
    pub fn isolate(&self, id: &str) {
        self.lock().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.lock().isolated.remove(id);
    }

    /// Transport used by node `local` to reach the others.
    pub fn transport_for(&self, local: &str) -> Arc<InMemoryTransport<R>> {
        Arc::new(InMemoryTransport {
            local: local.to_string(),
            network: self.clone(),
        })
    }

    fn connected(&self, a: &NodeId, b: &NodeId) -> bool {
        let state = self.lock();
        !state.isolated.contains(a) && !state.isolated.contains(b)
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<RaftHandle<R>, TransportError> {
        if !self.connected(from, to) {
            return Err(partitioned(to));
        }
        self.lock()
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))
    }

    /// A reply is lost too if the link went down while the call was in flight.
    fn check_return_path(&self, from: &NodeId, to: &NodeId) -> Result<(), TransportError> {
        if self.connected(from, to) {
            Ok(())
        } else {
            Err(partitioned(to))
        }
    }
}

fn partitioned(peer: &NodeId) -> TransportError {
    TransportError::Unreachable(peer.clone(), "partitioned".into())
}

pub struct InMemoryTransport<R> {
    local: NodeId,
    network: InMemoryNetwork<R>,
}

#[async_trait]
impl<R: Send + 'static> Transport for InMemoryTransport<R> {
    async fn request_vote(
        &self,
        target: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let handle = self.network.route(&self.local, target)?;
        let response = handle
            .request_vote(req)
            .await
            .map_err(|e| TransportError::Remote(target.clone(), e.to_string()))?;
        self.network.check_return_path(&self.local, target)?;
        Ok(response)
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let handle = self.network.route(&self.local, target)?;
        let response = handle
            .append_entries(req)
            .await
            .map_err(|e| TransportError::Remote(target.clone(), e.to_string()))?;
        self.network.check_return_path(&self.local, target)?;
        Ok(response)
    }
}
