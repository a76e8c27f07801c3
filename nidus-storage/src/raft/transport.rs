use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use async_trait::async_trait;
use nidus_common::types::NodeId;
use thiserror::Error;

/// Why an outbound RPC produced no reply.
///
/// None of these are fatal: the node simply sees no response and retries
/// on its next heartbeat or election.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("peer {0} is unreachable: {1}")]
    Unreachable(NodeId, String),

    #[error("rpc to {0} timed out")]
    Timeout(NodeId),

    #[error("peer {0} failed the request: {1}")]
    Remote(NodeId, String),
}

/// Delivers Raft RPCs to peers and returns their replies.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}
