use nidus_common::types::{LogIndex, NodeId};
use thiserror::Error;

/// Failures surfaced to callers of the Raft node.
///
/// Stale terms and log mismatches are not errors here: they travel back to
/// the sender as `success = false` / `vote_granted = false` replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    #[error("not the leader (leader: {})", leader_hint.as_deref().unwrap_or("unknown"))]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("timed out waiting for the entry to commit")]
    Timeout,

    #[error("leadership lost before entry {index} was committed")]
    LeadershipLost { index: LogIndex },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("node is shut down")]
    Shutdown,
}
