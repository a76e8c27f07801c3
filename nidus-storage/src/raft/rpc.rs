use super::log::LogEntry;
use nidus_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,               // Leader’s term
    pub leader_id: NodeId,        // Leader's ID
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,      // Term of that entry
    pub entries: Vec<LogEntry>,   // New log entries to store (empty = heartbeat)
    pub leader_commit: LogIndex,  // Leader’s commit index
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    /// On success, the index of the last entry covered by the request.
    /// On rejection, a hint: the highest index the leader may retry from.
    pub match_index: LogIndex,
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_append_entries() {
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "leader1".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, "SET b k v")],
            leader_commit: 0,
        };

        let encoded = bincode::serialize(&req).unwrap();
        let decoded: AppendEntriesRequest = bincode::deserialize(&encoded).unwrap();

        assert_eq!(decoded, req);
        assert_eq!(decoded.leader_id, "leader1");
    }
}
