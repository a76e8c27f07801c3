use super::error::RaftError;
use super::log::LogEntry;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::state_machine::{Applier, StateMachine};
use super::storage::LogStore;
use nidus_common::error::NidusError;
use nidus_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info};

/// Upper bound on entries carried by one AppendEntries request.
pub const MAX_ENTRIES_PER_APPEND: usize = 64;

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// An RPC the node wants sent. Replies come back as separate events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    RequestVote {
        to: NodeId,
        request: RequestVoteRequest,
    },
    AppendEntries {
        to: NodeId,
        request: AppendEntriesRequest,
    },
}

/// A committed entry that was applied to the local state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport<R> {
    pub index: LogIndex,
    pub term: Term,
    pub response: R,
}

/// Side effects accumulated while handling events, drained by the event loop.
#[derive(Debug)]
pub struct ReadyBundle<R> {
    pub messages: Vec<Outbound>,
    pub applied: Vec<ApplyReport<R>>,
    pub reset_election_timer: bool,
}

impl<R> Default for ReadyBundle<R> {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            applied: Vec::new(),
            reset_election_timer: false,
        }
    }
}

/// Point-in-time view of a node, for status queries and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// A Raft node: controls its own state and participates in consensus.
///
/// The node performs no I/O besides its own log store. Inbound RPCs are
/// answered directly; everything else (outbound RPCs, applied entries,
/// timer resets) is queued in a [`ReadyBundle`] for the caller to drain.
pub struct RaftNode<S: StateMachine> {
    id: NodeId,
    peers: Vec<NodeId>,
    store: Box<dyn LogStore>,

    current_term: Term,
    voted_for: Option<NodeId>,
    role: NodeRole,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    applier: Applier<S>,

    votes_received: HashSet<NodeId>,
    next_index: HashMap<NodeId, LogIndex>,  // For each peer: next entry to send
    match_index: HashMap<NodeId, LogIndex>, // For each peer: last index known replicated

    halted: bool,
    ready: ReadyBundle<S::Response>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Create a Raft node as Follower, restoring term and vote from `store`.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        store: Box<dyn LogStore>,
        machine: S,
    ) -> Result<Self, NidusError> {
        let state = store.load()?;
        info!(
            node = %id,
            term = state.current_term,
            voted_for = ?state.voted_for,
            last_index = store.last_index(),
            "restored persistent state"
        );
        Ok(Self {
            id,
            peers,
            store,
            current_term: state.current_term,
            voted_for: state.voted_for,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            applier: Applier::new(machine),
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            halted: false,
            ready: ReadyBundle::default(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.applier.last_applied()
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.store.last_index()
    }

    /// True once a storage write failed; the node refuses all further work.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn state_machine(&self) -> &S {
        self.applier.machine()
    }

    /// Copy of the whole log.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.store.entries_from(1, usize::MAX).to_vec()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id.clone(),
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.applier.last_applied(),
            last_log_index: self.store.last_index(),
        }
    }

    /// Drains the side effects produced since the last call.
    pub fn take_ready(&mut self) -> ReadyBundle<S::Response> {
        std::mem::take(&mut self.ready)
    }

    /// Votes (self included) needed to win an election or commit an entry.
    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn check_running(&self) -> Result<(), RaftError> {
        if self.halted {
            return Err(RaftError::Persistence(
                "node halted after a storage failure".into(),
            ));
        }
        Ok(())
    }

    /// Runs a store mutation; any failure halts the node for good.
    fn persist<T>(
        &mut self,
        op: impl FnOnce(&mut dyn LogStore) -> nidus_common::error::Result<T>,
    ) -> Result<T, RaftError> {
        match op(self.store.as_mut()) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.halted = true;
                error!(node = %self.id, error = %err, "storage write failed, halting node");
                Err(RaftError::Persistence(err.to_string()))
            }
        }
    }

    fn save_term_and_vote(&mut self) -> Result<(), RaftError> {
        let term = self.current_term;
        let vote = self.voted_for.clone();
        self.persist(|store| store.set_term_and_vote(term, vote.as_ref()))
    }

    //
    // Role transitions
    //

    /// Step down to follower, adopting `term` if it is newer.
    fn become_follower(&mut self, term: Term) -> Result<(), RaftError> {
        let previous = self.role;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.save_term_and_vote()?;
        }
        self.role = NodeRole::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        if previous != NodeRole::Follower {
            info!(node = %self.id, term = self.current_term, from = ?previous, "became follower");
        }
        Ok(())
    }

    /// Transition to leader role and assert leadership with a heartbeat.
    fn become_leader(&mut self) {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.store.last_index() + 1;
        self.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();

        info!(node = %self.id, term = self.current_term, "became leader");
        self.broadcast_append_entries();
    }

    /// Election timer fired: start (or restart) an election.
    pub fn handle_election_timeout(&mut self) -> Result<(), RaftError> {
        self.check_running()?;
        if self.role == NodeRole::Leader {
            return Ok(());
        }

        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.save_term_and_vote()?;

        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.ready.reset_election_timer = true;

        info!(node = %self.id, term = self.current_term, "starting election");

        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
            return Ok(());
        }

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.store.last_index(),
            last_log_term: self.store.last_term(),
        };
        for peer in &self.peers {
            self.ready.messages.push(Outbound::RequestVote {
                to: peer.clone(),
                request: request.clone(),
            });
        }
        Ok(())
    }

    /// Heartbeat ticker fired: a leader replicates to every peer.
    pub fn handle_heartbeat(&mut self) -> Result<(), RaftError> {
        self.check_running()?;
        if self.role == NodeRole::Leader {
            self.broadcast_append_entries();
        }
        Ok(())
    }

    //
    // RequestVote
    //

    /// Handles RequestVote RPC. Term and vote changes are persisted before
    /// the reply is returned.
    pub fn handle_request_vote(
        &mut self,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.check_running()?;

        // 1. Reject if term is older
        if req.term < self.current_term {
            debug!(
                node = %self.id,
                candidate = %req.candidate_id,
                term = req.term,
                current_term = self.current_term,
                "vote denied: stale term"
            );
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // 2. Newer term: step down and forget the previous vote
        if req.term > self.current_term {
            self.become_follower(req.term)?;
        }

        // 3. Candidate's log must be at least as up-to-date as ours
        let last_term = self.store.last_term();
        let last_index = self.store.last_index();
        let log_ok = req.last_log_term > last_term
            || (req.last_log_term == last_term && req.last_log_index >= last_index);

        // 4. At most one candidate per term
        let can_vote = match &self.voted_for {
            None => true,
            Some(v) => *v == req.candidate_id,
        };

        let granted = can_vote && log_ok;
        if granted {
            if self.voted_for.is_none() {
                self.voted_for = Some(req.candidate_id.clone());
                self.save_term_and_vote()?;
            }
            self.ready.reset_election_timer = true;
        }

        debug!(
            node = %self.id,
            candidate = %req.candidate_id,
            term = self.current_term,
            granted,
            log_ok,
            "vote request handled"
        );
        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted: granted,
        })
    }

    /// Handles a vote response for a request sent in `request_term`.
    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        request_term: Term,
        res: RequestVoteResponse,
    ) -> Result<(), RaftError> {
        self.check_running()?;

        if res.term > self.current_term {
            return self.become_follower(res.term);
        }

        // either already the leader, demoted, or a reply from an older election
        if self.role != NodeRole::Candidate || request_term != self.current_term {
            return Ok(());
        }

        if res.vote_granted {
            self.votes_received.insert(from);
            if self.votes_received.len() >= self.quorum() {
                self.become_leader();
            }
        }
        Ok(())
    }

    //
    // AppendEntries
    //

    /// Handles AppendEntries RPC as a follower
    pub fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.check_running()?;

        // 1. Reject if term is older
        if req.term < self.current_term {
            debug!(
                node = %self.id,
                leader = %req.leader_id,
                term = req.term,
                current_term = self.current_term,
                "append rejected: stale term"
            );
            return Ok(self.append_rejected(0));
        }

        // 2. The sender is the legitimate leader of this term
        if req.term > self.current_term || self.role != NodeRole::Follower {
            self.become_follower(req.term)?;
        }
        if self.leader_id.as_ref() != Some(&req.leader_id) {
            info!(
                node = %self.id,
                leader = %req.leader_id,
                term = self.current_term,
                "following leader"
            );
            self.leader_id = Some(req.leader_id.clone());
        }
        self.ready.reset_election_timer = true;

        // 3. Validate previous entry consistency
        match self.store.term_at(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {}
            Some(term) => {
                // skip back over the whole conflicting term in one step
                let mut first = req.prev_log_index;
                while first > 1 && self.store.term_at(first - 1) == Some(term) {
                    first -= 1;
                }
                debug!(
                    node = %self.id,
                    prev_log_index = req.prev_log_index,
                    expected = req.prev_log_term,
                    found = term,
                    "append rejected: log mismatch"
                );
                return Ok(self.append_rejected(first.saturating_sub(1)));
            }
            None => {
                debug!(
                    node = %self.id,
                    prev_log_index = req.prev_log_index,
                    last_index = self.store.last_index(),
                    "append rejected: missing entry"
                );
                let hint = self.store.last_index();
                return Ok(self.append_rejected(hint));
            }
        }

        let malformed = req
            .entries
            .iter()
            .enumerate()
            .any(|(pos, e)| e.index != req.prev_log_index + 1 + pos as LogIndex);
        if malformed {
            debug!(
                node = %self.id,
                leader = %req.leader_id,
                "append rejected: non-contiguous entries"
            );
            let hint = self.store.last_index().min(req.prev_log_index);
            return Ok(self.append_rejected(hint));
        }

        // 4. Append new entries, dropping the first conflicting suffix
        let first_new = req
            .entries
            .iter()
            .position(|e| self.store.term_at(e.index) != Some(e.term));
        if let Some(pos) = first_new {
            let from = req.entries[pos].index;
            if from <= self.store.last_index() {
                debug!(node = %self.id, index = from, "truncating conflicting entries");
                self.persist(|store| store.truncate_from(from))?;
            }
            let new_entries = &req.entries[pos..];
            self.persist(|store| store.append(new_entries))?;
        }

        let last_new = req.prev_log_index + req.entries.len() as LogIndex;

        // 5. Update commit index
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(last_new);
            if target > self.commit_index {
                self.commit_index = target;
                debug!(node = %self.id, commit_index = target, "commit index advanced");
                self.apply_committed();
            }
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last_new,
        })
    }

    fn append_rejected(&self, hint: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: hint,
        }
    }

    /// Called when follower responds to an AppendEntries RPC sent in `request_term`
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        request_term: Term,
        res: AppendEntriesResponse,
    ) -> Result<(), RaftError> {
        self.check_running()?;

        if res.term > self.current_term {
            return self.become_follower(res.term);
        }

        if self.role != NodeRole::Leader || request_term != self.current_term {
            debug!(node = %self.id, peer = %from, request_term, "discarding stale append reply");
            return Ok(());
        }

        let next = self.next_index.get(&from).copied();
        let matched = self.match_index.get(&from).copied();
        let (Some(next), Some(matched)) = (next, matched) else {
            return Ok(());
        };
        let last_index = self.store.last_index();

        if res.success {
            let new_match = res.match_index.min(last_index).max(matched);
            self.match_index.insert(from.clone(), new_match);
            self.next_index.insert(from.clone(), new_match + 1);
            self.advance_commit_index();
            if new_match < last_index {
                self.send_append_entries(&from);
            }
        } else {
            // Follower rejected: move back (using its hint) and retry
            let retry_from = (res.match_index + 1)
                .min(next.saturating_sub(1))
                .max(matched + 1);
            self.next_index.insert(from.clone(), retry_from);
            debug!(
                node = %self.id,
                peer = %from,
                next_index = retry_from,
                "backing off next index"
            );
            self.send_append_entries(&from);
        }
        Ok(())
    }

    fn broadcast_append_entries(&mut self) {
        for peer in self.peers.clone() {
            self.send_append_entries(&peer);
        }
    }

    fn send_append_entries(&mut self, peer: &NodeId) {
        let last_index = self.store.last_index();
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(last_index + 1)
            .clamp(1, last_index + 1);
        let prev_log_index = next - 1;
        let prev_log_term = self.store.term_at(prev_log_index).unwrap_or(0);
        let batch = self.store.entries_from(next, MAX_ENTRIES_PER_APPEND);

        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: batch.to_vec(),
            leader_commit: self.commit_index,
        };
        self.ready.messages.push(Outbound::AppendEntries {
            to: peer.clone(),
            request,
        });
    }

    /// Commit the highest current-term index held by a majority.
    ///
    /// Entries from earlier terms are only committed indirectly, never by
    /// counting replicas.
    fn advance_commit_index(&mut self) {
        let mut n = self.store.last_index();
        while n > self.commit_index {
            match self.store.term_at(n) {
                Some(term) if term == self.current_term => {
                    let replicas = 1 + self.match_index.values().filter(|m| **m >= n).count();
                    if replicas >= self.quorum() {
                        self.commit_index = n;
                        info!(node = %self.id, commit_index = n, "commit index advanced");
                        self.apply_committed();
                        return;
                    }
                }
                // terms never decrease along the log
                _ => return,
            }
            n -= 1;
        }
    }

    /// Applies all entries between last_applied..=commit_index to the state machine
    fn apply_committed(&mut self) {
        while self.applier.last_applied() < self.commit_index {
            let index = self.applier.last_applied() + 1;
            let Some(entry) = self.store.entry_at(index) else {
                error!(node = %self.id, index, "committed entry missing from log");
                break;
            };
            let response = self.applier.apply(entry);
            debug!(node = %self.id, index, response = ?response, "applied entry");
            self.ready.applied.push(ApplyReport {
                index,
                term: entry.term,
                response,
            });
        }
    }

    //
    // Client proposals
    //

    /// Called by the leader to append a new client command.
    ///
    /// The entry is durable before any AppendEntries for it is queued.
    /// Returns the index to wait on for the applied result.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        self.check_running()?;
        if self.role != NodeRole::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id.clone(),
            });
        }

        let entry = LogEntry::new(self.store.last_index() + 1, self.current_term, command);
        let index = entry.index;
        self.persist(|store| store.append(std::slice::from_ref(&entry)))?;
        debug!(node = %self.id, index, term = self.current_term, "appended proposal");

        self.broadcast_append_entries();
        // a single-node cluster commits on its own
        self.advance_commit_index();
        Ok(index)
    }
}
