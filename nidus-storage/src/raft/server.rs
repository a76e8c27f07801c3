//! Async driver for a [`RaftNode`].
//!
//! One task owns the node. Inbound RPCs, RPC replies, timer ticks and client
//! proposals all arrive as events on a single queue, so node state is never
//! touched concurrently. Outbound RPCs run as separate tasks and feed their
//! replies back into the same queue, tagged with the term they were sent in.

use super::config::RaftConfig;
use super::error::RaftError;
use super::node::{NodeRole, NodeStatus, Outbound, RaftNode};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::state_machine::StateMachine;
use super::transport::{Transport, TransportError};
use nidus_common::types::{LogIndex, NodeId, Term};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, Instrument};

const EVENT_QUEUE_DEPTH: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, RaftError>>;

enum Event<R> {
    Propose {
        command: Vec<u8>,
        reply: Reply<R>,
    },
    RequestVote {
        request: RequestVoteRequest,
        reply: Reply<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: Reply<AppendEntriesResponse>,
    },
    VoteReply {
        from: NodeId,
        term: Term,
        response: RequestVoteResponse,
    },
    AppendReply {
        from: NodeId,
        term: Term,
        response: AppendEntriesResponse,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Cloneable entry point to a running node.
pub struct RaftHandle<R> {
    id: NodeId,
    events: mpsc::Sender<Event<R>>,
    propose_timeout: Duration,
}

impl<R> Clone for RaftHandle<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            events: self.events.clone(),
            propose_timeout: self.propose_timeout,
        }
    }
}

impl<R: Send + 'static> RaftHandle<R> {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Replicates `command` and waits until it is applied locally.
    ///
    /// Fails with `NotLeader` on followers and `Timeout` when the entry is
    /// not applied within the propose timeout.
    pub async fn propose(&self, command: Vec<u8>) -> Result<R, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Propose { command, reply }).await?;
        match time::timeout(self.propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    /// Inbound RequestVote from a peer.
    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.call(|reply| Event::RequestVote { request, reply })
            .await
    }

    /// Inbound AppendEntries from a peer.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|reply| Event::AppendEntries { request, reply })
            .await
    }

    pub async fn status(&self) -> Result<NodeStatus, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status { reply }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Stops the event loop and waits for it to exit.
    pub async fn shutdown(&self) {
        if self.events.send(Event::Shutdown).await.is_ok() {
            self.events.closed().await;
        }
    }

    async fn send(&self, event: Event<R>) -> Result<(), RaftError> {
        self.events
            .send(event)
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Event<R>) -> Result<T, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }
}

/// Owns a node, its timers and its in-flight proposals.
pub struct RaftServer<S: StateMachine, T: Transport> {
    node: RaftNode<S>,
    transport: Arc<T>,
    config: RaftConfig,
    events: mpsc::Receiver<Event<S::Response>>,
    loopback: mpsc::WeakSender<Event<S::Response>>,
    pending: BTreeMap<LogIndex, (Term, Reply<S::Response>)>, // proposals awaiting apply
    election_deadline: Instant,
    last_role: NodeRole,
}

impl<S: StateMachine, T: Transport> RaftServer<S, T> {
    /// Starts the event loop for `node` on the current runtime.
    pub fn spawn(
        node: RaftNode<S>,
        transport: Arc<T>,
        config: RaftConfig,
    ) -> RaftHandle<S::Response> {
        let (server, handle) = Self::new(node, transport, config);
        let span = info_span!("node", id = %handle.id);
        tokio::spawn(server.run().instrument(span));
        handle
    }

    fn new(
        node: RaftNode<S>,
        transport: Arc<T>,
        config: RaftConfig,
    ) -> (Self, RaftHandle<S::Response>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let handle = RaftHandle {
            id: node.id().clone(),
            events: tx.clone(),
            propose_timeout: config.propose_timeout,
        };

        let server = Self {
            last_role: node.role(),
            node,
            transport,
            election_deadline: Instant::now() + config.random_election_timeout(),
            config,
            events: rx,
            loopback: tx.downgrade(),
            pending: BTreeMap::new(),
        };
        (server, handle)
    }

    async fn run(mut self) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(term = self.node.current_term(), "raft server started");

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = heartbeat.tick() => self.on_heartbeat(),
                _ = time::sleep_until(self.election_deadline) => {
                    self.reset_election_deadline();
                    let _ = self.node.handle_election_timeout();
                }
            }
            self.process_ready();
        }

        self.fail_pending(|_| RaftError::Shutdown);
        info!("raft server stopped");
    }

    fn handle_event(&mut self, event: Event<S::Response>) {
        match event {
            Event::Propose { command, reply } => match self.node.propose(command) {
                Ok(index) => {
                    let term = self.node.current_term();
                    self.pending.insert(index, (term, reply));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Event::RequestVote { request, reply } => {
                let _ = reply.send(self.node.handle_request_vote(request));
            }
            Event::AppendEntries { request, reply } => {
                let _ = reply.send(self.node.handle_append_entries(request));
            }
            Event::VoteReply {
                from,
                term,
                response,
            } => {
                let _ = self.node.handle_vote_response(from, term, response);
            }
            Event::AppendReply {
                from,
                term,
                response,
            } => {
                let _ = self
                    .node
                    .handle_append_entries_response(from, term, response);
            }
            Event::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
            Event::Shutdown => {}
        }
    }

    fn on_heartbeat(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, (_, reply)| !reply.is_closed());
        let abandoned = before - self.pending.len();
        if abandoned > 0 {
            debug!(abandoned, "dropped proposals nobody is waiting for");
        }

        // failures are logged by the node and halt it
        let _ = self.node.handle_heartbeat();
    }

    /// Acts on everything the node queued while handling the last event.
    fn process_ready(&mut self) {
        let ready = self.node.take_ready();
        if ready.reset_election_timer {
            self.reset_election_deadline();
        }
        for message in ready.messages {
            self.dispatch(message);
        }
        for report in ready.applied {
            if let Some((term, reply)) = self.pending.remove(&report.index) {
                // another leader's entry took this index
                let result = if term == report.term {
                    Ok(report.response)
                } else {
                    Err(RaftError::LeadershipLost {
                        index: report.index,
                    })
                };
                let _ = reply.send(result);
            }
        }

        let role = self.node.role();
        if role != self.last_role {
            info!(
                from = ?self.last_role,
                to = ?role,
                term = self.node.current_term(),
                "role changed"
            );
            if self.last_role == NodeRole::Leader {
                self.fail_pending(|index| RaftError::LeadershipLost { index });
            }
            self.last_role = role;
        }
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    fn fail_pending(&mut self, error: impl Fn(LogIndex) -> RaftError) {
        for (index, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(error(index)));
        }
    }

    /// Sends one RPC in the background; the reply re-enters the event queue.
    fn dispatch(&self, message: Outbound) {
        let Some(loopback) = self.loopback.upgrade() else {
            return;
        };
        let transport = self.transport.clone();
        let rpc_timeout = self.config.rpc_timeout;

        match message {
            Outbound::RequestVote { to, request } => {
                let term = request.term;
                let task = async move {
                    let call = transport.request_vote(&to, request);
                    let result = time::timeout(rpc_timeout, call)
                        .await
                        .unwrap_or_else(|_| Err(TransportError::Timeout(to.clone())));
                    match result {
                        Ok(response) => {
                            let _ = loopback
                                .send(Event::VoteReply {
                                    from: to,
                                    term,
                                    response,
                                })
                                .await;
                        }
                        Err(err) => debug!(peer = %to, error = %err, "vote request failed"),
                    }
                };
                tokio::spawn(task.in_current_span());
            }
            Outbound::AppendEntries { to, request } => {
                let term = request.term;
                let task = async move {
                    let call = transport.append_entries(&to, request);
                    let result = time::timeout(rpc_timeout, call)
                        .await
                        .unwrap_or_else(|_| Err(TransportError::Timeout(to.clone())));
                    match result {
                        Ok(response) => {
                            let _ = loopback
                                .send(Event::AppendReply {
                                    from: to,
                                    term,
                                    response,
                                })
                                .await;
                        }
                        Err(err) => debug!(peer = %to, error = %err, "append entries failed"),
                    }
                };
                tokio::spawn(task.in_current_span());
            }
        }
    }
}

//
// Tests
//
#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::kv::{BucketStore, KvResponse};
    use crate::raft::storage::MemoryLogStore;
    use async_trait::async_trait;

    struct Partitioned;

    #[async_trait]
    impl Transport for Partitioned {
        async fn request_vote(
            &self,
            target: &NodeId,
            _req: RequestVoteRequest,
        ) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable(
                target.clone(),
                "partitioned".into(),
            ))
        }

        async fn append_entries(
            &self,
            target: &NodeId,
            _req: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable(
                target.clone(),
                "partitioned".into(),
            ))
        }
    }

    /// Leader of term 1 in a three-node cluster whose followers never answer.
    fn cut_off_leader() -> RaftNode<BucketStore> {
        let peers = vec!["n2".to_string(), "n3".to_string()];
        let store = Box::new(MemoryLogStore::new());
        let mut node = RaftNode::new("n1".into(), peers, store, BucketStore::new()).unwrap();
        node.handle_election_timeout().unwrap();
        let granted = RequestVoteResponse {
            term: 1,
            vote_granted: true,
        };
        node.handle_vote_response("n2".into(), 1, granted).unwrap();
        assert_eq!(node.role(), NodeRole::Leader);
        let _ = node.take_ready();
        node
    }

    type Receiver = oneshot::Receiver<Result<KvResponse, RaftError>>;

    fn propose(server: &mut RaftServer<BucketStore, Partitioned>, command: &str) -> Receiver {
        let (reply, rx) = oneshot::channel();
        server.handle_event(Event::Propose {
            command: command.as_bytes().to_vec(),
            reply,
        });
        rx
    }

    #[tokio::test]
    async fn test_heartbeat_drops_abandoned_proposals() {
        let transport = Arc::new(Partitioned);
        let config = RaftConfig::default();
        let (mut server, _handle) = RaftServer::new(cut_off_leader(), transport, config);

        // the first caller gave up, as after a propose timeout
        drop(propose(&mut server, "SET b k 1"));
        let mut waiting = propose(&mut server, "SET b k 2");
        assert_eq!(server.pending.len(), 2);

        server.on_heartbeat();
        let pending: Vec<LogIndex> = server.pending.keys().copied().collect();
        assert_eq!(pending, vec![2]);
        assert!(waiting.try_recv().is_err());

        // losing leadership still fails the caller that is waiting
        let newer_leader = AppendEntriesRequest {
            term: 2,
            leader_id: "n2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let res = server.node.handle_append_entries(newer_leader).unwrap();
        assert!(res.success);
        server.process_ready();
        assert!(server.pending.is_empty());
        assert_eq!(
            waiting.try_recv().unwrap(),
            Err(RaftError::LeadershipLost { index: 2 })
        );
    }
}
