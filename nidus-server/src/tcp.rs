use crate::wire::{read_frame, write_frame, ClientReply, Request, Response};
use async_trait::async_trait;
use nidus_common::error::Result;
use nidus_common::types::{ClusterConfig, NodeId};
use nidus_storage::raft::error::RaftError;
use nidus_storage::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use nidus_storage::raft::server::RaftHandle;
use nidus_storage::raft::transport::{Transport, TransportError};
use std::fmt::Display;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, Instrument};

/// Peer transport over TCP: one short-lived connection per RPC.
pub struct TcpTransport {
    cluster: Arc<ClusterConfig>,
}

impl TcpTransport {
    pub fn new(cluster: Arc<ClusterConfig>) -> Self {
        Self { cluster }
    }

    async fn call(
        &self,
        target: &NodeId,
        request: Request,
    ) -> std::result::Result<Response, TransportError> {
        let addr = self
            .cluster
            .address_of(target)
            .ok_or_else(|| TransportError::UnknownPeer(target.clone()))?
            .socket_addr();
        let unreachable =
            |e: &dyn Display| TransportError::Unreachable(target.clone(), e.to_string());

        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| unreachable(&e))?;
        write_frame(&mut stream, &request)
            .await
            .map_err(|e| unreachable(&e))?;
        match read_frame(&mut stream).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(unreachable(&"connection closed before reply")),
            Err(e) => Err(unreachable(&e)),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        req: RequestVoteRequest,
    ) -> std::result::Result<RequestVoteResponse, TransportError> {
        match self.call(target, Request::RequestVote(req)).await? {
            Response::RequestVote(res) => Ok(res),
            Response::Error(msg) => Err(TransportError::Remote(target.clone(), msg)),
            other => Err(TransportError::Remote(
                target.clone(),
                format!("unexpected response: {:?}", other),
            )),
        }
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
    ) -> std::result::Result<AppendEntriesResponse, TransportError> {
        match self.call(target, Request::AppendEntries(req)).await? {
            Response::AppendEntries(res) => Ok(res),
            Response::Error(msg) => Err(TransportError::Remote(target.clone(), msg)),
            other => Err(TransportError::Remote(
                target.clone(),
                format!("unexpected response: {:?}", other),
            )),
        }
    }
}

/// Accepts peer and client connections and feeds them to `handle`.
///
/// Runs until the listener fails; abort the task to stop it.
pub async fn serve<R>(
    listener: TcpListener,
    handle: RaftHandle<R>,
    cluster: Arc<ClusterConfig>,
) -> Result<()>
where
    R: Display + Send + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        let cluster = cluster.clone();
        let conn = async move {
            if let Err(err) = handle_connection(stream, handle, cluster).await {
                debug!(%peer, error = %err, "connection dropped");
            }
        };
        tokio::spawn(conn.in_current_span());
    }
}

/// A connection may carry any number of request frames, answered in order.
async fn handle_connection<R>(
    mut stream: TcpStream,
    handle: RaftHandle<R>,
    cluster: Arc<ClusterConfig>,
) -> Result<()>
where
    R: Display + Send + 'static,
{
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let response = dispatch(request, &handle, &cluster).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

async fn dispatch<R>(request: Request, handle: &RaftHandle<R>, cluster: &ClusterConfig) -> Response
where
    R: Display + Send + 'static,
{
    match request {
        Request::RequestVote(req) => match handle.request_vote(req).await {
            Ok(res) => Response::RequestVote(res),
            Err(err) => Response::Error(err.to_string()),
        },
        Request::AppendEntries(req) => match handle.append_entries(req).await {
            Ok(res) => Response::AppendEntries(res),
            Err(err) => Response::Error(err.to_string()),
        },
        Request::Client { command } => {
            debug!(%command, "client command");
            let result = handle.propose(command.into_bytes()).await;
            Response::Client(client_reply(result, cluster))
        }
    }
}

fn client_reply<R: Display>(
    result: std::result::Result<R, RaftError>,
    cluster: &ClusterConfig,
) -> ClientReply {
    match result {
        Ok(response) => ClientReply::Result(response.to_string()),
        Err(RaftError::NotLeader { leader_hint }) => ClientReply::NotLeader {
            leader: leader_hint
                .as_deref()
                .and_then(|id| cluster.address_of(id))
                .map(|addr| addr.socket_addr()),
        },
        Err(err) => ClientReply::Failed(err.to_string()),
    }
}
