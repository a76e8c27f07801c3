use crate::tcp::{serve, TcpTransport};
use nidus_common::error::{NidusError, Result};
use nidus_common::types::{ClusterConfig, NodeId};
use nidus_storage::raft::config::RaftConfig;
use nidus_storage::raft::kv::{BucketStore, KvResponse};
use nidus_storage::raft::node::RaftNode;
use nidus_storage::raft::server::{RaftHandle, RaftServer};
use nidus_storage::raft::storage::FileLogStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

/// A node hosted by this process: its event loop and its TCP listener.
pub struct RunningNode {
    pub id: NodeId,
    pub handle: RaftHandle<KvResponse>,
    pub local_addr: SocketAddr,
    listener: JoinHandle<()>,
}

impl RunningNode {
    /// Stops accepting connections, then stops the event loop.
    pub async fn shutdown(self) {
        self.listener.abort();
        self.handle.shutdown().await;
        info!(node = %self.id, "node stopped");
    }
}

/// Binds the address configured for `id` and starts the node.
pub async fn start_node(id: &str, cluster: Arc<ClusterConfig>) -> Result<RunningNode> {
    let addr = cluster
        .address_of(id)
        .ok_or_else(|| not_in_cluster(id))?
        .socket_addr();
    let listener = TcpListener::bind(&addr).await?;
    start_node_on(id, cluster, listener)
}

/// Starts node `id` on an already bound listener, with its store under
/// `<data_dir>/<id>`.
pub fn start_node_on(
    id: &str,
    cluster: Arc<ClusterConfig>,
    listener: TcpListener,
) -> Result<RunningNode> {
    if !cluster.contains(id) {
        return Err(not_in_cluster(id));
    }

    let store = FileLogStore::open(cluster.node_data_dir(id))?;
    let node = RaftNode::new(
        id.to_string(),
        cluster.peers_of(id),
        Box::new(store),
        BucketStore::new(),
    )?;
    let transport = Arc::new(TcpTransport::new(cluster.clone()));
    let handle = RaftServer::spawn(node, transport, RaftConfig::from(cluster.as_ref()));

    let local_addr = listener.local_addr()?;
    let accept_loop = {
        let handle = handle.clone();
        let cluster = cluster.clone();
        async move {
            if let Err(err) = serve(listener, handle, cluster).await {
                error!(error = %err, "listener failed");
            }
        }
    };
    let listener = tokio::spawn(accept_loop.instrument(info_span!("node", id = %id)));
    info!(node = %id, addr = %local_addr, "node listening");

    Ok(RunningNode {
        id: id.to_string(),
        handle,
        local_addr,
        listener,
    })
}

fn not_in_cluster(id: &str) -> NidusError {
    NidusError::Config(format!("node {} is not in the cluster config", id))
}
