//! Frames exchanged between peers and with clients: a 4-byte big-endian
//! length followed by a bincode payload.

use bytes::{Buf, BufMut, BytesMut};
use nidus_common::error::{NidusError, Result};
use nidus_storage::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    /// A command line such as `SET bucket key value`.
    Client {
        command: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    Client(ClientReply),
    /// The node could not handle the request at all (halted, shut down).
    Error(String),
}

/// What a client gets back for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    /// Rendered state machine response: `OK`, a value, `NO_KEY`, ...
    Result(String),
    /// `host:port` of the current leader, when known.
    NotLeader {
        leader: Option<String>,
    },
    Failed(String),
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(NidusError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection
/// before starting a new frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = (&header[..]).get_u32() as usize;
    if len > MAX_FRAME_LEN {
        return Err(NidusError::Protocol(format!(
            "incoming frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
