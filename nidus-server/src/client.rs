use crate::wire::{read_frame, write_frame, ClientReply, Request, Response};
use nidus_common::error::{NidusError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;

/// Sends one command line to the node at `addr` and waits for its reply.
///
/// The whole exchange (connect, send, commit, reply) is bounded by `timeout`.
pub async fn send_command(addr: &str, command: &str, timeout: Duration) -> Result<ClientReply> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        let request = Request::Client {
            command: command.to_string(),
        };
        write_frame(&mut stream, &request).await?;

        match read_frame(&mut stream).await? {
            Some(Response::Client(reply)) => Ok(reply),
            Some(Response::Error(msg)) => Ok(ClientReply::Failed(msg)),
            Some(other) => Err(NidusError::Protocol(format!(
                "unexpected reply to a client command: {:?}",
                other
            ))),
            None => Err(NidusError::Protocol(
                "connection closed before a reply".into(),
            )),
        }
    };

    match time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(NidusError::Timeout(format!("no reply from {}", addr))),
    }
}
