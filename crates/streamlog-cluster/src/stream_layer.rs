//! Connection multiplexing and framing for consensus traffic.
//!
//! Every node has exactly one TCP listener. The first byte of an inbound
//! connection routes it: [`RAFT_RPC`] hands the connection (sentinel
//! consumed) to the consensus transport, anything else goes to the gRPC
//! server. Outbound consensus dials write the sentinel before anything
//! else. gRPC traffic can never collide with the sentinel - an HTTP/2
//! preface or TLS ClientHello never starts with `0x01`.
//!
//! After the sentinel, consensus messages are framed as
//! `[u32 big-endian length][JSON body]`, one request and one response per
//! frame, connections reused across calls.

use std::io;

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::types::{NodeId, TypeConfig};

/// First-byte sentinel that marks a connection as consensus traffic.
pub const RAFT_RPC: u8 = 1;

/// Upper bound on a single frame; a frame mostly carries one batch of
/// log entries or one snapshot chunk.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A consensus request as carried on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// A consensus response as carried on the wire. Remote handler failures
/// travel back as messages rather than structured errors; the caller
/// surfaces them as network faults.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RaftResponse {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Error(String),
}

/// Dial a peer's stream layer: connect and identify the connection as
/// consensus traffic.
pub(crate) async fn dial(addr: &str) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&[RAFT_RPC]).await?;
    Ok(stream)
}

pub(crate) async fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) -> io::Result<()> {
    let body =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

pub(crate) async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_writes_sentinel_then_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut sentinel = [0u8; 1];
            stream.read_exact(&mut sentinel).await.expect("sentinel");
            assert_eq!(sentinel[0], RAFT_RPC);

            let request: RaftRequest = read_frame(&mut stream).await.expect("read frame");
            assert!(matches!(request, RaftRequest::Vote(_)));
            write_frame(&mut stream, &RaftResponse::Error("nope".to_string()))
                .await
                .expect("write frame");
        });

        let mut stream = dial(&addr.to_string()).await.expect("dial");
        let vote = VoteRequest {
            vote: openraft::Vote::new(1, 7),
            last_log_id: None,
        };
        write_frame(&mut stream, &RaftRequest::Vote(vote))
            .await
            .expect("write frame");
        let response: RaftResponse = read_frame(&mut stream).await.expect("read frame");
        assert!(matches!(response, RaftResponse::Error(msg) if msg == "nope"));

        server.await.expect("server task");
    }
}
