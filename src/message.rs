//! RPC messages and the binary wire protocol.
//!
//! Every peer connection carries a sequence of request/response pairs.
//! A request starts with one type byte, followed by a `u32`
//! length-prefixed big-endian body; a response is a length-prefixed
//! body alone, decoded against the request's type. The formats here are
//! the external contract of the replica: peers of any implementation
//! speaking this framing interoperate.

use std::io;

use raftforge_core::{LogIndex, NodeId, Term};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::entry::Entry;
use crate::membership::ClusterConfig;
use crate::wire::{corrupt, put_i64, put_u32, put_u64, put_u8, Reader};

/// RPC type byte for vote requests.
pub const RPC_VOTE: u8 = 1;
/// RPC type byte for append-entries requests.
pub const RPC_APPEND_ENTRIES: u8 = 2;
/// RPC type byte for install-snapshot requests.
pub const RPC_INSTALL_SNAPSHOT: u8 = 3;
/// RPC type byte for timeout-now requests.
pub const RPC_TIMEOUT_NOW: u8 = 4;

/// Upper bound on a message body; anything larger is treated as
/// corruption rather than an allocation request.
const MAX_BODY: u32 = 256 << 20;

/// Outcome carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcResult {
    /// Request accepted.
    Success,
    /// Request carried a stale term.
    StaleTerm,
    /// Vote denied: already voted for another candidate this term.
    AlreadyVoted,
    /// Vote denied: candidate's log is behind ours.
    LogNotUpToDate,
    /// Vote denied: a leader is already known for this term.
    LeaderKnown,
    /// Append denied: log does not match at `prev_log_index`.
    LogMismatch,
    /// Request could not be applied.
    Failed,
}

impl RpcResult {
    fn to_u8(self) -> u8 {
        match self {
            RpcResult::Success => 0,
            RpcResult::StaleTerm => 1,
            RpcResult::AlreadyVoted => 2,
            RpcResult::LogNotUpToDate => 3,
            RpcResult::LeaderKnown => 4,
            RpcResult::LogMismatch => 5,
            RpcResult::Failed => 6,
        }
    }

    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(RpcResult::Success),
            1 => Ok(RpcResult::StaleTerm),
            2 => Ok(RpcResult::AlreadyVoted),
            3 => Ok(RpcResult::LogNotUpToDate),
            4 => Ok(RpcResult::LeaderKnown),
            5 => Ok(RpcResult::LogMismatch),
            6 => Ok(RpcResult::Failed),
            _ => Err(corrupt("unknown rpc result")),
        }
    }
}

/// Vote request sent by candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteReq {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Vote response.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteResp {
    pub term: Term,
    pub result: RpcResult,
}

/// Append-entries request: replication and heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReq {
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub ldr_commit_index: LogIndex,
    pub entries: Vec<Entry>,
}

/// Append-entries response. `last_log_index` doubles as the catch-up
/// hint on rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendResp {
    pub term: Term,
    pub result: RpcResult,
    pub last_log_index: LogIndex,
}

/// Install-snapshot request. The configuration travels with its own log
/// position so the receiver can adopt it as both latest and committed.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallSnapshotReq {
    pub term: Term,
    pub leader: NodeId,
    pub last_index: LogIndex,
    pub last_term: Term,
    pub config: ClusterConfig,
    pub payload: Vec<u8>,
}

/// Install-snapshot response.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallSnapshotResp {
    pub term: Term,
    pub result: RpcResult,
}

/// Timeout-now request, sent during leadership transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutNowReq {
    pub term: Term,
    pub leader: NodeId,
}

/// Timeout-now response.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutNowResp {
    pub term: Term,
    pub result: RpcResult,
}

/// Closed sum of all requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Vote(VoteReq),
    Append(AppendReq),
    InstallSnapshot(InstallSnapshotReq),
    TimeoutNow(TimeoutNowReq),
}

/// Closed sum of all responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Vote(VoteResp),
    Append(AppendResp),
    InstallSnapshot(InstallSnapshotResp),
    TimeoutNow(TimeoutNowResp),
}

impl Request {
    /// Wire type byte of this request.
    pub fn rpc_type(&self) -> u8 {
        match self {
            Request::Vote(_) => RPC_VOTE,
            Request::Append(_) => RPC_APPEND_ENTRIES,
            Request::InstallSnapshot(_) => RPC_INSTALL_SNAPSHOT,
            Request::TimeoutNow(_) => RPC_TIMEOUT_NOW,
        }
    }

    /// Term the sender was in.
    pub fn term(&self) -> Term {
        match self {
            Request::Vote(r) => r.term,
            Request::Append(r) => r.term,
            Request::InstallSnapshot(r) => r.term,
            Request::TimeoutNow(r) => r.term,
        }
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            Request::Vote(r) => {
                put_u64(buf, r.term);
                put_u64(buf, r.candidate);
                put_u64(buf, r.last_log_index);
                put_u64(buf, r.last_log_term);
            }
            Request::Append(r) => {
                put_u64(buf, r.term);
                put_u64(buf, r.leader);
                put_u64(buf, r.prev_log_index);
                put_u64(buf, r.prev_log_term);
                put_u64(buf, r.ldr_commit_index);
                put_u32(buf, r.entries.len() as u32);
                for entry in &r.entries {
                    entry.encode(buf);
                }
            }
            Request::InstallSnapshot(r) => {
                put_u64(buf, r.term);
                put_u64(buf, r.leader);
                put_u64(buf, r.last_index);
                put_u64(buf, r.last_term);
                put_u64(buf, r.config.index);
                put_u64(buf, r.config.term);
                r.config.encode_nodes(buf);
                put_i64(buf, r.payload.len() as i64);
                buf.extend_from_slice(&r.payload);
            }
            Request::TimeoutNow(r) => {
                put_u64(buf, r.term);
                put_u64(buf, r.leader);
            }
        }
    }

    fn decode_body(rpc_type: u8, body: &[u8]) -> io::Result<Self> {
        let mut r = Reader::new(body);
        let req = match rpc_type {
            RPC_VOTE => Request::Vote(VoteReq {
                term: r.u64()?,
                candidate: r.u64()?,
                last_log_index: r.u64()?,
                last_log_term: r.u64()?,
            }),
            RPC_APPEND_ENTRIES => {
                let term = r.u64()?;
                let leader = r.u64()?;
                let prev_log_index = r.u64()?;
                let prev_log_term = r.u64()?;
                let ldr_commit_index = r.u64()?;
                let count = r.u32()?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    entries.push(Entry::decode(&mut r)?);
                }
                Request::Append(AppendReq {
                    term,
                    leader,
                    prev_log_index,
                    prev_log_term,
                    ldr_commit_index,
                    entries,
                })
            }
            RPC_INSTALL_SNAPSHOT => {
                let term = r.u64()?;
                let leader = r.u64()?;
                let last_index = r.u64()?;
                let last_term = r.u64()?;
                let config_index = r.u64()?;
                let config_term = r.u64()?;
                let config = ClusterConfig::decode_nodes(&mut r, config_index, config_term)?;
                let size = r.i64()?;
                if size < 0 {
                    return Err(corrupt("negative snapshot size"));
                }
                let payload = r.raw(size as usize)?.to_vec();
                Request::InstallSnapshot(InstallSnapshotReq {
                    term,
                    leader,
                    last_index,
                    last_term,
                    config,
                    payload,
                })
            }
            RPC_TIMEOUT_NOW => {
                Request::TimeoutNow(TimeoutNowReq { term: r.u64()?, leader: r.u64()? })
            }
            _ => return Err(corrupt("unknown rpc type")),
        };
        r.finish()?;
        Ok(req)
    }
}

impl Response {
    /// Term the responder was in.
    pub fn term(&self) -> Term {
        match self {
            Response::Vote(r) => r.term,
            Response::Append(r) => r.term,
            Response::InstallSnapshot(r) => r.term,
            Response::TimeoutNow(r) => r.term,
        }
    }

    /// Outcome code.
    pub fn result(&self) -> RpcResult {
        match self {
            Response::Vote(r) => r.result,
            Response::Append(r) => r.result,
            Response::InstallSnapshot(r) => r.result,
            Response::TimeoutNow(r) => r.result,
        }
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            Response::Vote(r) => {
                put_u64(buf, r.term);
                put_u8(buf, r.result.to_u8());
            }
            Response::Append(r) => {
                put_u64(buf, r.term);
                put_u8(buf, r.result.to_u8());
                put_u64(buf, r.last_log_index);
            }
            Response::InstallSnapshot(r) => {
                put_u64(buf, r.term);
                put_u8(buf, r.result.to_u8());
            }
            Response::TimeoutNow(r) => {
                put_u64(buf, r.term);
                put_u8(buf, r.result.to_u8());
            }
        }
    }

    fn decode_body(rpc_type: u8, body: &[u8]) -> io::Result<Self> {
        let mut r = Reader::new(body);
        let resp = match rpc_type {
            RPC_VOTE => Response::Vote(VoteResp {
                term: r.u64()?,
                result: RpcResult::from_u8(r.u8()?)?,
            }),
            RPC_APPEND_ENTRIES => Response::Append(AppendResp {
                term: r.u64()?,
                result: RpcResult::from_u8(r.u8()?)?,
                last_log_index: r.u64()?,
            }),
            RPC_INSTALL_SNAPSHOT => Response::InstallSnapshot(InstallSnapshotResp {
                term: r.u64()?,
                result: RpcResult::from_u8(r.u8()?)?,
            }),
            RPC_TIMEOUT_NOW => Response::TimeoutNow(TimeoutNowResp {
                term: r.u64()?,
                result: RpcResult::from_u8(r.u8()?)?,
            }),
            _ => return Err(corrupt("unknown rpc type")),
        };
        r.finish()?;
        Ok(resp)
    }
}

async fn read_body<R: AsyncRead + Unpin>(conn: &mut R) -> io::Result<Vec<u8>> {
    let len = conn.read_u32().await?;
    if len > MAX_BODY {
        return Err(corrupt("oversized body"));
    }
    let mut body = vec![0u8; len as usize];
    conn.read_exact(&mut body).await?;
    Ok(body)
}

/// Read one framed request.
pub async fn read_request<R: AsyncRead + Unpin>(conn: &mut R) -> io::Result<Request> {
    let rpc_type = conn.read_u8().await?;
    let body = read_body(conn).await?;
    Request::decode_body(rpc_type, &body)
}

/// Write one framed request.
pub async fn write_request<W: AsyncWrite + Unpin>(conn: &mut W, req: &Request) -> io::Result<()> {
    let mut body = Vec::new();
    req.encode_body(&mut body);
    let mut frame = Vec::with_capacity(5 + body.len());
    put_u8(&mut frame, req.rpc_type());
    put_u32(&mut frame, body.len() as u32);
    frame.extend_from_slice(&body);
    conn.write_all(&frame).await?;
    conn.flush().await
}

/// Read one framed response to a request of the given type.
pub async fn read_response<R: AsyncRead + Unpin>(conn: &mut R, rpc_type: u8) -> io::Result<Response> {
    let body = read_body(conn).await?;
    Response::decode_body(rpc_type, &body)
}

/// Write one framed response.
pub async fn write_response<W: AsyncWrite + Unpin>(conn: &mut W, resp: &Response) -> io::Result<()> {
    let mut body = Vec::new();
    resp.encode_body(&mut body);
    let mut frame = Vec::with_capacity(4 + body.len());
    put_u32(&mut frame, body.len() as u32);
    frame.extend_from_slice(&body);
    conn.write_all(&frame).await?;
    conn.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Node;

    async fn request_roundtrip(req: Request) -> Request {
        let mut buf = Vec::new();
        write_request(&mut buf, &req).await.unwrap();
        let mut cursor: &[u8] = &buf;
        read_request(&mut cursor).await.unwrap()
    }

    async fn response_roundtrip(resp: Response, rpc_type: u8) -> Response {
        let mut buf = Vec::new();
        write_response(&mut buf, &resp).await.unwrap();
        let mut cursor: &[u8] = &buf;
        read_response(&mut cursor, rpc_type).await.unwrap()
    }

    #[tokio::test]
    async fn test_vote_roundtrip() {
        let req = Request::Vote(VoteReq {
            term: 4,
            candidate: 2,
            last_log_index: 17,
            last_log_term: 3,
        });
        assert_eq!(request_roundtrip(req.clone()).await, req);

        let resp = Response::Vote(VoteResp { term: 4, result: RpcResult::LeaderKnown });
        assert_eq!(response_roundtrip(resp.clone(), RPC_VOTE).await, resp);
    }

    #[tokio::test]
    async fn test_append_roundtrip() {
        let req = Request::Append(AppendReq {
            term: 2,
            leader: 1,
            prev_log_index: 8,
            prev_log_term: 2,
            ldr_commit_index: 7,
            entries: vec![Entry::noop(9, 2), Entry::user(10, 2, b"payload".to_vec())],
        });
        assert_eq!(request_roundtrip(req.clone()).await, req);

        let resp = Response::Append(AppendResp {
            term: 2,
            result: RpcResult::Success,
            last_log_index: 10,
        });
        assert_eq!(response_roundtrip(resp.clone(), RPC_APPEND_ENTRIES).await, resp);
    }

    #[tokio::test]
    async fn test_install_snapshot_roundtrip() {
        let mut config = ClusterConfig::new([Node::voter(1, "a:7000"), Node::voter(2, "b:7000")]);
        config.index = 5;
        config.term = 2;
        let req = Request::InstallSnapshot(InstallSnapshotReq {
            term: 3,
            leader: 1,
            last_index: 12,
            last_term: 2,
            config,
            payload: vec![9u8; 1024],
        });
        assert_eq!(request_roundtrip(req.clone()).await, req);
    }

    #[tokio::test]
    async fn test_timeout_now_roundtrip() {
        let req = Request::TimeoutNow(TimeoutNowReq { term: 6, leader: 3 });
        assert_eq!(request_roundtrip(req.clone()).await, req);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 42);
        put_u32(&mut buf, 0);
        let mut cursor: &[u8] = &buf;
        assert!(read_request(&mut cursor).await.is_err());
    }
}
