//! Request/response message model shared by the client entrance and the
//! peer-peer RPC path.

use get_size::GetSize;
use serde::{Deserialize, Serialize};

use crate::utils::LodestoneError;

/// Election term number type, defined for better code readability.
pub type Term = u64;

/// Log slot index type.
pub type LogIndex = u64;

/// Server replica ID type.
pub type ReplicaId = u8;

/// Kind of payload carried by a log entry.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, GetSize,
)]
pub enum EntryType {
    /// Normal application data.
    AppData,

    /// Cluster configuration change.
    Configuration,

    /// User-defined payload outside the replicated application state.
    Custom,
}

/// In-mem + on-wire log entry. Assigned a monotonically increasing log index
/// upon store; immutable afterwards. The leader rewrites `term` and
/// `timestamp_us` before storing.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct LogEntry {
    /// Term number the entry was created in.
    pub term: Term,

    /// Microsecond timestamp sampled by the leader at append time.
    pub timestamp_us: u64,

    /// Opaque application payload.
    pub payload: Vec<u8>,

    /// Payload kind.
    pub entry_type: EntryType,
}

impl LogEntry {
    /// Creates a normal application-data entry; term and timestamp are
    /// filled in by the leader at append time.
    pub fn app_data(payload: Vec<u8>) -> Self {
        LogEntry {
            term: 0,
            timestamp_us: 0,
            payload,
            entry_type: EntryType::AppData,
        }
    }
}

/// Peer-peer and client-facing message types.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, GetSize,
)]
pub enum MsgType {
    AppendEntriesRequest,
    AppendEntriesResponse,
    RequestVoteRequest,
    RequestVoteResponse,
    PreVoteRequest,
    PreVoteResponse,
    InstallSnapshotRequest,
    InstallSnapshotResponse,
    LeaveClusterRequest,
    LeaveClusterResponse,
    CustomNotificationRequest,
    CustomNotificationResponse,
    ReconnectRequest,
    ReconnectResponse,
    PriorityChangeRequest,
    PriorityChangeResponse,
    LeaderStatusRequest,
    LeaderStatusResponse,
}

/// Result codes surfaced at the API boundary.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, GetSize,
)]
pub enum ResultCode {
    Ok,
    NotLeader,
    TermMismatch,
    Timeout,
    Cancelled,
}

/// Request message sent to a peer (or carried by a client entrance call).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct ReqMsg {
    /// Message type.
    pub msg_type: MsgType,

    /// Sender's current term.
    pub term: Term,

    /// Sender replica ID.
    pub src: ReplicaId,

    /// Destination replica ID.
    pub dst: ReplicaId,

    /// Index of the log entry immediately preceding `entries`.
    pub last_log_index: LogIndex,

    /// Term of the entry at `last_log_index`.
    pub last_log_term: Term,

    /// Sender's commit index.
    pub commit_index: LogIndex,

    /// Entries to replicate; empty for heartbeats.
    pub entries: Vec<LogEntry>,
}

impl ReqMsg {
    /// Sum of entry payload sizes carried by this request.
    pub fn payload_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.payload.len() as u64).sum()
    }
}

/// Response message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct RespMsg {
    /// Message type.
    pub msg_type: MsgType,

    /// Responder's current term.
    pub term: Term,

    /// Responder replica ID.
    pub src: ReplicaId,

    /// Destination replica ID.
    pub dst: ReplicaId,

    /// True if the request was accepted.
    pub accepted: bool,

    /// Next log index the responder expects (meaningful iff `accepted`).
    pub accepted_index: LogIndex,

    /// Result code of the operation.
    pub result_code: ResultCode,

    /// Optional opaque context buffer.
    pub ctx: Option<Vec<u8>>,
}

impl RespMsg {
    /// Creates a fresh (not yet accepted) response of the given type.
    pub fn new(
        msg_type: MsgType,
        term: Term,
        src: ReplicaId,
        dst: ReplicaId,
    ) -> Self {
        RespMsg {
            msg_type,
            term,
            src,
            dst,
            accepted: false,
            accepted_index: 0,
            result_code: ResultCode::Ok,
            ctx: None,
        }
    }

    /// Marks the response accepted with the given next expected index.
    pub fn accept(&mut self, next_index: LogIndex) {
        self.accepted = true;
        self.accepted_index = next_index;
    }
}

/// Decodes a leader-status response payload: an 8-byte current term followed
/// by an 8-byte state machine commit index, both big-endian.
pub fn decode_leader_status(
    ctx: &[u8],
) -> Result<(Term, LogIndex), LodestoneError> {
    if ctx.len() != 16 {
        return Err(LodestoneError::msg(format!(
            "invalid leader status payload length {}",
            ctx.len()
        )));
    }
    let term = u64::from_be_bytes(ctx[..8].try_into().unwrap());
    let commit_index = u64::from_be_bytes(ctx[8..].try_into().unwrap());
    Ok((term, commit_index))
}

/// Encodes a leader-status response payload in big-endian byte order.
pub(crate) fn encode_leader_status(
    term: Term,
    commit_index: LogIndex,
) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(16);
    ctx.extend_from_slice(&term.to_be_bytes());
    ctx.extend_from_slice(&commit_index.to_be_bytes());
    ctx
}
