//! User callback seam invoked from the client request pipeline.

use crate::server::{LogEntry, LogIndex, ReplicaId};

/// Verdict returned by a user callback.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CbReturn {
    /// Continue normal processing.
    Ok,

    /// Abort the response; the caller shall not send a reply.
    ReturnNull,
}

/// Type-specific context handed to a callback.
#[derive(Debug)]
pub enum CbContext<'a> {
    /// The log entry being processed (mutable; the callback may rewrite it).
    Entry(&'a mut LogEntry),

    /// The last log index of a finished append batch.
    LastIndex(LogIndex),
}

/// Parameter bundle passed to every callback invocation.
#[derive(Debug)]
pub struct CbParams<'a> {
    /// This server's ID.
    pub my_id: ReplicaId,

    /// Current known leader ID.
    pub leader_id: ReplicaId,

    /// Type-specific context.
    pub ctx: CbContext<'a>,
}

/// Hooks the embedding application may implement to observe and steer the
/// leader-side append path. Default implementations continue processing.
pub trait EventCallbacks: Send + Sync {
    /// Invoked before each entry is stored on the leader.
    fn pre_append_log_leader(&self, _params: &mut CbParams<'_>) -> CbReturn {
        CbReturn::Ok
    }

    /// Invoked when storing an entry failed.
    fn append_log_failed(&self, _params: &mut CbParams<'_>) -> CbReturn {
        CbReturn::Ok
    }

    /// Invoked after a whole batch has been appended and pre-committed.
    fn append_logs(&self, _params: &mut CbParams<'_>) -> CbReturn {
        CbReturn::Ok
    }
}

/// Callbacks implementation that observes nothing.
pub struct NoopCallbacks;

impl EventCallbacks for NoopCallbacks {}
