//! State machine seam consumed by the client request pipeline.

use crate::server::LogIndex;
use crate::utils::LodestoneError;

/// Replicated application state machine interface.
///
/// `pre_commit` must be pure with respect to the replicated log ordering; the
/// buffer it returns is surfaced as the client response in async-replication
/// mode. `commit` is invoked once per entry in log-index order.
pub trait StateMachine: Send + Sync {
    /// Notifies the state machine that the entry at `log_index` is about to
    /// be committed. May return an opaque buffer for the client.
    fn pre_commit(
        &self,
        log_index: LogIndex,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, LodestoneError>;

    /// Applies the entry at `log_index`. May return an opaque buffer for the
    /// client.
    fn commit(
        &self,
        log_index: LogIndex,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, LodestoneError>;
}

/// Trivial state machine that echoes each payload back as its result buffer.
pub struct EchoStateMachine;

impl StateMachine for EchoStateMachine {
    fn pre_commit(
        &self,
        _log_index: LogIndex,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, LodestoneError> {
        Ok(Some(payload.to_vec()))
    }

    fn commit(
        &self,
        _log_index: LogIndex,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, LodestoneError> {
        Ok(Some(payload.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_pre_commit_and_commit() -> Result<(), LodestoneError> {
        let sm = EchoStateMachine;
        assert_eq!(sm.pre_commit(1, b"hi")?, Some(b"hi".to_vec()));
        assert_eq!(sm.commit(1, b"hi")?, Some(b"hi".to_vec()));
        Ok(())
    }
}
