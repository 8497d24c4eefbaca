//! Commit waiters: per-log-index synchronization objects bridging the client
//! request handler and the commit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

use crate::server::{LogIndex, ResultCode, ReturnMethod};

/// One-shot result holder for the async-handler return method. Fulfilled by
/// the commit path (or cancellation); awaited by the embedding application.
#[derive(Debug)]
pub struct AsyncResult {
    /// `Some` once fulfilled: (result buffer, result code, error string).
    state: Mutex<Option<(Option<Vec<u8>>, ResultCode, Option<String>)>>,

    /// Fulfillment signal.
    notify: Notify,
}

impl AsyncResult {
    fn new() -> Arc<Self> {
        Arc::new(AsyncResult {
            state: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// Fulfills the result. Later calls overwrite earlier ones; waiters are
    /// woken either way.
    pub(crate) fn set(
        &self,
        value: Option<Vec<u8>>,
        code: ResultCode,
        err: Option<String>,
    ) {
        *self.state.lock().unwrap() = Some((value, code, err));
        self.notify.notify_one();
    }

    /// Waits until fulfilled and returns (result buffer, result code, error
    /// string).
    pub async fn get(&self) -> (Option<Vec<u8>>, ResultCode, Option<String>) {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.state.lock().unwrap().clone() {
                return result;
            }
            notified.await;
        }
    }

    /// True if already fulfilled.
    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

/// Mutable interior of a commit waiter, guarded by its own short-lived lock.
#[derive(Debug)]
struct WaiterState {
    /// Result code; `Timeout` doubles as the "not yet resolved" sentinel and
    /// as the "client abandoned it" signal after the callback ran.
    result_code: ResultCode,

    /// Opaque result buffer from the commit path.
    ret_value: Option<Vec<u8>>,

    /// Set once the client-side blocking callback has run.
    callback_invoked: bool,

    /// Present only in async-handler mode, created lazily on attach.
    async_result: Option<Arc<AsyncResult>>,
}

/// Per-log-index synchronization object. Created by the client handler (or
/// pre-installed by the commit path if it gets there first); destroyed by
/// whichever of the two touches it last.
#[derive(Debug)]
pub struct CommitWaiter {
    /// Log index this waiter is keyed by.
    log_idx: LogIndex,

    /// Creation instant, for elapsed-time reporting.
    created_at: Instant,

    state: Mutex<WaiterState>,

    /// One-shot wakeup event with timed wait. A stored permit makes
    /// fire-before-wait safe.
    awaiter: Notify,
}

impl CommitWaiter {
    fn new(log_idx: LogIndex) -> Arc<Self> {
        Arc::new(CommitWaiter {
            log_idx,
            created_at: Instant::now(),
            state: Mutex::new(WaiterState {
                result_code: ResultCode::Timeout,
                ret_value: None,
                callback_invoked: false,
                async_result: None,
            }),
            awaiter: Notify::new(),
        })
    }

    /// Log index this waiter is keyed by.
    pub fn log_idx(&self) -> LogIndex {
        self.log_idx
    }

    /// Microseconds since this waiter was created.
    pub(crate) fn elapsed_us(&self) -> u64 {
        self.created_at.elapsed().as_micros() as u64
    }

    /// Current result code.
    pub fn result_code(&self) -> ResultCode {
        self.state.lock().unwrap().result_code
    }

    /// Wakes anyone blocked in `wait_ms`.
    pub(crate) fn fire(&self) {
        self.awaiter.notify_one();
    }

    /// Blocks for up to `ms` millisecs or until fired, whichever is first.
    pub(crate) async fn wait_ms(&self, ms: u64) {
        let _ = timeout(Duration::from_millis(ms), self.awaiter.notified())
            .await;
    }
}

/// Keyed table of outstanding synchronous client waiters, indexed by
/// assigned log index. Keys are unique; protected by a dedicated lock that
/// is never held across user callbacks or event waits.
#[derive(Debug, Default)]
pub struct CommitWaiterRegistry {
    elems: Mutex<HashMap<LogIndex, Arc<CommitWaiter>>>,
}

impl CommitWaiterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        CommitWaiterRegistry {
            elems: Mutex::new(HashMap::new()),
        }
    }

    /// Number of outstanding waiters.
    pub fn len(&self) -> usize {
        self.elems.lock().unwrap().len()
    }

    /// True if no waiters are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a waiter for the given index is outstanding.
    pub fn contains(&self, log_idx: LogIndex) -> bool {
        self.elems.lock().unwrap().contains_key(&log_idx)
    }

    /// Registers a fresh waiter for the given index, or adopts the existing
    /// one if the commit path pre-installed it.
    pub(crate) fn register(&self, log_idx: LogIndex) -> Arc<CommitWaiter> {
        let mut elems = self.elems.lock().unwrap();
        if let Some(elem) = elems.get(&log_idx) {
            pf_trace!("commit path was faster for log_idx {}", log_idx);
            elem.clone()
        } else {
            let elem = CommitWaiter::new(log_idx);
            elems.insert(log_idx, elem.clone());
            elem
        }
    }

    /// Attaches (lazily creating) the async result object to a waiter for
    /// the async-handler return method. If the waiter was already resolved
    /// by the commit path, the result is fulfilled and the waiter removed
    /// here.
    pub(crate) fn attach_async(
        &self,
        elem: &Arc<CommitWaiter>,
    ) -> Arc<AsyncResult> {
        let (async_result, resolved) = {
            let mut elems = self.elems.lock().unwrap();
            let mut state = elem.state.lock().unwrap();
            let async_result = state
                .async_result
                .get_or_insert_with(AsyncResult::new)
                .clone();
            let resolved = if state.result_code != ResultCode::Timeout {
                elems.remove(&elem.log_idx);
                Some((state.ret_value.clone(), state.result_code))
            } else {
                None
            };
            (async_result, resolved)
        };

        if let Some((value, code)) = resolved {
            async_result.set(value, code, None);
        }
        async_result
    }

    /// Client-side blocking resolution bookkeeping, run after the timed wait
    /// on the waiter's event. Marks the callback invoked and removes the
    /// waiter unless it timed out (in which case the commit path removes it
    /// later). Returns (log index, elapsed micros, result value, result
    /// code).
    pub(crate) fn finalize_blocking(
        &self,
        elem: &Arc<CommitWaiter>,
    ) -> (LogIndex, u64, Option<Vec<u8>>, ResultCode) {
        let mut elems = self.elems.lock().unwrap();
        let mut state = elem.state.lock().unwrap();
        state.callback_invoked = true;
        let code = state.result_code;
        let value = state.ret_value.clone();
        drop(state);

        if code != ResultCode::Timeout {
            elems.remove(&elem.log_idx);
        } else {
            pf_debug!(
                "client timeout, leave commit path to remove waiter {}",
                elem.log_idx
            );
        }
        pf_debug!("remaining elems in waiting queue: {}", elems.len());

        (elem.log_idx, elem.elapsed_us(), value, code)
    }

    /// Commit-path resolution of the waiter at `log_idx`. Pre-installs a
    /// waiter if the client handler has not registered one yet. Removal
    /// follows the return method: in blocking mode the waiter is removed
    /// here only if the client callback already gave up on it; in
    /// async-handler mode the waiter is removed and its async result
    /// fulfilled (outside the registry lock).
    pub(crate) fn fulfill(
        &self,
        log_idx: LogIndex,
        code: ResultCode,
        value: Option<Vec<u8>>,
        return_method: ReturnMethod,
    ) {
        let mut elems = self.elems.lock().unwrap();
        let elem = elems
            .entry(log_idx)
            .or_insert_with(|| CommitWaiter::new(log_idx))
            .clone();

        match return_method {
            ReturnMethod::Blocking => {
                let mut state = elem.state.lock().unwrap();
                state.ret_value = value;
                state.result_code = code;
                let invoked = state.callback_invoked;
                drop(state);

                if invoked {
                    elems.remove(&log_idx);
                }
                elem.fire();
            }
            ReturnMethod::AsyncHandler => {
                let async_result = {
                    let mut state = elem.state.lock().unwrap();
                    state.ret_value = value.clone();
                    state.result_code = code;
                    state.async_result.clone()
                };

                if let Some(async_result) = async_result {
                    elems.remove(&log_idx);
                    drop(elems);
                    async_result.set(value, code, None);
                } else {
                    // commit path got here before the client handler; leave
                    // the resolved waiter for the handler to adopt
                    elem.fire();
                }
            }
        }
    }

    /// Drains all pending waiters to `CANCELLED`, called on loss of
    /// leadership or shutdown. In blocking mode every waiter's event is
    /// fired under the registry lock; in async-handler mode the async
    /// results are fulfilled outside the lock because the embedding
    /// application may re-enter the server from its continuation.
    pub fn drop_all_pending(&self, return_method: ReturnMethod) {
        match return_method {
            ReturnMethod::Blocking => {
                let mut elems = self.elems.lock().unwrap();
                let mut min_idx = LogIndex::MAX;
                let mut max_idx = 0;
                for elem in elems.values() {
                    let mut state = elem.state.lock().unwrap();
                    state.ret_value = None;
                    state.result_code = ResultCode::Cancelled;
                    drop(state);
                    elem.fire();

                    min_idx = std::cmp::min(min_idx, elem.log_idx);
                    max_idx = std::cmp::max(max_idx, elem.log_idx);
                    pf_debug!(
                        "cancelled blocking client request {}, waited {} us",
                        elem.log_idx,
                        elem.elapsed_us()
                    );
                }
                if !elems.is_empty() {
                    pf_warn!(
                        "cancelled {} blocking client requests from {} to {}",
                        elems.len(),
                        min_idx,
                        max_idx
                    );
                }
                elems.clear();
            }
            ReturnMethod::AsyncHandler => {
                let drained: Vec<Arc<CommitWaiter>> = {
                    let mut elems = self.elems.lock().unwrap();
                    let drained = elems.values().cloned().collect();
                    elems.clear();
                    drained
                };

                for elem in drained {
                    pf_warn!(
                        "cancelled non-blocking client request {}",
                        elem.log_idx
                    );
                    let async_result = {
                        let mut state = elem.state.lock().unwrap();
                        state.ret_value = None;
                        state.result_code = ResultCode::Cancelled;
                        state.async_result.clone()
                    };
                    if let Some(async_result) = async_result {
                        async_result.set(
                            None,
                            ResultCode::Cancelled,
                            Some("request cancelled".into()),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn register_is_unique_per_index() {
        let registry = CommitWaiterRegistry::new();
        let a = registry.register(5);
        let b = registry.register(5);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_resolved_before_wait() {
        let registry = CommitWaiterRegistry::new();
        let elem = registry.register(3);
        registry.fulfill(
            3,
            ResultCode::Ok,
            Some(b"hi".to_vec()),
            ReturnMethod::Blocking,
        );

        // event already fired, wait returns immediately
        elem.wait_ms(5_000).await;
        let (idx, _elapsed, value, code) = registry.finalize_blocking(&elem);
        assert_eq!(idx, 3);
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(value, Some(b"hi".to_vec()));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_timeout_leaves_elem_for_commit_path() {
        let registry = CommitWaiterRegistry::new();
        let elem = registry.register(9);

        elem.wait_ms(20).await;
        let (_, _, value, code) = registry.finalize_blocking(&elem);
        assert_eq!(code, ResultCode::Timeout);
        assert_eq!(value, None);
        assert!(registry.contains(9));

        // commit path arrives late and cleans up
        registry.fulfill(9, ResultCode::Ok, None, ReturnMethod::Blocking);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_all_wakes_blocked_waiters() {
        let registry = Arc::new(CommitWaiterRegistry::new());
        let elem = registry.register(4);

        let registry_ref = registry.clone();
        let waiter = tokio::spawn(async move {
            elem.wait_ms(60_000).await;
            registry_ref.finalize_blocking(&elem)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.drop_all_pending(ReturnMethod::Blocking);

        let (_, _, value, code) = waiter.await.unwrap();
        assert_eq!(code, ResultCode::Cancelled);
        assert_eq!(value, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn drop_all_twice_is_idempotent() {
        let registry = CommitWaiterRegistry::new();
        registry.register(1);
        registry.register(2);
        registry.drop_all_pending(ReturnMethod::Blocking);
        assert!(registry.is_empty());
        registry.drop_all_pending(ReturnMethod::Blocking);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_handler_fulfillment() {
        let registry = CommitWaiterRegistry::new();
        let elem = registry.register(7);
        let async_result = registry.attach_async(&elem);
        assert!(!async_result.is_set());

        registry.fulfill(
            7,
            ResultCode::Ok,
            Some(b"val".to_vec()),
            ReturnMethod::AsyncHandler,
        );
        let (value, code, err) = async_result.get().await;
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(value, Some(b"val".to_vec()));
        assert!(err.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_handler_commit_path_faster() {
        let registry = CommitWaiterRegistry::new();
        registry.fulfill(
            2,
            ResultCode::Ok,
            Some(b"pre".to_vec()),
            ReturnMethod::AsyncHandler,
        );
        assert!(registry.contains(2));

        // client handler arrives late, adopts the resolved waiter
        let elem = registry.register(2);
        let async_result = registry.attach_async(&elem);
        let (value, code, _) = async_result.get().await;
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(value, Some(b"pre".to_vec()));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_handler_drop_all() {
        let registry = CommitWaiterRegistry::new();
        let elem = registry.register(11);
        let async_result = registry.attach_async(&elem);

        registry.drop_all_pending(ReturnMethod::AsyncHandler);
        let (value, code, err) = async_result.get().await;
        assert_eq!(code, ResultCode::Cancelled);
        assert_eq!(value, None);
        assert!(err.is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_once_removal_under_races() {
        let registry = Arc::new(CommitWaiterRegistry::new());
        let mut handles = Vec::new();

        for idx in 1..=50u64 {
            let elem = registry.register(idx);
            let registry_ref = registry.clone();
            handles.push(tokio::spawn(async move {
                elem.wait_ms(2_000).await;
                registry_ref.finalize_blocking(&elem)
            }));

            let registry_ref = registry.clone();
            let jitter: u64 = rand::thread_rng().gen_range(0..10);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                registry_ref.fulfill(
                    idx,
                    ResultCode::Ok,
                    None,
                    ReturnMethod::Blocking,
                );
                (idx, 0, None, ResultCode::Ok)
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
