//! Client request entrance: validates leadership, appends entries, invokes
//! state machine pre-commit, registers commit waiters, and triggers the
//! urgent AppendEntries fan-out.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{self, Duration};

use super::*;

use crate::server::debug;
use crate::server::message::encode_leader_status;
use crate::server::{
    AsyncResult, CbContext, CbParams, CbReturn, CommitWaiter, LogEntry,
};

/// A client write: a sequence of log entries to replicate.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    /// Entries to append, in order.
    pub entries: Vec<LogEntry>,
}

/// Parameter bundle passed to the after-precommit extension callback.
#[derive(Debug)]
pub struct ReqExtCbParams<'a> {
    /// Slot index assigned to the entry.
    pub log_idx: LogIndex,

    /// Term the entry was appended in.
    pub log_term: Term,

    /// Opaque context carried by the request's extension parameters.
    pub context: Option<&'a [u8]>,
}

/// Extension callback invoked after each entry's pre-commit.
pub type AfterPrecommitFn = Box<dyn Fn(ReqExtCbParams<'_>) + Send + Sync>;

/// Optional extension parameters of a client request.
#[derive(Default)]
pub struct ReqExtParams {
    /// If given, the request is rejected with `TermMismatch` unless the
    /// server's current term equals this.
    pub expected_term: Option<Term>,

    /// Invoked with (log index, term, context) after each entry's
    /// pre-commit.
    pub after_precommit: Option<AfterPrecommitFn>,

    /// Opaque context forwarded to `after_precommit`.
    pub context: Option<Vec<u8>>,
}

/// How the response to a synchronous-replication request gets completed.
enum Completion {
    /// Nothing outstanding; the response is final as-is.
    None,

    /// Blocking return method: `finalize_response` waits on this waiter.
    Blocking(Arc<CommitWaiter>),

    /// Async-handler return method: the commit path fulfills this result.
    Async(Arc<AsyncResult>),
}

/// Response produced by `handle_client_request`. In blocking mode the result
/// code and value are filled in by `RaftCore::finalize_response`; in
/// async-handler mode the caller obtains the pending result via
/// `async_result()`.
pub struct ClientResponse {
    /// The response message.
    pub resp: RespMsg,

    completion: Completion,
}

impl ClientResponse {
    fn plain(resp: RespMsg) -> Self {
        ClientResponse {
            resp,
            completion: Completion::None,
        }
    }

    /// The pending async result, present only in async-handler mode.
    pub fn async_result(&self) -> Option<Arc<AsyncResult>> {
        match &self.completion {
            Completion::Async(async_result) => Some(async_result.clone()),
            _ => None,
        }
    }
}

// RaftCore client requests entrance
impl RaftCore {
    /// Handler of the leader status request: a lightweight read of the
    /// current term and state machine commit index, as a 16-byte payload of
    /// two big-endian u64 words.
    pub async fn handle_leader_status_req(&self, req: &ReqMsg) -> RespMsg {
        match self.params.locking_method {
            LockingMethod::SingleMutex => {
                let _guard = self.core_lock.lock().await;
                self.leader_status_resp(req)
            }
            LockingMethod::DualMutex => {
                let _guard = self.cli_lock.lock().await;
                self.leader_status_resp(req)
            }
        }
    }

    fn leader_status_resp(&self, req: &ReqMsg) -> RespMsg {
        let cur_term = self.current_term();
        let mut resp = RespMsg::new(
            MsgType::LeaderStatusResponse,
            cur_term,
            self.id,
            req.src,
        );
        if self.role() != Role::Leader || self.write_paused() {
            resp.result_code = ResultCode::NotLeader;
            return resp;
        }
        resp.ctx = Some(encode_leader_status(cur_term, self.sm_commit_index()));
        resp
    }

    /// Handles one client write under the configured locking method, then
    /// triggers the urgent AppendEntries fan-out so that commit does not
    /// depend on the heartbeat schedule.
    ///
    /// Returns `Ok(None)` when a user callback decided that no reply shall
    /// be sent.
    pub async fn handle_client_request(
        &self,
        req: ClientRequest,
        ext_params: ReqExtParams,
    ) -> Result<Option<ClientResponse>, LodestoneError> {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        let (resp, trigger_fanout) = match self.params.locking_method {
            LockingMethod::SingleMutex => {
                let _guard = self.core_lock.lock().await;
                self.handle_cli_req(req, &ext_params, timestamp_us).await?
            }
            LockingMethod::DualMutex => {
                let _guard = self.cli_lock.lock().await;
                self.handle_cli_req(req, &ext_params, timestamp_us).await?
            }
        };

        if trigger_fanout {
            // urgent commit, so that commit will not depend on heartbeats
            self.request_append_entries_for_all().await;
        }

        Ok(resp)
    }

    /// The actual request handler, run under the mode-selected lock. The
    /// second return value tells the caller whether fan-out shall be
    /// triggered (it is whenever entries may have reached the log).
    async fn handle_cli_req(
        &self,
        req: ClientRequest,
        ext_params: &ReqExtParams,
        timestamp_us: u64,
    ) -> Result<(Option<ClientResponse>, bool), LodestoneError> {
        let cur_term = self.current_term();
        let mut resp = RespMsg::new(
            MsgType::AppendEntriesResponse,
            cur_term,
            self.id,
            self.leader_id(),
        );

        if self.role() != Role::Leader || self.write_paused() {
            resp.result_code = ResultCode::NotLeader;
            return Ok((Some(ClientResponse::plain(resp)), false));
        }

        if let Some(expected_term) = ext_params.expected_term {
            if expected_term != cur_term {
                resp.result_code = ResultCode::TermMismatch;
                return Ok((Some(ClientResponse::plain(resp)), false));
            }
        }

        let num_entries = req.entries.len();
        let mut last_idx: LogIndex = 0;
        let mut ret_value: Option<Vec<u8>> = None;

        for mut entry in req.entries {
            // force the entry's term to the current term; the timestamp is
            // sampled once per request
            entry.term = cur_term;
            entry.timestamp_us = timestamp_us;

            let rc = {
                let mut params = CbParams {
                    my_id: self.id,
                    leader_id: self.leader_id(),
                    ctx: CbContext::Entry(&mut entry),
                };
                self.callbacks.pre_append_log_leader(&mut params)
            };
            if rc == CbReturn::ReturnNull {
                return Ok((None, last_idx > 0));
            }

            // reassert the term, the callback may have rewritten the entry;
            // kept as a stable contract with embedding applications
            entry.term = cur_term;

            let next_slot = match self.log_store.store_log_entry(&entry) {
                Ok(index) => index,
                Err(e) => {
                    pf_error!("failed to append entry: {}", e);
                    self.try_update_precommit_index(last_idx);

                    let rc = {
                        let mut params = CbParams {
                            my_id: self.id,
                            leader_id: self.leader_id(),
                            ctx: CbContext::Entry(&mut entry),
                        };
                        self.callbacks.append_log_failed(&mut params)
                    };
                    if rc == CbReturn::ReturnNull {
                        return Ok((None, last_idx > 0));
                    }
                    return Err(e);
                }
            };
            pf_debug!(
                "append at log_idx {}, timestamp {}",
                next_slot,
                timestamp_us
            );

            last_idx = next_slot;
            ret_value =
                self.state_machine.pre_commit(last_idx, &entry.payload)?;

            if let Some(after_precommit) = &ext_params.after_precommit {
                after_precommit(ReqExtCbParams {
                    log_idx: last_idx,
                    log_term: cur_term,
                    context: ext_params.context.as_deref(),
                });
            }
        }

        if num_entries > 0 {
            self.log_store
                .end_of_append_batch(last_idx + 1 - num_entries as u64, num_entries as u64);
        }
        self.try_update_precommit_index(last_idx);
        let resp_idx = self.log_store.next_slot();

        // finished appending logs and pre_commit of itself
        let rc = {
            let mut params = CbParams {
                my_id: self.id,
                leader_id: self.leader_id(),
                ctx: CbContext::LastIndex(last_idx),
            };
            self.callbacks.append_logs(&mut params)
        };
        if rc == CbReturn::ReturnNull {
            return Ok((None, last_idx > 0));
        }

        let sleep_us = debug::handle_cli_req_sleep_us();
        if sleep_us > 0 {
            // deterministic race-testing hook
            time::sleep(Duration::from_micros(sleep_us)).await;
        }

        let completion = if !self.cluster_config().async_replication {
            // sync replication: a commit waiter keyed by the last assigned
            // index bridges to the commit path
            if num_entries == 0 {
                Completion::None
            } else {
                let elem = self.waiters.register(last_idx);
                match self.params.return_method {
                    ReturnMethod::Blocking => Completion::Blocking(elem),
                    ReturnMethod::AsyncHandler => {
                        Completion::Async(self.waiters.attach_async(&elem))
                    }
                }
            }
        } else {
            // async replication: return immediately with the pre-commit
            // result
            pf_trace!("asynchronously replicated up to {}", last_idx);
            resp.ctx = ret_value;
            Completion::None
        };

        resp.accept(resp_idx);
        Ok((Some(ClientResponse { resp, completion }), true))
    }

    /// Completes a client response. In blocking mode this waits on the
    /// commit waiter's event for up to `client_req_timeout_ms` and fills the
    /// result into the response; otherwise the response is returned as-is
    /// (the commit path fulfills the async result later).
    pub async fn finalize_response(
        &self,
        response: ClientResponse,
    ) -> RespMsg {
        let ClientResponse {
            mut resp,
            completion,
        } = response;

        match completion {
            Completion::None | Completion::Async(_) => resp,
            Completion::Blocking(elem) => {
                pf_trace!("commit waiter {} sleep", elem.log_idx());
                elem.wait_ms(self.params.client_req_timeout_ms).await;

                let (idx, elapsed_us, value, code) =
                    self.waiters.finalize_blocking(&elem);
                if code == ResultCode::Ok {
                    pf_debug!(
                        "commit waiter {} wake up ({} us)",
                        idx,
                        elapsed_us
                    );
                } else {
                    pf_warn!(
                        "commit waiter {} wake up ({} us) with result {:?}",
                        idx,
                        elapsed_us,
                        code
                    );
                    if self.check_leadership_validity() {
                        pf_info!("leadership is still valid");
                    } else {
                        pf_error!("leadership is invalid");
                    }
                }

                resp.ctx = value;
                resp.result_code = code;
                resp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::transport::next_generation_id;
    use crate::server::{
        decode_leader_status, EchoStateMachine, EventCallbacks, LogStore,
        MemLogStore, NoopCallbacks, RpcClient, RpcClientFactory,
        StateMachine,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Copy, Clone)]
    enum MockMode {
        Reply,
        Hang,
    }

    struct MockRpcClient {
        generation_id: u64,
        mode: MockMode,
    }

    #[async_trait]
    impl RpcClient for MockRpcClient {
        fn generation_id(&self) -> u64 {
            self.generation_id
        }

        async fn send(
            &self,
            req: ReqMsg,
        ) -> Result<RespMsg, LodestoneError> {
            match self.mode {
                MockMode::Reply => {
                    time::sleep(Duration::from_millis(5)).await;
                    let mut resp = RespMsg::new(
                        MsgType::AppendEntriesResponse,
                        req.term,
                        req.dst,
                        req.src,
                    );
                    resp.accept(
                        req.last_log_index + req.entries.len() as u64 + 1,
                    );
                    Ok(resp)
                }
                MockMode::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct MockFactory {
        mode: MockMode,
    }

    impl RpcClientFactory for MockFactory {
        fn create_client(
            &self,
            _endpoint: &str,
        ) -> Result<Arc<dyn RpcClient>, LodestoneError> {
            Ok(Arc::new(MockRpcClient {
                generation_id: next_generation_id(),
                mode: self.mode,
            }))
        }
    }

    /// State machine with fixed result buffers, mirroring an application
    /// that computes something at commit time.
    struct FixedStateMachine;

    impl StateMachine for FixedStateMachine {
        fn pre_commit(
            &self,
            _log_index: LogIndex,
            _payload: &[u8],
        ) -> Result<Option<Vec<u8>>, LodestoneError> {
            Ok(Some(b"pre".to_vec()))
        }

        fn commit(
            &self,
            _log_index: LogIndex,
            _payload: &[u8],
        ) -> Result<Option<Vec<u8>>, LodestoneError> {
            Ok(Some(b"hi".to_vec()))
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        pre_appends: AtomicU32,
        failures: AtomicU32,
        batches: AtomicU32,
    }

    impl EventCallbacks for RecordingCallbacks {
        fn pre_append_log_leader(
            &self,
            _params: &mut CbParams<'_>,
        ) -> CbReturn {
            self.pre_appends.fetch_add(1, Ordering::Relaxed);
            CbReturn::Ok
        }

        fn append_log_failed(&self, _params: &mut CbParams<'_>) -> CbReturn {
            self.failures.fetch_add(1, Ordering::Relaxed);
            CbReturn::Ok
        }

        fn append_logs(&self, _params: &mut CbParams<'_>) -> CbReturn {
            self.batches.fetch_add(1, Ordering::Relaxed);
            CbReturn::Ok
        }
    }

    struct NullingCallbacks;

    impl EventCallbacks for NullingCallbacks {
        fn pre_append_log_leader(
            &self,
            _params: &mut CbParams<'_>,
        ) -> CbReturn {
            CbReturn::ReturnNull
        }
    }

    struct Harness {
        core: Arc<RaftCore>,
        log_store: Arc<MemLogStore>,
    }

    async fn setup(
        mode: MockMode,
        config_str: Option<&str>,
        async_replication: bool,
        callbacks: Arc<dyn EventCallbacks>,
        state_machine: Arc<dyn StateMachine>,
        coordinator: Option<Arc<GlobalCoordinator>>,
    ) -> Result<Harness, LodestoneError> {
        let cluster = ClusterConfig {
            async_replication,
            peers: (0..3u8)
                .map(|id| PeerConfig {
                    id,
                    endpoint: "127.0.0.1:0".into(),
                })
                .collect(),
        };
        let log_store = Arc::new(MemLogStore::new());
        let core = RaftCore::new_and_setup(
            0,
            cluster,
            log_store.clone(),
            state_machine,
            callbacks,
            Some(Arc::new(MockFactory { mode })),
            coordinator,
            config_str,
        )
        .await?;
        Ok(Harness { core, log_store })
    }

    async fn default_setup(
        mode: MockMode,
        config_str: Option<&str>,
    ) -> Result<Harness, LodestoneError> {
        setup(
            mode,
            config_str,
            false,
            Arc::new(NoopCallbacks),
            Arc::new(FixedStateMachine),
            None,
        )
        .await
    }

    fn one_entry_req(payload: &[u8]) -> ClientRequest {
        ClientRequest {
            entries: vec![LogEntry::app_data(payload.to_vec())],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn happy_path_sync_blocking() -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Reply, None).await?;

        // not leader yet: client is turned away
        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        assert_eq!(response.resp.result_code, ResultCode::NotLeader);
        assert_eq!(h.log_store.next_slot(), 1);

        h.core.become_leader(1);
        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        assert!(response.resp.accepted);
        assert_eq!(response.resp.accepted_index, 2);

        let resp = h.core.finalize_response(response).await;
        assert_eq!(resp.result_code, ResultCode::Ok);
        assert_eq!(resp.ctx, Some(b"hi".to_vec()));
        assert!(h.core.commit_waiters().is_empty());
        assert_eq!(h.core.precommit_index(), 1);
        assert_eq!(h.core.sm_commit_index(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_timeout_leaves_waiter() -> Result<(), LodestoneError> {
        let h = default_setup(
            MockMode::Hang,
            Some("client_req_timeout_ms = 50"),
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();

        let start = Instant::now();
        let resp = h.core.finalize_response(response).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(resp.result_code, ResultCode::Timeout);
        assert_eq!(resp.ctx, None);
        assert!(h.core.commit_waiters().contains(1));

        // the commit path later finds the abandoned waiter and removes it
        h.core.commit_waiters().fulfill(
            1,
            ResultCode::Ok,
            None,
            ReturnMethod::Blocking,
        );
        assert!(h.core.commit_waiters().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leadership_loss_cancels_waiters() -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Hang, None).await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();

        let core_ref = h.core.clone();
        let start = Instant::now();
        let finalizer = tokio::spawn(async move {
            core_ref.finalize_response(response).await
        });

        time::sleep(Duration::from_millis(20)).await;
        h.core.step_down(2);

        let resp = finalizer.await.map_err(LodestoneError::msg)?;
        assert_eq!(resp.result_code, ResultCode::Cancelled);
        assert_eq!(resp.ctx, None);
        // woke well before the 3000 ms client timeout
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert!(h.core.commit_waiters().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn term_mismatch_is_rejected() -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Reply, None).await?;
        h.core.become_leader(7);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams {
                    expected_term: Some(6),
                    ..Default::default()
                },
            )
            .await?
            .unwrap();
        assert_eq!(response.resp.result_code, ResultCode::TermMismatch);
        assert_eq!(h.log_store.next_slot(), 1);
        assert!(h.core.commit_waiters().is_empty());
        for peer in h.core.peers() {
            assert_eq!(peer.bytes_in_flight(), 0);
        }

        // matching expected term proceeds
        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams {
                    expected_term: Some(7),
                    ..Default::default()
                },
            )
            .await?
            .unwrap();
        assert!(response.resp.accepted);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_request_accepted_without_waiter(
    ) -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Reply, None).await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                ClientRequest::default(),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        assert!(response.resp.accepted);
        assert_eq!(response.resp.accepted_index, 1);
        assert!(h.core.commit_waiters().is_empty());

        let resp = h.core.finalize_response(response).await;
        assert_eq!(resp.result_code, ResultCode::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_failure_reports_and_propagates(
    ) -> Result<(), LodestoneError> {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let h = setup(
            MockMode::Reply,
            None,
            false,
            callbacks.clone(),
            Arc::new(EchoStateMachine),
            None,
        )
        .await?;
        h.core.become_leader(1);
        h.log_store.fail_next_store();

        let result = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(callbacks.failures.load(Ordering::Relaxed), 1);
        assert_eq!(h.log_store.next_slot(), 1);
        assert_eq!(h.core.precommit_index(), 0);
        assert!(h.core.commit_waiters().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pre_append_return_null_aborts_response(
    ) -> Result<(), LodestoneError> {
        let h = setup(
            MockMode::Reply,
            None,
            false,
            Arc::new(NullingCallbacks),
            Arc::new(EchoStateMachine),
            None,
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?;
        assert!(response.is_none());
        assert_eq!(h.log_store.next_slot(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leader_status_endpoint() -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Reply, None).await?;
        let status_req = ReqMsg {
            msg_type: MsgType::LeaderStatusRequest,
            term: 0,
            src: 9,
            dst: 0,
            last_log_index: 0,
            last_log_term: 0,
            commit_index: 0,
            entries: vec![],
        };

        let resp = h.core.handle_leader_status_req(&status_req).await;
        assert_eq!(resp.result_code, ResultCode::NotLeader);
        assert!(resp.ctx.is_none());

        h.core.become_leader(42);
        let resp = h.core.handle_leader_status_req(&status_req).await;
        assert_eq!(resp.result_code, ResultCode::Ok);
        assert_eq!(resp.dst, 9);
        let (term, commit_index) =
            decode_leader_status(resp.ctx.as_ref().unwrap())?;
        assert_eq!(term, 42);
        assert_eq!(commit_index, h.core.sm_commit_index());

        // a paused leader still holds office but refuses reads of this kind
        h.core.pause_writes();
        let resp = h.core.handle_leader_status_req(&status_req).await;
        assert_eq!(resp.result_code, ResultCode::NotLeader);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn async_handler_return_method() -> Result<(), LodestoneError> {
        let h = default_setup(
            MockMode::Reply,
            Some("return_method = 'async_handler'"),
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        let async_result = response.async_result().unwrap();
        let resp = h.core.finalize_response(response).await;
        assert!(resp.accepted);

        let (value, code, err) = async_result.get().await;
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(value, Some(b"hi".to_vec()));
        assert!(err.is_none());
        assert!(h.core.commit_waiters().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn async_replication_returns_precommit_buffer(
    ) -> Result<(), LodestoneError> {
        let h = setup(
            MockMode::Reply,
            None,
            true,
            Arc::new(NoopCallbacks),
            Arc::new(FixedStateMachine),
            None,
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        assert!(response.resp.accepted);
        assert_eq!(response.resp.ctx, Some(b"pre".to_vec()));
        assert!(response.async_result().is_none());
        assert!(h.core.commit_waiters().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_mutex_locking_works() -> Result<(), LodestoneError> {
        let h = default_setup(
            MockMode::Reply,
            Some("locking_method = 'single_mutex'"),
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        let resp = h.core.finalize_response(response).await;
        assert_eq!(resp.result_code, ResultCode::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn urgent_commit_via_background_event(
    ) -> Result<(), LodestoneError> {
        let h = default_setup(
            MockMode::Reply,
            Some("use_bg_thread_for_urgent_commit = true"),
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        let resp = h.core.finalize_response(response).await;
        assert_eq!(resp.result_code, ResultCode::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn urgent_commit_via_global_coordinator(
    ) -> Result<(), LodestoneError> {
        let coordinator = GlobalCoordinator::new_and_setup();
        let h = setup(
            MockMode::Reply,
            Some("use_bg_thread_for_urgent_commit = true"),
            false,
            Arc::new(NoopCallbacks),
            Arc::new(FixedStateMachine),
            Some(coordinator),
        )
        .await?;
        h.core.become_leader(1);

        let response = h
            .core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?
            .unwrap();
        let resp = h.core.finalize_response(response).await;
        assert_eq!(resp.result_code, ResultCode::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_indices_are_contiguous() -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Reply, None).await?;
        h.core.become_leader(1);

        let mut tasks = Vec::new();
        for batch_size in [3usize, 2, 4] {
            let core_ref = h.core.clone();
            let recorded = Arc::new(Mutex::new(Vec::new()));
            let recorded_ref = recorded.clone();
            tasks.push(tokio::spawn(async move {
                let req = ClientRequest {
                    entries: (0..batch_size)
                        .map(|i| LogEntry::app_data(vec![i as u8]))
                        .collect(),
                };
                let ext_params = ReqExtParams {
                    after_precommit: Some(Box::new(move |p| {
                        recorded_ref.lock().unwrap().push(p.log_idx);
                    })),
                    ..Default::default()
                };
                core_ref
                    .handle_client_request(req, ext_params)
                    .await
                    .unwrap();
                recorded.lock().unwrap().clone()
            }));
        }

        for task in tasks {
            let indices = task.await.map_err(LodestoneError::msg)?;
            assert!(!indices.is_empty());
            for pair in indices.windows(2) {
                assert_eq!(pair[1], pair[0] + 1);
            }
        }
        assert_eq!(h.log_store.next_slot(), 10);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sleep_hook_delays_handler() -> Result<(), LodestoneError> {
        let h = default_setup(MockMode::Reply, None).await?;
        h.core.become_leader(1);

        debug::set_handle_cli_req_sleep_us(5_000);
        let start = Instant::now();
        h.core
            .handle_client_request(
                one_entry_req(b"abcd"),
                ReqExtParams::default(),
            )
            .await?;
        debug::set_handle_cli_req_sleep_us(0);
        assert!(start.elapsed() >= Duration::from_micros(5_000));
        Ok(())
    }
}
