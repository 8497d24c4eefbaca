//! Per-peer RPC dispatcher: owns the mutable connection handle, enforces
//! at-most-one pipelined RPC per message class, and performs backoff-paced
//! reconnection. Responses are matched against the connection generation
//! that was live at send time; stale ones are dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::server::debug;
use crate::server::{
    LogIndex, MsgType, ReplicaId, ReqMsg, RespMsg, RpcClient,
    RpcClientFactory,
};
use crate::utils::{Backoff, LodestoneError};

/// Result handler bound to one in-flight RPC.
pub type RpcHandler =
    Box<dyn FnOnce(Result<RespMsg, LodestoneError>) + Send + 'static>;

/// Static configuration of one cluster peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer replica ID.
    pub id: ReplicaId,

    /// Peer endpoint address string (host:port).
    pub endpoint: String,
}

/// Server-wide pieces shared with every peer dispatcher.
pub(crate) struct ServerContext {
    /// RPC client factory; swappable, snapshotted under this lock.
    pub(crate) rpc_factory: Mutex<Option<Arc<dyn RpcClientFactory>>>,

    /// Heartbeat interval, also the reconnection backoff cap.
    pub(crate) hb_interval_ms: u64,

    /// Cap for the slowed-down heartbeat interval.
    pub(crate) max_hb_interval_ms: u64,

    /// Stale responses logged per peer before suppression kicks in.
    pub(crate) stale_response_limit: u32,
}

impl ServerContext {
    pub(crate) fn new(
        rpc_factory: Option<Arc<dyn RpcClientFactory>>,
        hb_interval_ms: u64,
        max_hb_interval_ms: u64,
        stale_response_limit: u32,
    ) -> Arc<Self> {
        Arc::new(ServerContext {
            rpc_factory: Mutex::new(rpc_factory),
            hb_interval_ms,
            max_hb_interval_ms,
            stale_response_limit,
        })
    }
}

/// Connection slot guarded by the rpc protector lock: the live client handle
/// (if any) together with the reconnection backoff countdown.
struct RpcSlot {
    client: Option<Arc<dyn RpcClient>>,
    backoff: Backoff,
}

/// Heartbeat pacing state, guarded by the per-peer lock.
struct HbState {
    current_ms: u64,
}

/// One instance per cluster peer on the leader side.
pub struct Peer {
    /// This peer's static configuration.
    config: PeerConfig,

    /// Weak self-reference; upgraded into every in-flight callback bundle so
    /// the peer stays alive across the async boundary.
    me: Weak<Peer>,

    /// Shared server context.
    ctx: Arc<ServerContext>,

    /// The rpc protector: connection handle + reconnect backoff.
    rpc_slot: Mutex<RpcSlot>,

    /// Payload bytes of append_entries RPCs sent on the current connection
    /// generation for which neither response nor reset has occurred.
    bytes_in_flight: AtomicU64,

    /// At-most-one-pipelined-RPC flag.
    busy: AtomicBool,

    /// Last log index sent in streaming mode; 0 when streaming is off.
    last_streamed_log_idx: AtomicU64,

    /// Count of responses dropped for generation mismatch, for rate-limited
    /// logging.
    stale_resp_cnt: AtomicU32,

    /// Once set, this peer never initiates new RPCs and drops all callbacks.
    abandoned: AtomicBool,

    /// True if this peer lags too far behind and needs snapshot sync.
    snapshot_sync_needed: AtomicBool,

    /// Marks that the busy flag was force-released by a reconnect.
    manual_free: AtomicBool,

    /// Instant of the last observed connection activity.
    active_at: Mutex<Instant>,

    /// Per-peer lock guarding heartbeat pacing.
    hb: Mutex<HbState>,

    /// Heartbeat sender task handle, owned once leadership starts.
    hb_task: Mutex<Option<JoinHandle<()>>>,

    /// Index of the next log entry to send to this peer.
    next_log_idx: AtomicU64,

    /// Index of the highest log entry known replicated on this peer.
    matched_log_idx: AtomicU64,
}

impl Peer {
    pub(crate) fn new(config: PeerConfig, ctx: Arc<ServerContext>) -> Arc<Self> {
        let hb_interval_ms = ctx.hb_interval_ms;
        Arc::new_cyclic(|me| Peer {
            config,
            me: me.clone(),
            ctx,
            rpc_slot: Mutex::new(RpcSlot {
                client: None,
                backoff: Backoff::new(1),
            }),
            bytes_in_flight: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            last_streamed_log_idx: AtomicU64::new(0),
            stale_resp_cnt: AtomicU32::new(0),
            abandoned: AtomicBool::new(false),
            snapshot_sync_needed: AtomicBool::new(false),
            manual_free: AtomicBool::new(false),
            active_at: Mutex::new(Instant::now()),
            hb: Mutex::new(HbState {
                current_ms: hb_interval_ms,
            }),
            hb_task: Mutex::new(None),
            next_log_idx: AtomicU64::new(1),
            matched_log_idx: AtomicU64::new(0),
        })
    }

    /// Peer replica ID.
    pub fn id(&self) -> ReplicaId {
        self.config.id
    }

    /// Sum of append_entries payload bytes currently in flight.
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight.load(Ordering::Acquire)
    }

    /// True if an RPC pipeline slot is occupied.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Atomically claims the pipeline slot; false if already busy.
    pub(crate) fn make_busy(&self) -> bool {
        if self
            .busy
            .compare_exchange(
                false,
                true,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.manual_free.store(false, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn set_free(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Count of dropped stale responses since the last matching one.
    pub fn stale_responses(&self) -> u32 {
        self.stale_resp_cnt.load(Ordering::Relaxed)
    }

    pub fn snapshot_sync_needed(&self) -> bool {
        self.snapshot_sync_needed.load(Ordering::Acquire)
    }

    pub fn set_snapshot_sync_needed(&self, needed: bool) {
        self.snapshot_sync_needed.store(needed, Ordering::Release);
    }

    /// Last log index sent while streaming; 0 if streaming is off.
    pub fn last_streamed_log_idx(&self) -> LogIndex {
        self.last_streamed_log_idx.load(Ordering::Acquire)
    }

    /// Records the last streamed index, turning streaming mode on.
    pub fn note_streamed(&self, log_idx: LogIndex) {
        self.last_streamed_log_idx.store(log_idx, Ordering::Release);
    }

    /// Leaves streaming mode, returning the previous streamed index.
    pub(crate) fn reset_stream(&self) -> LogIndex {
        self.last_streamed_log_idx.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn next_log_idx(&self) -> LogIndex {
        self.next_log_idx.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_log_idx(&self, idx: LogIndex) {
        self.next_log_idx.store(idx, Ordering::Release);
    }

    pub(crate) fn matched_log_idx(&self) -> LogIndex {
        self.matched_log_idx.load(Ordering::Acquire)
    }

    pub(crate) fn set_matched_log_idx(&self, idx: LogIndex) {
        self.matched_log_idx.store(idx, Ordering::Release);
    }

    /// Millisecs since the last observed connection activity.
    pub fn millis_since_active(&self) -> u64 {
        self.active_at.lock().unwrap().elapsed().as_millis() as u64
    }

    fn reset_active_timer(&self) {
        *self.active_at.lock().unwrap() = Instant::now();
    }

    /// Current (possibly slowed-down) heartbeat interval.
    pub fn current_hb_interval_ms(&self) -> u64 {
        self.hb.lock().unwrap().current_ms
    }

    fn resume_hb_speed(&self) {
        let mut hb = self.hb.lock().unwrap();
        hb.current_ms = self.ctx.hb_interval_ms;
    }

    fn slow_down_hb(&self) {
        let mut hb = self.hb.lock().unwrap();
        hb.current_ms = std::cmp::min(
            self.ctx.max_hb_interval_ms,
            hb.current_ms + self.ctx.hb_interval_ms,
        );
    }

    /// Current reconnect backoff duration. Mostly interesting to tests and
    /// operators watching reconnect pacing.
    pub fn reconn_backoff_ms(&self) -> u64 {
        self.rpc_slot.lock().unwrap().backoff.duration_ms()
    }

    /// True if the busy flag was last released by a reconnect rather than by
    /// a response.
    pub fn manually_freed(&self) -> bool {
        self.manual_free.load(Ordering::Relaxed)
    }

    /// True if no live connection handle exists.
    pub(crate) fn rpc_is_null(&self) -> bool {
        self.rpc_slot.lock().unwrap().client.is_none()
    }

    pub(crate) fn set_hb_task(&self, task: JoinHandle<()>) {
        let mut slot = self.hb_task.lock().unwrap();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Sends a request on the current connection. The bound result handler
    /// captures a shared self-reference (keeping this peer alive across the
    /// async boundary) and the specific connection handle snapshot (so the
    /// result path can detect generation mismatches).
    pub(crate) fn send_req(
        &self,
        req: ReqMsg,
        handler: RpcHandler,
        streaming: bool,
    ) {
        if self.is_abandoned() {
            pf_error!(
                "peer {} has been shut down, cannot send request",
                self.config.id
            );
            self.set_free();
            return;
        }

        pf_trace!(
            "send req {} -> {}, type {:?}",
            req.src,
            req.dst,
            req.msg_type
        );

        let rpc = {
            let slot = self.rpc_slot.lock().unwrap();
            match slot.client.as_ref() {
                Some(client) => client.clone(),
                None => {
                    // nothing will be sent, immediately free the slot to
                    // serve the next operation after reconnect
                    drop(slot);
                    pf_trace!("rpc handle of peer {} is null", self.config.id);
                    self.set_free();
                    return;
                }
            }
        };

        let myself = match self.me.upgrade() {
            Some(myself) => myself,
            None => {
                self.set_free();
                return;
            }
        };

        let req_size_bytes = if req.msg_type == MsgType::AppendEntriesRequest
        {
            req.payload_bytes()
        } else {
            0
        };
        self.bytes_in_flight
            .fetch_add(req_size_bytes, Ordering::AcqRel);

        tokio::spawn(async move {
            let result = rpc.send(req.clone()).await;
            myself.handle_rpc_result(
                rpc,
                &req,
                handler,
                streaming,
                req_size_bytes,
                result,
            );
        });
    }

    /// Handles the outcome of one in-flight RPC. `my_rpc` is the connection
    /// handle snapshotted at send time; its generation is compared against
    /// the currently live one so that a response from a reset connection can
    /// never touch the new connection's busy flag, bytes counter, or stream
    /// state.
    fn handle_rpc_result(
        &self,
        my_rpc: Arc<dyn RpcClient>,
        req: &ReqMsg,
        handler: RpcHandler,
        streaming: bool,
        req_size_bytes: u64,
        result: Result<RespMsg, LodestoneError>,
    ) {
        if self.is_abandoned() {
            pf_info!(
                "peer {} has been shut down, ignore response",
                self.config.id
            );
            return;
        }

        match result {
            Ok(resp) => {
                {
                    let slot = self.rpc_slot.lock().unwrap();
                    let cur_id = slot
                        .client
                        .as_ref()
                        .map(|c| c.generation_id())
                        .unwrap_or(0);
                    let given_id = my_rpc.generation_id();
                    if cur_id != given_id {
                        // the rpc was reset between send and receive; the
                        // busy flag belongs to a different connection now
                        self.note_stale_response(cur_id, given_id);
                        return;
                    }
                    self.stale_resp_cnt.store(0, Ordering::Relaxed);
                    let _ = self.bytes_in_flight.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |v| Some(v.saturating_sub(req_size_bytes)),
                    );
                    self.try_set_free(req.msg_type, streaming);
                }

                self.reset_active_timer();
                self.resume_hb_speed();
                handler(Ok(resp));

                let mut slot = self.rpc_slot.lock().unwrap();
                slot.backoff.reset();
                slot.backoff.set_duration_ms(1);
            }
            Err(err) => {
                // explicit failure is also an activity of that connection
                self.reset_active_timer();
                self.slow_down_hb();
                handler(Err(err));

                let mut slot = self.rpc_slot.lock().unwrap();
                let cur_id = slot
                    .client
                    .as_ref()
                    .map(|c| c.generation_id())
                    .unwrap_or(0);
                let given_id = my_rpc.generation_id();
                if cur_id == given_id {
                    // destroy this connection; the socket must not be
                    // re-used, the next append operation will create a new
                    // one
                    slot.client = None;
                    let last_streamed = self.reset_stream();
                    if last_streamed != 0 {
                        pf_info!(
                            "stop stream mode for peer {} at idx {}",
                            self.config.id,
                            last_streamed
                        );
                    }
                    self.stale_resp_cnt.store(0, Ordering::Relaxed);
                    self.bytes_in_flight.store(0, Ordering::Release);
                    self.try_set_free(req.msg_type, streaming);

                    // re-evaluated by the first request on the next conn
                    self.set_snapshot_sync_needed(false);
                } else {
                    // the rpc has been reset before this request returned
                    // an error; the two are different instances and the new
                    // one must not be touched
                    self.note_stale_response(cur_id, given_id);
                }
            }
        }
    }

    fn note_stale_response(&self, cur_id: u64, given_id: u64) {
        let stale_resps = self.stale_resp_cnt.fetch_add(1, Ordering::Relaxed) + 1;
        let limit = self.ctx.stale_response_limit;
        if stale_resps < limit {
            pf_warn!(
                "got stale rpc response from peer {}: current gen {}, from gen {}; ignoring",
                self.config.id,
                cur_id,
                given_id
            );
        } else if stale_resps == limit {
            pf_warn!(
                "too verbose stale rpc responses from peer {}, suppressing from now",
                self.config.id
            );
        }
    }

    /// Releases the busy flag for message classes whose pipeline slot frees
    /// on completion. append_entries keeps the slot while streaming mode is
    /// active (a single logical stream emits multiple sends before any
    /// completes).
    fn try_set_free(&self, msg_type: MsgType, streaming: bool) {
        match msg_type {
            MsgType::InstallSnapshotRequest
            | MsgType::RequestVoteRequest
            | MsgType::PreVoteRequest
            | MsgType::LeaveClusterRequest
            | MsgType::CustomNotificationRequest
            | MsgType::ReconnectRequest
            | MsgType::PriorityChangeRequest => self.set_free(),

            MsgType::AppendEntriesRequest if !streaming => self.set_free(),

            _ => {}
        }
    }

    /// Creates a fresh connection handle (new generation) if the reconnect
    /// backoff has elapsed. Backoff doubles from 1 ms up to the heartbeat
    /// interval. Returns true if a new handle was installed.
    pub(crate) fn recreate_rpc(&self) -> Result<bool, LodestoneError> {
        if self.is_abandoned() {
            pf_trace!("peer {} is abandoned", self.config.id);
            return Ok(false);
        }

        let factory = self.ctx.rpc_factory.lock().unwrap().clone();
        let factory = match factory {
            Some(factory) => factory,
            None => {
                pf_trace!("client factory is empty");
                return Ok(false);
            }
        };

        let mut slot = self.rpc_slot.lock().unwrap();

        let backoff_disabled = debug::reconn_backoff_disabled();
        if backoff_disabled {
            pf_trace!("reconnection backoff timer is disabled");
        }

        if backoff_disabled || slot.backoff.timed_out() {
            slot.backoff.reset();
            let mut new_duration_ms =
                slot.backoff.duration_ms().saturating_mul(2);
            new_duration_ms =
                std::cmp::min(self.ctx.hb_interval_ms, new_duration_ms);
            if new_duration_ms == 0 {
                new_duration_ms = 1;
            }
            slot.backoff.set_duration_ms(new_duration_ms);

            let client = factory.create_client(&self.config.endpoint)?;
            pf_trace!(
                "reconnect peer {} (gen {})",
                self.config.id,
                client.generation_id()
            );
            slot.client = Some(client);

            // a reconnection attempt is treated as an activity
            self.reset_active_timer();
            self.reset_stream();
            self.bytes_in_flight.store(0, Ordering::Release);
            self.set_free();
            self.manual_free.store(true, Ordering::Relaxed);
            Ok(true)
        } else {
            pf_trace!("skip reconnect to peer {} this time", self.config.id);
            Ok(false)
        }
    }

    /// Abandons this peer: blocks all later sends, drops the connection
    /// handle atomically against racing `send_req` calls, and kills the
    /// heartbeat task. All subsequent send and result invocations
    /// short-circuit.
    pub(crate) fn shutdown(&self) {
        self.abandoned.store(true, Ordering::Release);
        {
            // to guarantee atomic reset (race against send_req)
            self.rpc_slot.lock().unwrap().client = None;
        }
        if let Some(task) = self.hb_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
