//! Server core: roles, terms, the peer set, urgent-commit fan-out, and
//! leader-side commit advancement. The client request entrance lives in the
//! `request` submodule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use serde::Deserialize;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::server::{
    CommitWaiterRegistry, EventCallbacks, GlobalCoordinator, LogIndex,
    LogStore, MsgType, Peer, PeerConfig, ReplicaId, ReqMsg, RespMsg,
    ResultCode, RpcClientFactory, RpcHandler, ServerContext, StateMachine,
    Term,
};
use crate::utils::LodestoneError;

mod request;

pub use request::{
    AfterPrecommitFn, ClientRequest, ClientResponse, ReqExtCbParams,
    ReqExtParams,
};

/// Locking strategy for the client request path.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMethod {
    /// One lock protects all server state; the client handler holds it for
    /// the entire request.
    SingleMutex,

    /// A dedicated client-path lock serializes client requests independently
    /// of the core server lock, so election and heartbeat handling can
    /// proceed concurrently with log append.
    DualMutex,
}

/// How a synchronous-replication client response is completed.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnMethod {
    /// The response completion blocks (with timeout) until the commit path
    /// resolves the waiter.
    Blocking,

    /// The response carries an async result object that the commit path
    /// fulfills later.
    AsyncHandler,
}

/// Server roles.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
}

impl Role {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Role::Follower,
            1 => Role::Candidate,
            _ => Role::Leader,
        }
    }
}

/// Configuration parameters struct.
#[derive(Debug, Deserialize)]
pub struct RaftParams {
    /// Locking strategy for the client request path.
    pub locking_method: LockingMethod,

    /// Completion style of synchronous-replication client responses.
    pub return_method: ReturnMethod,

    /// Route urgent-commit fan-out through a background thread (the global
    /// coordinator if one is plugged in, else this server's own background
    /// event) instead of the caller's thread.
    pub use_bg_thread_for_urgent_commit: bool,

    /// How long a blocking client response waits for commit, in millisecs.
    pub client_req_timeout_ms: u64,

    /// Interval of leader sending AppendEntries heartbeats to followers;
    /// also the reconnection backoff cap.
    pub hb_interval_ms: u64,

    /// Cap for the slowed-down per-peer heartbeat interval.
    pub max_hb_interval_ms: u64,

    /// Stale RPC responses logged per peer before suppression.
    pub stale_response_limit: u32,

    /// Max number of log entries per AppendEntries RPC.
    pub max_append_entries: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for RaftParams {
    fn default() -> Self {
        RaftParams {
            locking_method: LockingMethod::DualMutex,
            return_method: ReturnMethod::Blocking,
            use_bg_thread_for_urgent_commit: false,
            client_req_timeout_ms: 3000,
            hb_interval_ms: 500,
            max_hb_interval_ms: 2000,
            stale_response_limit: 10,
            max_append_entries: 100,
        }
    }
}

/// Active cluster configuration: the peer set and the replication mode.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// When true, client responses return right after pre-commit instead of
    /// waiting for quorum commit.
    pub async_replication: bool,

    /// All member servers (including self).
    pub peers: Vec<PeerConfig>,
}

/// The replication server core.
pub struct RaftCore {
    /// My replica ID.
    id: ReplicaId,

    /// Configuration parameters struct.
    params: RaftParams,

    /// Weak self-reference handed to spawned tasks and RPC result handlers.
    me: Weak<RaftCore>,

    /// Context shared with per-peer dispatchers.
    ctx: Arc<ServerContext>,

    /// Current role.
    role: AtomicU8,

    /// A paused leader still holds office but refuses writes.
    write_paused: AtomicBool,

    /// Latest term seen.
    curr_term: AtomicU64,

    /// Who do I think is the effective leader right now?
    leader: AtomicU8,

    /// Highest log index pre-committed into the state machine.
    precommit_index: AtomicU64,

    /// Highest log index applied to the state machine.
    sm_commit_index: AtomicU64,

    /// Active cluster configuration.
    cluster: RwLock<Arc<ClusterConfig>>,

    /// Client-path lock (dual-mutex mode only).
    cli_lock: Mutex<()>,

    /// Server-core lock.
    core_lock: Mutex<()>,

    /// Serializes quorum scans and state machine application so entries
    /// commit in log-index order.
    commit_lock: StdMutex<()>,

    /// Log store module.
    log_store: Arc<dyn LogStore>,

    /// State machine module.
    state_machine: Arc<dyn StateMachine>,

    /// User callbacks.
    callbacks: Arc<dyn EventCallbacks>,

    /// Outstanding synchronous client waiters.
    waiters: CommitWaiterRegistry,

    /// Per-peer dispatchers, keyed by peer ID.
    peers: RwLock<HashMap<ReplicaId, Arc<Peer>>>,

    /// Background urgent-commit event.
    bg_append_notify: Arc<Notify>,

    /// Join handle of the background urgent-commit task.
    bg_append_task: StdMutex<Option<JoinHandle<()>>>,

    /// Optional process-wide urgent-commit coordinator.
    coordinator: StdMutex<Option<Arc<GlobalCoordinator>>>,
}

impl RaftCore {
    /// Creates a new server core and spawns its background tasks.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_and_setup(
        id: ReplicaId,
        cluster: ClusterConfig,
        log_store: Arc<dyn LogStore>,
        state_machine: Arc<dyn StateMachine>,
        callbacks: Arc<dyn EventCallbacks>,
        rpc_factory: Option<Arc<dyn RpcClientFactory>>,
        coordinator: Option<Arc<GlobalCoordinator>>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, LodestoneError> {
        let params = parsed_config!(config_str => RaftParams;
                                    locking_method, return_method,
                                    use_bg_thread_for_urgent_commit,
                                    client_req_timeout_ms, hb_interval_ms,
                                    max_hb_interval_ms, stale_response_limit,
                                    max_append_entries)?;
        if params.hb_interval_ms == 0 {
            return logged_err!("invalid hb_interval_ms 0");
        }
        if params.client_req_timeout_ms == 0 {
            return logged_err!("invalid client_req_timeout_ms 0");
        }

        let ctx = ServerContext::new(
            rpc_factory,
            params.hb_interval_ms,
            params.max_hb_interval_ms,
            params.stale_response_limit,
        );

        let mut peers = HashMap::new();
        for peer_config in &cluster.peers {
            if peer_config.id == id {
                continue;
            }
            peers.insert(
                peer_config.id,
                Peer::new(peer_config.clone(), ctx.clone()),
            );
        }

        let core = Arc::new_cyclic(|me| RaftCore {
            id,
            params,
            me: me.clone(),
            ctx,
            role: AtomicU8::new(Role::Follower as u8),
            write_paused: AtomicBool::new(false),
            curr_term: AtomicU64::new(0),
            leader: AtomicU8::new(id),
            precommit_index: AtomicU64::new(0),
            sm_commit_index: AtomicU64::new(0),
            cluster: RwLock::new(Arc::new(cluster)),
            cli_lock: Mutex::new(()),
            core_lock: Mutex::new(()),
            commit_lock: StdMutex::new(()),
            log_store,
            state_machine,
            callbacks,
            waiters: CommitWaiterRegistry::new(),
            peers: RwLock::new(peers),
            bg_append_notify: Arc::new(Notify::new()),
            bg_append_task: StdMutex::new(None),
            coordinator: StdMutex::new(coordinator),
        });

        core.spawn_bg_append_task();
        pf_info!("server {} setup done", id);
        Ok(core)
    }

    /// Spawns the background task serving this server's own urgent-commit
    /// event (used when no global coordinator is plugged in).
    fn spawn_bg_append_task(&self) {
        let notify = self.bg_append_notify.clone();
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            pf_debug!("urgent commit background task spawned");
            loop {
                notify.notified().await;
                match me.upgrade() {
                    Some(core) => {
                        let _guard = core.core_lock.lock().await;
                        core.request_append_entries();
                    }
                    None => break,
                }
            }
        });
        *self.bg_append_task.lock().unwrap() = Some(task);
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Configuration parameters.
    pub fn params(&self) -> &RaftParams {
        &self.params
    }

    /// Current role.
    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }

    /// True if currently leader.
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Latest term seen.
    pub fn current_term(&self) -> Term {
        self.curr_term.load(Ordering::Acquire)
    }

    /// Current known leader ID.
    pub fn leader_id(&self) -> ReplicaId {
        self.leader.load(Ordering::Acquire)
    }

    /// Records the leader known from the election module.
    pub fn set_leader_id(&self, leader: ReplicaId) {
        self.leader.store(leader, Ordering::Release);
    }

    /// True if writes are currently refused.
    pub fn write_paused(&self) -> bool {
        self.write_paused.load(Ordering::Acquire)
    }

    /// Refuses client writes while still holding office.
    pub fn pause_writes(&self) {
        self.write_paused.store(true, Ordering::Release);
    }

    /// Accepts client writes again.
    pub fn resume_writes(&self) {
        self.write_paused.store(false, Ordering::Release);
    }

    /// Highest log index applied to the state machine.
    pub fn sm_commit_index(&self) -> LogIndex {
        self.sm_commit_index.load(Ordering::Acquire)
    }

    /// Highest log index pre-committed into the state machine.
    pub fn precommit_index(&self) -> LogIndex {
        self.precommit_index.load(Ordering::Acquire)
    }

    /// Advances the pre-commit index monotonically.
    pub(crate) fn try_update_precommit_index(&self, index: LogIndex) {
        self.precommit_index.fetch_max(index, Ordering::AcqRel);
    }

    /// Active cluster configuration snapshot.
    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.cluster.read().unwrap().clone()
    }

    /// Replaces the RPC client factory used for future reconnects.
    pub fn set_rpc_factory(&self, factory: Arc<dyn RpcClientFactory>) {
        *self.ctx.rpc_factory.lock().unwrap() = Some(factory);
    }

    /// Outstanding synchronous client waiters.
    pub fn commit_waiters(&self) -> &CommitWaiterRegistry {
        &self.waiters
    }

    /// The dispatcher for the given peer, if it is a member.
    pub fn peer(&self, id: ReplicaId) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(&id).cloned()
    }

    /// Snapshot of all peer dispatchers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Majority quorum size of the current member set.
    pub fn quorum_size(&self) -> usize {
        let population = self.peers.read().unwrap().len() + 1;
        population / 2 + 1
    }

    /// Takes office as leader for the given term: resets peer replication
    /// cursors and starts per-peer heartbeat tasks.
    pub fn become_leader(&self, term: Term) {
        self.curr_term.store(term, Ordering::Release);
        self.leader.store(self.id, Ordering::Release);
        self.set_role(Role::Leader);

        let next_slot = self.log_store.next_slot();
        for peer in self.peers() {
            peer.set_next_log_idx(next_slot);
            peer.set_matched_log_idx(0);
            self.start_peer_heartbeat(&peer);
        }
        pf_info!("elected to be leader with term {}", term);
    }

    /// Converts back to follower (e.g. upon seeing a higher term) and drains
    /// all pending commit waiters to `CANCELLED`.
    pub fn step_down(&self, new_term: Term) {
        self.curr_term.fetch_max(new_term, Ordering::AcqRel);
        if self.role() != Role::Follower {
            pf_info!("converted back to follower at term {}", new_term);
        }
        self.set_role(Role::Follower);
        self.drop_all_pending_commit_elems();
    }

    /// Drains all pending commit waiters, honoring the return method.
    pub fn drop_all_pending_commit_elems(&self) {
        self.waiters.drop_all_pending(self.params.return_method);
    }

    /// Checks whether leadership still appears valid: leader role, writes
    /// not paused, and a majority of the cluster recently active.
    pub fn check_leadership_validity(&self) -> bool {
        if self.role() != Role::Leader || self.write_paused() {
            return false;
        }
        let fresh_window_ms = self.params.max_hb_interval_ms * 2;
        let fresh = self
            .peers()
            .iter()
            .filter(|p| {
                !p.is_abandoned()
                    && p.millis_since_active() <= fresh_window_ms
            })
            .count()
            + 1; // myself
        fresh >= self.quorum_size()
    }

    fn start_peer_heartbeat(&self, peer: &Arc<Peer>) {
        let me = self.me.clone();
        let peer_ref = peer.clone();
        let task = tokio::spawn(async move {
            pf_debug!("heartbeat task for peer {} spawned", peer_ref.id());
            loop {
                let interval_ms = peer_ref.current_hb_interval_ms();
                time::sleep(Duration::from_millis(interval_ms)).await;

                let core = match me.upgrade() {
                    Some(core) => core,
                    None => break,
                };
                if peer_ref.is_abandoned() || !core.is_leader() {
                    break;
                }
                core.send_append_request(&peer_ref);
            }
            pf_debug!("heartbeat task for peer {} exited", peer_ref.id());
        });
        peer.set_hb_task(task);
    }

    /// Urgent commit: requests an AppendEntries fan-out to all peers right
    /// away, bypassing the heartbeat schedule.
    pub(crate) async fn request_append_entries_for_all(&self) {
        if self.params.use_bg_thread_for_urgent_commit {
            let coordinator = self.coordinator.lock().unwrap().clone();
            if let Some(coordinator) = coordinator {
                pf_trace!("found global urgent commit coordinator");
                if let Some(me) = self.me.upgrade() {
                    coordinator.request_append(me);
                }
            } else {
                self.bg_append_notify.notify_one();
            }
        } else {
            // directly generate requests on the caller's task
            let _guard = self.core_lock.lock().await;
            self.request_append_entries();
        }
    }

    /// One fan-out round under the server-core lock; entry point used by the
    /// global coordinator.
    pub(crate) async fn append_entries_fanout(&self) {
        let _guard = self.core_lock.lock().await;
        self.request_append_entries();
    }

    /// Sends AppendEntries to every peer whose pipeline slot is free.
    fn request_append_entries(&self) {
        for peer in self.peers() {
            self.send_append_request(&peer);
        }
    }

    /// Builds and sends one AppendEntries RPC to the given peer, recreating
    /// the connection under backoff if it is gone. Skips silently if the
    /// peer's pipeline slot is occupied.
    pub(crate) fn send_append_request(&self, peer: &Arc<Peer>) {
        if peer.is_abandoned() {
            return;
        }
        if peer.rpc_is_null() {
            match peer.recreate_rpc() {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    pf_error!(
                        "error recreating rpc for peer {}: {}",
                        peer.id(),
                        e
                    );
                    return;
                }
            }
        }
        if !peer.make_busy() {
            pf_trace!("peer {} rpc pipeline busy, skip", peer.id());
            return;
        }

        let term = self.current_term();
        let next_idx = peer.next_log_idx();
        let mut entries = self
            .log_store
            .entries_in_range(next_idx, self.log_store.next_slot());
        entries.truncate(self.params.max_append_entries);

        let last_log_index = next_idx - 1;
        let last_log_term = if last_log_index > 0 {
            self.log_store
                .entry_at(last_log_index)
                .map(|e| e.term)
                .unwrap_or(0)
        } else {
            0
        };

        let req = ReqMsg {
            msg_type: MsgType::AppendEntriesRequest,
            term,
            src: self.id,
            dst: peer.id(),
            last_log_index,
            last_log_term,
            commit_index: self.sm_commit_index(),
            entries,
        };

        let me = self.me.clone();
        let peer_id = peer.id();
        let handler: RpcHandler = Box::new(move |result| {
            if let Some(core) = me.upgrade() {
                core.handle_append_entries_result(peer_id, result);
            }
        });
        peer.send_req(req, handler, false);
    }

    /// Handles the outcome of one AppendEntries RPC: advances the peer's
    /// replication cursors on acceptance (possibly advancing commit), walks
    /// the cursor back on rejection, and steps down upon seeing a higher
    /// term.
    fn handle_append_entries_result(
        &self,
        peer_id: ReplicaId,
        result: Result<RespMsg, LodestoneError>,
    ) {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                // connection reset and backoff are already handled by the
                // peer dispatcher
                pf_warn!(
                    "append_entries rpc to peer {} failed: {}",
                    peer_id,
                    e
                );
                return;
            }
        };

        if resp.term > self.current_term() {
            pf_info!(
                "saw higher term {} from peer {}",
                resp.term,
                peer_id
            );
            self.step_down(resp.term);
            return;
        }
        if resp.msg_type != MsgType::AppendEntriesResponse {
            pf_warn!(
                "unexpected response type {:?} from peer {}",
                resp.msg_type,
                peer_id
            );
            return;
        }
        let peer = match self.peer(peer_id) {
            Some(peer) => peer,
            None => return,
        };

        if resp.accepted {
            let next = resp.accepted_index;
            if next > 0 {
                peer.set_matched_log_idx(next - 1);
                if peer.next_log_idx() < next {
                    peer.set_next_log_idx(next);
                }
            }
            self.try_advance_commit();
        } else {
            // follower rejected; walk the cursor back and retry on the next
            // heartbeat or urgent commit
            let next = peer.next_log_idx();
            if next > 1 {
                peer.set_next_log_idx(next - 1);
            }
        }
    }

    /// Scans the match cursors for a quorum-replicated index and applies all
    /// newly committed entries in log-index order, resolving their waiters.
    /// Only entries of the current term decide commit.
    fn try_advance_commit(&self) {
        let _guard = self.commit_lock.lock().unwrap();

        let mut matched: Vec<LogIndex> =
            self.peers().iter().map(|p| p.matched_log_idx()).collect();
        matched.push(self.log_store.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched
            .get(self.quorum_size() - 1)
            .copied()
            .unwrap_or(0);

        let old_commit = self.sm_commit_index();
        let mut new_commit = old_commit;
        for index in (old_commit + 1)..=candidate {
            match self.log_store.entry_at(index) {
                // cannot decide commit using a non-latest term
                Some(entry) if entry.term == self.current_term() => {
                    new_commit = index;
                }
                Some(_) => continue,
                None => break,
            }
        }

        for index in (old_commit + 1)..=new_commit {
            self.commit_entry(index);
        }
    }

    /// Applies one committed entry to the state machine and resolves its
    /// commit waiter (synchronous replication only).
    fn commit_entry(&self, log_index: LogIndex) {
        let entry = match self.log_store.entry_at(log_index) {
            Some(entry) => entry,
            None => {
                pf_error!("commit index {} beyond stored log", log_index);
                return;
            }
        };
        let result =
            match self.state_machine.commit(log_index, &entry.payload) {
                Ok(value) => value,
                Err(e) => {
                    pf_error!(
                        "state machine commit failed at {}: {}",
                        log_index,
                        e
                    );
                    None
                }
            };
        self.sm_commit_index.store(log_index, Ordering::Release);
        pf_debug!("committed log index {}", log_index);

        if !self.cluster_config().async_replication {
            self.waiters.fulfill(
                log_index,
                ResultCode::Ok,
                result,
                self.params.return_method,
            );
        }
    }

    /// Shuts the server down: refuses further writes, drains all pending
    /// waiters, abandons every peer dispatcher, and stops background tasks.
    pub fn shutdown(&self) {
        pf_info!("server {} shutting down", self.id);
        self.pause_writes();
        self.set_role(Role::Follower);
        self.drop_all_pending_commit_elems();
        for peer in self.peers() {
            peer.shutdown();
        }
        if let Some(task) = self.bg_append_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
