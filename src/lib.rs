//! Public interface to the lodestone core library.
//!
//! Lodestone implements the leader-side client request pipeline of a
//! Raft-style replicated state machine: durable local append, state machine
//! pre-commit, urgent AppendEntries fan-out to peers, and a synchronous or
//! asynchronous completion contract back to the client that survives
//! timeouts, loss of leadership, and cancellation.

#[macro_use]
mod utils;

mod server;

pub use crate::server::debug;
pub use crate::server::{
    decode_leader_status, next_generation_id, AfterPrecommitFn, AsyncResult,
    CbContext, CbParams, CbReturn, ClientRequest, ClientResponse,
    ClusterConfig,
    CommitWaiter, CommitWaiterRegistry, EchoStateMachine, EntryType,
    EventCallbacks, GlobalCoordinator, LockingMethod, LogEntry, LogIndex,
    LogStore, MemLogStore, MsgType, NoopCallbacks, Peer, PeerConfig,
    RaftCore, RaftParams, ReplicaId, ReqExtCbParams, ReqExtParams, ReqMsg,
    RespMsg, ResultCode, ReturnMethod, Role, RpcClient, RpcClientFactory,
    RpcHandler, RpcService, StateMachine, TcpRpcClient, TcpRpcFactory,
    TcpRpcServer, Term,
};
pub use crate::utils::LodestoneError;
