//! Lodestone's server functionality modules.

mod callback;
mod coordinator;
mod logstore;
mod message;
mod peer;
mod replica;
mod statemach;
mod transport;
mod waiter;

pub mod debug;

pub use callback::{
    CbContext, CbParams, CbReturn, EventCallbacks, NoopCallbacks,
};
pub use coordinator::GlobalCoordinator;
pub use logstore::{LogStore, MemLogStore};
pub use message::{
    decode_leader_status, EntryType, LogEntry, LogIndex, MsgType, ReplicaId,
    ReqMsg, RespMsg, ResultCode, Term,
};
pub use peer::{Peer, PeerConfig, RpcHandler};
pub use replica::{
    AfterPrecommitFn, ClientRequest, ClientResponse, ClusterConfig,
    LockingMethod, RaftCore, RaftParams, ReqExtCbParams, ReqExtParams,
    ReturnMethod, Role,
};
pub use statemach::{EchoStateMachine, StateMachine};
pub use transport::{
    next_generation_id, RpcClient, RpcClientFactory, RpcService,
    TcpRpcClient, TcpRpcFactory, TcpRpcServer,
};
pub use waiter::{AsyncResult, CommitWaiter, CommitWaiterRegistry};

pub(crate) use peer::ServerContext;
