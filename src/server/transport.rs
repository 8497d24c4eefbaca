//! RPC client seam used by the per-peer dispatcher, with a framed-TCP
//! implementation (8-byte big-endian length prefix + MessagePack body).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use get_size::GetSize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::server::{ReqMsg, RespMsg};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, LodestoneError,
};

/// Monotonic source of connection generation IDs, unique process-wide so
/// that responses can always be matched against the connection instance that
/// was live at send time.
static NEXT_GENERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Draws the next unique connection generation ID.
pub fn next_generation_id() -> u64 {
    NEXT_GENERATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One connection instance to a peer. A fresh handle carries a fresh
/// generation ID; the ID never changes for the lifetime of the handle.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// This connection instance's unique generation ID.
    fn generation_id(&self) -> u64;

    /// Sends the request and awaits its response.
    async fn send(&self, req: ReqMsg) -> Result<RespMsg, LodestoneError>;
}

/// Factory producing connection instances toward a given endpoint.
pub trait RpcClientFactory: Send + Sync {
    /// Creates a new (lazily connecting) client handle.
    fn create_client(
        &self,
        endpoint: &str,
    ) -> Result<Arc<dyn RpcClient>, LodestoneError>;
}

/// Established connection state of a `TcpRpcClient`.
struct ClientConn {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
}

/// Framed-TCP RPC client. Connects lazily on first send; any IO error
/// discards the connection so the owner is forced to recreate the handle.
pub struct TcpRpcClient {
    endpoint: String,
    generation_id: u64,
    conn: Mutex<Option<ClientConn>>,
}

impl TcpRpcClient {
    /// Creates a lazily-connecting client toward the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        TcpRpcClient {
            endpoint: endpoint.into(),
            generation_id: next_generation_id(),
            conn: Mutex::new(None),
        }
    }

    /// Writes one framed request, waiting out would-block conditions.
    async fn send_frame(
        conn: &mut ClientConn,
        req: &ReqMsg,
    ) -> Result<(), LodestoneError> {
        let mut sent = safe_tcp_write(
            &mut conn.write_buf,
            &mut conn.write_buf_cursor,
            &conn.write_half,
            Some(req),
        )?;
        while !sent {
            conn.write_half.writable().await?;
            sent = safe_tcp_write(
                &mut conn.write_buf,
                &mut conn.write_buf_cursor,
                &conn.write_half,
                None::<&ReqMsg>,
            )?;
        }
        Ok(())
    }

    async fn exchange(
        conn: &mut ClientConn,
        req: &ReqMsg,
    ) -> Result<RespMsg, LodestoneError> {
        Self::send_frame(conn, req).await?;
        safe_tcp_read(&mut conn.read_buf, &mut conn.read_half).await
    }
}

#[async_trait]
impl RpcClient for TcpRpcClient {
    fn generation_id(&self) -> u64 {
        self.generation_id
    }

    async fn send(&self, req: ReqMsg) -> Result<RespMsg, LodestoneError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let addr: SocketAddr = self.endpoint.parse()?;
            let stream = tcp_connect_with_retry(addr, 0).await?;
            let (read_half, write_half) = stream.into_split();
            *guard = Some(ClientConn {
                read_half,
                write_half,
                read_buf: BytesMut::with_capacity(8 + 1024),
                write_buf: BytesMut::with_capacity(8 + 1024),
                write_buf_cursor: 0,
            });
            pf_debug!("connected to endpoint '{}'", self.endpoint);
        }

        pf_trace!("sending {:?} ({} B)", req.msg_type, req.get_size());
        let result = {
            let conn = guard.as_mut().unwrap();
            Self::exchange(conn, &req).await
        };
        if result.is_err() {
            // do not re-use a socket after any IO error
            *guard = None;
        }
        result
    }
}

/// Factory for `TcpRpcClient` handles.
pub struct TcpRpcFactory;

impl RpcClientFactory for TcpRpcFactory {
    fn create_client(
        &self,
        endpoint: &str,
    ) -> Result<Arc<dyn RpcClient>, LodestoneError> {
        Ok(Arc::new(TcpRpcClient::new(endpoint)))
    }
}

/// Request handler function plugged into a `TcpRpcServer`.
pub type RpcService = Arc<dyn Fn(ReqMsg) -> RespMsg + Send + Sync>;

/// Minimal framed-TCP RPC server: accepts connections and answers each
/// request through the plugged-in service function. Mainly used to receive
/// the dispatcher's RPCs on the follower side and in tests.
pub struct TcpRpcServer {
    local_addr: SocketAddr,
    acceptor_handle: JoinHandle<()>,
}

impl TcpRpcServer {
    /// Binds the listener and spawns the acceptor task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        service: RpcService,
    ) -> Result<Self, LodestoneError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        let acceptor_handle =
            tokio::spawn(Self::acceptor_task(listener, service));
        Ok(TcpRpcServer {
            local_addr,
            acceptor_handle,
        })
    }

    /// Actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn acceptor_task(
        listener: tokio::net::TcpListener,
        service: RpcService,
    ) {
        pf_debug!("rpc acceptor task spawned on '{}'", listener.local_addr().unwrap());
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!("accepted rpc connection from '{}'", addr);
                    tokio::spawn(Self::servant_task(stream, service.clone()));
                }
                Err(e) => {
                    pf_warn!("error accepting rpc connection: {}", e);
                }
            }
        }
    }

    async fn servant_task(stream: TcpStream, service: RpcService) {
        let (mut read_half, write_half) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf_cursor = 0;

        loop {
            let req: ReqMsg =
                match safe_tcp_read(&mut read_buf, &mut read_half).await {
                    Ok(req) => req,
                    Err(_) => break, // probably the peer closed the conn
                };

            let resp = service(req);
            let mut sent = match safe_tcp_write(
                &mut write_buf,
                &mut write_buf_cursor,
                &write_half,
                Some(&resp),
            ) {
                Ok(sent) => sent,
                Err(_) => break,
            };
            while !sent {
                if write_half.writable().await.is_err() {
                    return;
                }
                sent = match safe_tcp_write(
                    &mut write_buf,
                    &mut write_buf_cursor,
                    &write_half,
                    None::<&RespMsg>,
                ) {
                    Ok(sent) => sent,
                    Err(_) => return,
                };
            }
        }
    }
}

impl Drop for TcpRpcServer {
    fn drop(&mut self) {
        self.acceptor_handle.abort();
    }
}
