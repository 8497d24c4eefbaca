//! Optional process-wide coordinator that batches urgent-commit fan-out work
//! across many server instances sharing one process.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::server::RaftCore;

/// Process-wide urgent-commit coordinator. Servers configured with the
/// background urgent-commit flag enqueue themselves here instead of fanning
/// out inline; a worker task drains the queue.
pub struct GlobalCoordinator {
    /// Sender side of the append request channel.
    tx_append: mpsc::UnboundedSender<Arc<RaftCore>>,

    /// Join handle of the worker task.
    _worker_handle: JoinHandle<()>,
}

impl GlobalCoordinator {
    /// Creates the coordinator and spawns its worker task.
    pub fn new_and_setup() -> Arc<Self> {
        let (tx_append, mut rx_append) =
            mpsc::unbounded_channel::<Arc<RaftCore>>();

        let worker_handle = tokio::spawn(async move {
            pf_debug!("urgent commit worker task spawned");
            while let Some(server) = rx_append.recv().await {
                server.append_entries_fanout().await;
            }
            // channel gets closed and no requests remain
            pf_debug!("urgent commit worker task exited");
        });

        Arc::new(GlobalCoordinator {
            tx_append,
            _worker_handle: worker_handle,
        })
    }

    /// Enqueues a server for an append_entries fan-out round.
    pub fn request_append(&self, server: Arc<RaftCore>) {
        if let Err(e) = self.tx_append.send(server) {
            pf_error!("error enqueueing urgent commit request: {}", e);
        }
    }
}
