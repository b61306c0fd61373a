//! Worker: the unit of execution bound to one accepted socket.
//!
//! A worker is a long-lived task. While pooled it blocks on its assignment
//! channel; each assignment hands it one accepted socket, which it serves
//! through possibly many keep-alive request cycles. Afterwards it either
//! returns its handle to the worker pool and waits for the next socket, or
//! terminates if the pool is full. Administrative stop cancels the worker's
//! token at any point; a dead worker is never reused.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::Application;
use crate::server::connection::Connection;
use crate::server::handler::{CycleControl, CycleOutcome, RequestHandler};
use crate::server::pool::Pool;
use crate::server::protocol::{CycleError, OutboundMessage};
use crate::session::SessionStore;

// ========================================
// WORKER STATE
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    WaitingOnSocket,
    Processing,
    Pooled,
    Dead,
}

struct WorkerStatus {
    state: WorkerState,
    processing_since: Option<Instant>,
}

/// Shared view of one worker, registered with the watchdog.
pub struct WorkerMonitor {
    id: u64,
    status: Mutex<WorkerStatus>,
    cancel: CancellationToken,
}

impl WorkerMonitor {
    fn new(id: u64, cancel: CancellationToken) -> Self {
        Self {
            id,
            status: Mutex::new(WorkerStatus {
                state: WorkerState::NotStarted,
                processing_since: None,
            }),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.status.lock().state
    }

    /// How long the current request has been running, when Processing.
    pub fn processing_for(&self) -> Option<Duration> {
        let status = self.status.lock();
        match status.state {
            WorkerState::Processing => status.processing_since.map(|t| t.elapsed()),
            _ => None,
        }
    }

    fn set(&self, state: WorkerState) {
        let mut status = self.status.lock();
        // Dead is terminal.
        if status.state == WorkerState::Dead {
            return;
        }
        status.processing_since = match state {
            WorkerState::Processing => Some(Instant::now()),
            _ => None,
        };
        status.state = state;
    }

    pub fn is_dead(&self) -> bool {
        self.state() == WorkerState::Dead
    }

    /// Administrative stop: interrupt whatever the worker is doing and mark
    /// it unusable.
    pub fn stop(&self) {
        self.set(WorkerState::Dead);
        self.cancel.cancel();
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[cfg(test)]
impl WorkerMonitor {
    pub(crate) fn for_tests(id: u64, state: WorkerState) -> Arc<Self> {
        let monitor = Arc::new(Self::new(id, CancellationToken::new()));
        monitor.set(state);
        monitor
    }

    /// Pretend the current request started `by` ago.
    pub(crate) fn backdate_processing(&self, by: Duration) {
        let mut status = self.status.lock();
        status.processing_since = Some(Instant::now() - by);
    }
}

// ========================================
// REGISTRY
// ========================================

/// Every worker ever created, pooled or overflow. The watchdog scans this.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<Arc<WorkerMonitor>>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add(&self, monitor: Arc<WorkerMonitor>) {
        self.workers.lock().push(monitor);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.workers.lock().retain(|m| m.id != id);
    }

    pub fn snapshot(&self) -> Vec<Arc<WorkerMonitor>> {
        self.workers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Stop every registered worker and clear the registry.
    pub fn stop_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for monitor in drained {
            monitor.stop();
        }
    }
}

// ========================================
// SHARED SERVICES
// ========================================

/// Everything a worker needs, owned by the connector and passed by Arc.
pub struct ServerShared {
    pub connections: Pool<Connection>,
    pub handlers: Pool<RequestHandler>,
    pub workers: OnceCell<Pool<WorkerHandle>>,
    pub registry: WorkerRegistry,
    pub app: Arc<dyn Application>,
    pub sessions: Arc<dyn SessionStore>,
}

impl ServerShared {
    pub fn worker_pool(&self) -> &Pool<WorkerHandle> {
        self.workers.get().expect("worker pool initialized at startup")
    }
}

// ========================================
// HANDLE
// ========================================

/// Pooled handle used by acceptors to hand a socket to a worker.
pub struct WorkerHandle {
    tx: mpsc::Sender<TcpStream>,
    monitor: Arc<WorkerMonitor>,
}

impl WorkerHandle {
    /// Hand off a socket. On refusal (worker dead or mid-shutdown) the
    /// socket comes back so the caller can try a fresh worker.
    pub fn assign(&self, socket: TcpStream) -> Result<(), TcpStream> {
        if self.monitor.is_dead() {
            return Err(socket);
        }
        self.tx.try_send(socket).map_err(|err| match err {
            mpsc::error::TrySendError::Full(socket)
            | mpsc::error::TrySendError::Closed(socket) => socket,
        })
    }

    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }
}

// ========================================
// WORKER TASK
// ========================================

/// Spawn a worker task and return its pooled handle.
pub fn spawn_worker(shared: &Arc<ServerShared>) -> WorkerHandle {
    let id = shared.registry.next_id();
    let cancel = CancellationToken::new();
    let monitor = Arc::new(WorkerMonitor::new(id, cancel));
    shared.registry.add(monitor.clone());

    let (tx, rx) = mpsc::channel(1);
    let handle = WorkerHandle {
        tx: tx.clone(),
        monitor: monitor.clone(),
    };

    let shared = shared.clone();
    tokio::spawn(run_worker(shared, monitor, tx, rx));
    handle
}

async fn run_worker(
    shared: Arc<ServerShared>,
    monitor: Arc<WorkerMonitor>,
    tx: mpsc::Sender<TcpStream>,
    mut rx: mpsc::Receiver<TcpStream>,
) {
    monitor.set(WorkerState::WaitingOnSocket);

    loop {
        let socket = tokio::select! {
            _ = monitor.cancelled() => break,
            socket = rx.recv() => match socket {
                Some(socket) => socket,
                None => break,
            },
        };

        monitor.set(WorkerState::Processing);
        serve_socket(&shared, &monitor, socket).await;

        if monitor.is_dead() {
            break;
        }

        // Try to go back to the pool for the next assignment.
        monitor.set(WorkerState::Pooled);
        let handle = WorkerHandle {
            tx: tx.clone(),
            monitor: monitor.clone(),
        };
        if !shared.worker_pool().release(handle) {
            tracing::debug!(worker = monitor.id(), "worker pool full; terminating");
            break;
        }
    }

    monitor.stop();
    shared.registry.remove(monitor.id());
    tracing::trace!(worker = monitor.id(), "worker exited");
}

/// Serve one accepted socket through its whole life cycle.
async fn serve_socket(shared: &Arc<ServerShared>, monitor: &Arc<WorkerMonitor>, socket: TcpStream) {
    let mut conn = shared.connections.acquire();
    conn.attach(socket);
    let peer = conn.peer();
    let mut handler_slot: Option<RequestHandler> = None;

    tracing::debug!(worker = monitor.id(), ?peer, "socket assigned");

    loop {
        let result = tokio::select! {
            _ = monitor.cancelled() => {
                Err(CycleError::Io(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "worker stopped",
                )))
            }
            result = serve_cycle(&mut conn, &mut handler_slot, shared) => result,
        };

        match result {
            Ok(CycleControl::KeepAlive) => {
                conn.reset_connection(handler_slot.take(), &shared.handlers).await;
            }
            Ok(CycleControl::Close) => break,
            Err(err) if err.recoverable() => {
                tracing::warn!(
                    worker = monitor.id(),
                    ?peer,
                    error = %err,
                    "recoverable protocol error; keeping the connection"
                );
                // Best effort: close out the aborted cycle for the proxy.
                let _ = conn.send(OutboundMessage::EndResponse { reuse: true }).await;
                conn.reset_connection(handler_slot.take(), &shared.handlers).await;
            }
            Err(err) => {
                tracing::debug!(
                    worker = monitor.id(),
                    ?peer,
                    error = %err,
                    "connection torn down"
                );
                let _ = conn.send(OutboundMessage::EndResponse { reuse: false }).await;
                break;
            }
        }
    }

    conn.reset_connection(handler_slot.take(), &shared.handlers).await;
    conn.detach();
    shared.connections.release(conn);
    tracing::debug!(worker = monitor.id(), ?peer, "socket released");
}

async fn serve_cycle(
    conn: &mut Connection,
    slot: &mut Option<RequestHandler>,
    shared: &Arc<ServerShared>,
) -> Result<CycleControl, CycleError> {
    let outcome = conn
        .process_request(slot, &shared.handlers, shared.app.as_ref(), shared.sessions.as_ref())
        .await?;
    match outcome {
        CycleOutcome::Request => conn.create_response(slot).await,
        CycleOutcome::Ping => Ok(CycleControl::KeepAlive),
        CycleOutcome::Shutdown => Ok(CycleControl::Close),
    }
}
