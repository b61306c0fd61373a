//! Connector: listening socket, acceptor crew, lifecycle supervisor.
//!
//! Start-up initializes the three pools and the watchdog before any
//! acceptor runs. Shutdown reverses it: watchdog first, then every tracked
//! worker, then the pools, and only then the acceptors and the listening
//! socket, so no worker is ever serving a socket that is about to
//! disappear. A watchdog restart event triggers stop-then-start.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::Application;
use crate::config::Config;
use crate::server::connection::Connection;
use crate::server::handler::RequestHandler;
use crate::server::pool::Pool;
use crate::server::watchdog::{Watchdog, WatchdogEvent};
use crate::server::worker::{spawn_worker, ServerShared, WorkerRegistry};
use crate::session::SessionStore;

struct Running {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    watchdog_token: CancellationToken,
    accept_token: CancellationToken,
    watchdog_task: JoinHandle<()>,
    acceptor_tasks: Vec<JoinHandle<()>>,
    events: mpsc::Receiver<WatchdogEvent>,
}

pub struct Connector {
    config: Config,
    app: Arc<dyn Application>,
    sessions: Arc<dyn SessionStore>,
    running: Option<Running>,
}

impl Connector {
    pub fn new(config: Config, app: Arc<dyn Application>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            config,
            app,
            sessions,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while running. Useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    fn build_shared(&self) -> Arc<ServerShared> {
        let route_tag = self.config.server.route_tag.clone();
        let encoding = self.config.protocol.encoding;

        let shared = Arc::new(ServerShared {
            connections: Pool::new(self.config.pools.connections, Connection::new),
            handlers: Pool::new(self.config.pools.handlers, move || {
                RequestHandler::new(route_tag.clone(), encoding)
            }),
            workers: OnceCell::new(),
            registry: WorkerRegistry::new(),
            app: self.app.clone(),
            sessions: self.sessions.clone(),
        });

        // The worker factory spawns into the shared state it lives in; a weak
        // reference keeps the ownership acyclic.
        let worker_shared = Arc::downgrade(&shared);
        let workers = Pool::new(self.config.pools.workers, move || {
            let shared = worker_shared.upgrade().expect("connector shared state alive");
            spawn_worker(&shared)
        });
        let _ = shared.workers.set(workers);
        shared
    }

    pub async fn start(&mut self) -> io::Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        // Pools and watchdog come up before the first accept.
        let shared = self.build_shared();
        shared.connections.prefill();
        shared.handlers.prefill();
        shared.worker_pool().prefill();

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = Arc::new(TcpListener::bind(&addr).await?);
        let local_addr = listener.local_addr()?;

        let watchdog_token = CancellationToken::new();
        let (events_tx, events) = mpsc::channel(1);
        let watchdog = Watchdog::new(shared.clone(), self.config.watchdog.clone(), events_tx);
        let watchdog_task = tokio::spawn(watchdog.run(watchdog_token.clone()));

        let accept_token = CancellationToken::new();
        let acceptor_tasks = (0..self.config.server.acceptors.max(1))
            .map(|idx| {
                tokio::spawn(acceptor_loop(
                    idx,
                    listener.clone(),
                    shared.clone(),
                    accept_token.clone(),
                ))
            })
            .collect();

        tracing::info!(
            addr = %local_addr,
            acceptors = self.config.server.acceptors.max(1),
            workers = shared.worker_pool().idle(),
            "connector listening"
        );

        self.running = Some(Running {
            shared,
            local_addr,
            watchdog_token,
            accept_token,
            watchdog_task,
            acceptor_tasks,
            events,
        });
        Ok(())
    }

    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!(addr = %running.local_addr, "connector stopping");

        running.watchdog_token.cancel();
        let _ = running.watchdog_task.await;

        // Workers go down before the listener does.
        running.shared.registry.stop_all();
        running.shared.worker_pool().drain();
        running.shared.handlers.drain();
        running.shared.connections.drain();

        running.accept_token.cancel();
        for task in running.acceptor_tasks {
            let _ = task.await;
        }
        // Last listener Arc dropped with the acceptors; the socket is closed.
        tracing::info!("connector stopped");
    }

    pub async fn restart(&mut self) -> io::Result<()> {
        tracing::warn!("restarting connector");
        self.stop().await;
        self.start().await
    }

    /// Start and supervise until the shutdown token fires. Watchdog restart
    /// events are acted on here.
    pub async fn run(&mut self, shutdown: CancellationToken) -> io::Result<()> {
        self.start().await?;

        loop {
            let event = {
                let Some(running) = self.running.as_mut() else {
                    break;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    event = running.events.recv() => event,
                }
            };

            match event {
                Some(WatchdogEvent::Restart) => {
                    tracing::error!("watchdog requested a full connector restart");
                    self.restart().await?;
                }
                None => {
                    self.stop().await;
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn acceptor_loop(
    idx: usize,
    listener: Arc<TcpListener>,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                if let Err(err) = socket.set_nodelay(true) {
                    tracing::debug!(acceptor = idx, %peer, error = %err, "set_nodelay failed");
                }
                tracing::trace!(acceptor = idx, %peer, "accepted connection");

                let handle = shared.worker_pool().acquire();
                if let Err(socket) = handle.assign(socket) {
                    // The pooled candidate refused (mid-shutdown); a fresh
                    // worker takes the socket instead.
                    tracing::debug!(acceptor = idx, %peer, "pooled worker refused; spawning fresh");
                    let fresh = spawn_worker(&shared);
                    if fresh.assign(socket).is_err() {
                        tracing::warn!(acceptor = idx, %peer, "fresh worker refused socket; dropping");
                    }
                }
            }
            Err(err) => {
                if shutdown.is_cancelled() {
                    break;
                }
                tracing::warn!(acceptor = idx, error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    tracing::trace!(acceptor = idx, "acceptor exiting");
}
