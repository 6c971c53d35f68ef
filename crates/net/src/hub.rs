//! Broadcast hub
//!
//! The hub owns the listening socket and the registry of live
//! connections. Every well-formed line a peer sends is relayed to every
//! registered peer, the sender included; clients filter their own frames.
//!
//! Outbound queues are unbounded. A stalled peer's queue grows until its
//! socket fails or it disconnects.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::Result;
use crate::session::Session;

/// One encoded envelope, shared between every outbound queue
pub type Line = Arc<str>;

/// Identity of an accepted socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

struct RegistryState {
    peers: HashMap<ConnId, mpsc::UnboundedSender<Line>>,
    closed: bool,
}

/// Live connection set
///
/// `join`, `leave` and `broadcast` may run concurrently from any task or
/// thread. Broadcast copies the sender list under the lock and writes
/// outside it, so a peer joining mid-broadcast misses that line and a
/// peer leaving mid-broadcast gets at most one best-effort copy.
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                peers: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Nothing panics while holding the lock; recover the data regardless
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an outbound queue. Refused once the registry is closed.
    pub fn join(&self, id: ConnId, tx: mpsc::UnboundedSender<Line>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.peers.insert(id, tx);
        true
    }

    /// Deregister a connection. Returns `true` only for the call that
    /// actually removed it.
    pub fn leave(&self, id: ConnId) -> bool {
        self.lock().peers.remove(&id).is_some()
    }

    /// Queue `line` for every registered peer except `exclude`
    ///
    /// Returns the number of queues that accepted the line.
    pub fn broadcast(&self, line: &Line, exclude: Option<ConnId>) -> usize {
        let targets: Vec<(ConnId, mpsc::UnboundedSender<Line>)> = {
            let state = self.lock();
            state
                .peers
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(line.clone()).is_err() {
                warn!(conn = %id, "Failed to queue line for peer");
            } else {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().peers.contains_key(&id)
    }

    /// Drop every queue and refuse further joins. Returns how many were open.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let count = state.peers.len();
        state.peers.clear();
        count
    }
}

struct Running {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Hub handle with an owned lifecycle
///
/// Dropping a started hub without calling [`Hub::stop`] still shuts the
/// accept loop down, without waiting for it.
pub struct Hub {
    config: HubConfig,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind and begin accepting. Returns the bound address; a second call
    /// while running returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            debug!(addr = %r.addr, "Hub already running");
            return Ok(r.addr);
        }

        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        let addr = listener.local_addr()?;
        let registry = Arc::new(Registry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            shutdown_rx,
            self.config.max_line_bytes,
        ));

        info!(addr = %addr, "Hub started");

        *running = Some(Running {
            addr,
            registry,
            shutdown_tx,
            accept_task,
        });
        Ok(addr)
    }

    /// Close every connection and the listener. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.accept_task.await {
            error!(error = %e, "Accept loop ended abnormally");
        }

        info!(addr = %running.addr, "Hub stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Number of currently registered connections
    pub async fn peer_count(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(0, |r| r.registry.len())
    }
}

/// Accept connections until shutdown, then tear down every session
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_line_bytes: usize,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let session = Session::new(addr, registry.clone(), max_line_bytes);
                        sessions.spawn(session.run(stream));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "Session task panicked");
                    }
                }
            }
            // A dropped sender counts as shutdown too
            _ = shutdown_rx.changed() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }

    drop(listener);
    let closed = registry.close();
    debug!(connections = closed, "Closed connection registry");

    // Sessions blocked on a stalled write would not notice the closed queue
    sessions.shutdown().await;
}
