//! Listening socket that turns inbound TCP connections into [`Connection`]s.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::{AcceptorConfig, ConnectionConfig};
use super::connection::Connection;
use super::registry::{Registry, Rejected, Uid, UidGenerator};
use super::state::AcceptorState;
use crate::Result;
use crate::error::NetworkError;

/// State shared between an acceptor and its accept loops.
struct AcceptorShared {
    state: Mutex<AcceptorState>,
    registry: Registry,
    uids: UidGenerator,
    /// Bumped on every stop request; loops end when it changes.
    stop_epoch: watch::Sender<u64>,
    active_loops: AtomicUsize,
}

impl AcceptorShared {
    fn set_state(&self, state: AcceptorState) {
        *self.state.lock() = state;
    }

    fn enter_async(&self) {
        self.active_loops.fetch_add(1, Ordering::SeqCst);
        self.set_state(AcceptorState::AcceptingAsync);
    }

    fn leave_async(&self, stopped: bool) {
        if self.active_loops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.set_state(if stopped {
                AcceptorState::Stopped
            } else {
                AcceptorState::Idle
            });
        }
    }

    fn request_stop(&self) {
        self.stop_epoch.send_modify(|epoch| *epoch += 1);
        if self.active_loops.load(Ordering::SeqCst) == 0 {
            self.set_state(AcceptorState::Stopped);
        }
    }
}

/// A bound TCP listener producing one [`Connection`] per inbound socket.
///
/// Connections can be taken one at a time with [`accept`](Self::accept),
/// which hands them straight to the caller, or in the background with
/// [`listen`](Self::listen), which greets each peer with its [`Uid`] and
/// keeps it in the acceptor's registry.
///
/// # Example
///
/// ```ignore
/// let acceptor = Acceptor::bind(Some(15001)).await?;
/// let accept_loop = acceptor.listen(10);
///
/// // ... later
/// for uid in acceptor.uids() {
///     acceptor.send_text_to(uid, "hello\n").await?;
/// }
///
/// acceptor.stop_listening();
/// let accepted = accept_loop.await.expect("accept loop panicked")?;
/// ```
pub struct Acceptor {
    config: AcceptorConfig,
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    shared: Arc<AcceptorShared>,
}

impl Acceptor {
    /// Bind on all interfaces, on `port` or on a free port chosen by the OS.
    pub async fn bind(port: Option<u16>) -> Result<Self> {
        Self::bind_with_config(AcceptorConfig::any_address(port)).await
    }

    /// Bind with the given configuration.
    pub async fn bind_with_config(config: AcceptorConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::bind(addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::bind(addr, e))?;

        tracing::info!(target: "networker::acceptor", "listening on {local_addr}");

        Ok(Self {
            config,
            listener: Arc::new(listener),
            local_addr,
            shared: Arc::new(AcceptorShared {
                state: Mutex::new(AcceptorState::Bound),
                registry: Registry::new(),
                uids: UidGenerator::new(),
                stop_epoch: watch::Sender::new(0),
                active_loops: AtomicUsize::new(0),
            }),
        })
    }

    /// Wait for one inbound socket and wrap it in a [`Connection`].
    ///
    /// The connection is returned to the caller and not registered.
    pub async fn accept(&self) -> Result<Connection> {
        self.shared.set_state(AcceptorState::AcceptingSync);
        let result = self.listener.accept().await;
        {
            let mut state = self.shared.state.lock();
            // A stop requested meanwhile wins.
            if *state == AcceptorState::AcceptingSync {
                *state = if self.shared.active_loops.load(Ordering::SeqCst) > 0 {
                    AcceptorState::AcceptingAsync
                } else {
                    AcceptorState::Idle
                };
            }
        }

        let (stream, peer_addr) = result.map_err(NetworkError::Accept)?;
        tracing::info!(target: "networker::acceptor", "accepted {peer_addr}");
        Connection::from_stream_with_config(stream, self.config.connection.clone()).await
    }

    /// Accept up to `max_connections` sockets in the background.
    ///
    /// Each accepted peer gets a receive loop, a [`Uid`] and the greeting line
    /// `UID: <n>`, and is then registered. The loop ends once
    /// `max_connections` sockets were accepted or
    /// [`stop_listening`](Self::stop_listening) is called; the handle yields
    /// the number of accepted sockets. An accept failure that was not caused
    /// by a stop request ends the loop with [`NetworkError::Accept`].
    ///
    /// Nothing prevents several loops from running at once.
    pub fn listen(&self, max_connections: usize) -> JoinHandle<Result<usize>> {
        let listener = self.listener.clone();
        let shared = self.shared.clone();
        let config = self.config.connection.clone();
        let stop_rx = shared.stop_epoch.subscribe();

        shared.enter_async();
        tracing::debug!(target: "networker::acceptor", "accept loop started (max {max_connections})");

        tokio::spawn(async move {
            let result = accept_loop(&listener, &shared, &config, max_connections, stop_rx).await;
            let stopped = matches!(result, Ok(Outcome::Stopped(_)));
            shared.leave_async(stopped);

            match result {
                Ok(outcome) => {
                    let accepted = outcome.accepted();
                    tracing::debug!(target: "networker::acceptor", "accept loop finished after {accepted} connections");
                    Ok(accepted)
                }
                Err(e) => {
                    tracing::error!(target: "networker::acceptor", "accept loop failed: {e}");
                    Err(e)
                }
            }
        })
    }

    /// Ask every running accept loop to stop.
    ///
    /// A loop waiting in accept is interrupted.
    pub fn stop_listening(&self) {
        self.shared.request_stop();
    }

    /// Stop listening, then disconnect and forget every registered peer.
    ///
    /// A peer that an accept loop is still greeting is not registered; the
    /// loop disconnects it.
    pub async fn shutdown(&self) {
        self.stop_listening();
        for connection in self.shared.registry.clear() {
            if let Err(e) = connection.disconnect().await {
                tracing::warn!(target: "networker::acceptor", "error disconnecting {connection}: {e}");
            }
        }
    }

    /// Get the current acceptor state.
    pub fn state(&self) -> AcceptorState {
        *self.shared.state.lock()
    }

    /// Whether a background accept loop is running.
    pub fn is_listening(&self) -> bool {
        self.shared.active_loops.load(Ordering::SeqCst) > 0
    }

    /// Get the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the bound port. Useful after binding to a free port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> String {
        self.config.bind_addr()
    }

    /// Get the number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// All registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.connections()
    }

    /// All registered UIDs, ascending.
    pub fn uids(&self) -> Vec<Uid> {
        self.shared.registry.uids()
    }

    /// Get a registered connection by UID.
    pub fn connection(&self, uid: Uid) -> Option<Arc<Connection>> {
        self.shared.registry.get(uid)
    }

    /// Whether a connection is registered under `uid`.
    pub fn contains(&self, uid: Uid) -> bool {
        self.shared.registry.contains(uid)
    }

    /// Drop a connection from the registry without disconnecting it.
    pub fn remove(&self, uid: Uid) -> Option<Arc<Connection>> {
        self.shared.registry.remove(uid)
    }

    /// Send text to one registered peer.
    pub async fn send_text_to(&self, uid: Uid, text: &str) -> Result<()> {
        let connection = self
            .connection(uid)
            .ok_or(NetworkError::UnknownUid(uid.as_u64()))?;
        connection.send_text(text).await
    }

    /// Send text to every registered peer. Returns how many sends succeeded.
    pub async fn broadcast_text(&self, text: &str) -> usize {
        let mut delivered = 0;
        for (uid, connection) in self.shared.registry.entries() {
            match connection.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(target: "networker::acceptor", "skipping UID {uid} in broadcast, peer is gone: {e}");
                }
                Err(e) => {
                    tracing::warn!(target: "networker::acceptor", "broadcast to UID {uid} failed: {e}");
                }
            }
        }
        delivered
    }

    /// Disconnect a registered peer and remove it from the registry.
    pub async fn disconnect_client(&self, uid: Uid) -> Result<()> {
        let connection = self
            .remove(uid)
            .ok_or(NetworkError::UnknownUid(uid.as_u64()))?;
        connection.disconnect().await
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// How an accept loop ended.
enum Outcome {
    Completed(usize),
    Stopped(usize),
}

impl Outcome {
    fn accepted(&self) -> usize {
        match self {
            Self::Completed(n) | Self::Stopped(n) => *n,
        }
    }
}

async fn accept_loop(
    listener: &TcpListener,
    shared: &AcceptorShared,
    config: &ConnectionConfig,
    max_connections: usize,
    mut stop_rx: watch::Receiver<u64>,
) -> Result<Outcome> {
    let mut accepted = 0;

    while accepted < max_connections {
        let result = tokio::select! {
            biased;

            _ = stop_rx.changed() => return Ok(Outcome::Stopped(accepted)),

            result = listener.accept() => result,
        };

        let (stream, peer_addr) = match result {
            Ok(pair) => pair,
            Err(_) if stop_rx.has_changed().unwrap_or(true) => {
                return Ok(Outcome::Stopped(accepted));
            }
            Err(e) => return Err(NetworkError::Accept(e)),
        };
        accepted += 1;

        let connection =
            match Connection::from_stream_with_config(stream, config.clone()).await {
                Ok(connection) => Arc::new(connection),
                Err(e) => {
                    tracing::warn!(target: "networker::acceptor", "dropping {peer_addr}: {e}");
                    continue;
                }
            };
        if let Err(e) = connection.start_listening().await {
            tracing::warn!(target: "networker::acceptor", "dropping {peer_addr}: {e}");
            continue;
        }

        let uid = shared.uids.next();
        if let Err(e) = connection.send_line(&uid.greeting()).await {
            tracing::warn!(target: "networker::acceptor", "greeting UID {uid} to {peer_addr} failed: {e}");
            continue;
        }

        let open = || !stop_rx.has_changed().unwrap_or(true);
        match shared.registry.insert(uid, connection.clone(), open) {
            Ok(()) => {
                tracing::info!(target: "networker::acceptor", "registered {peer_addr} as UID {uid}");
            }
            Err(rejected) => {
                tracing::warn!(target: "networker::acceptor", "not registering {peer_addr} as UID {uid}: {rejected}");
                if let Err(e) = connection.disconnect().await {
                    tracing::warn!(target: "networker::acceptor", "error disconnecting {peer_addr}: {e}");
                }
                if rejected == Rejected::Closed {
                    return Ok(Outcome::Stopped(accepted));
                }
            }
        }
    }

    Ok(Outcome::Completed(accepted))
}
