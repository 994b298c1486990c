//! TCP connection usable as either the dialing side or an accepted peer.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;

use super::config::ConnectionConfig;
use super::queue::MessageQueue;
use super::receiver::{ReceiveLoop, Sink, StreamReader};
use super::state::{ConnectionState, ReceiveMode};
use crate::Result;
use crate::error::NetworkError;

/// Unique identifier for a TCP connection.
///
/// Assigned once when the [`Connection`] is created and kept across
/// reconnects, so it names the logical connection rather than the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Host and port a connection dials when it (re)connects.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    fn from_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| NetworkError::dial(self.address(), e))
    }
}

/// Internal state for a connection.
struct ConnectionInner {
    state: ConnectionState,
    receive_mode: ReceiveMode,
    endpoint: Option<Endpoint>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

/// Where the read half currently lives.
#[derive(Default)]
enum ReceiverSlot {
    /// No socket attached.
    #[default]
    Empty,
    /// Attached, no receive loop running.
    Parked(StreamReader),
    /// Owned by a receive loop.
    Running(ReceiveLoop),
}

/// One end of a bidirectional TCP link.
///
/// A connection owns its socket, a background receive loop and two message
/// queues: one for text lines, one for binary chunks. Only the queue matching
/// the receive mode active when the loop was started gets filled. Changing the
/// mode takes effect on the next [`restart_listening`](Self::restart_listening).
///
/// Receiving never blocks: [`receive_text`](Self::receive_text) and
/// [`receive_bytes`](Self::receive_bytes) return `None` when nothing is
/// buffered.
///
/// # Example
///
/// ```ignore
/// let conn = Connection::dial("127.0.0.1", 15001).await?;
/// conn.send_line("hello").await?;
///
/// while let Some(line) = conn.receive_text() {
///     println!("{line}");
/// }
///
/// conn.disconnect().await?;
/// ```
pub struct Connection {
    id: ConnectionId,
    config: ConnectionConfig,
    inner: Mutex<ConnectionInner>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    receiver: tokio::sync::Mutex<ReceiverSlot>,
    listening: AtomicBool,
    receiving: Arc<AtomicBool>,
    text_messages: MessageQueue<String>,
    binary_messages: MessageQueue<Bytes>,
}

impl Connection {
    pub(crate) fn detached(config: ConnectionConfig) -> Self {
        Self {
            id: ConnectionId::new(),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                receive_mode: config.receive_mode,
                endpoint: None,
                peer_addr: None,
                local_addr: None,
            }),
            config,
            writer: tokio::sync::Mutex::new(None),
            receiver: tokio::sync::Mutex::new(ReceiverSlot::Empty),
            listening: AtomicBool::new(false),
            receiving: Arc::new(AtomicBool::new(false)),
            text_messages: MessageQueue::new(),
            binary_messages: MessageQueue::new(),
        }
    }

    /// Dial `host:port` with the default configuration.
    pub async fn dial(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::dial_with_config(host, port, ConnectionConfig::default()).await
    }

    /// Dial `host:port` with the given configuration.
    pub async fn dial_with_config(
        host: impl Into<String>,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let endpoint = Endpoint {
            host: host.into(),
            port,
        };
        let stream = endpoint.dial().await?;

        let connection = Self::detached(config);
        connection.attach(stream, Some(endpoint)).await?;
        Ok(connection)
    }

    /// Wrap an already established stream, e.g. one returned by an acceptor.
    pub async fn from_stream(stream: TcpStream) -> Result<Self> {
        Self::from_stream_with_config(stream, ConnectionConfig::default()).await
    }

    /// Wrap an already established stream with the given configuration.
    pub async fn from_stream_with_config(
        stream: TcpStream,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let connection = Self::detached(config);
        connection.connect(stream).await?;
        Ok(connection)
    }

    /// Bind this connection to `stream`.
    ///
    /// Any previously attached socket is disconnected first. The peer address
    /// of `stream` becomes the endpoint used by [`reconnect`](Self::reconnect).
    pub async fn connect(&self, stream: TcpStream) -> Result<()> {
        self.attach(stream, None).await
    }

    async fn attach(&self, stream: TcpStream, endpoint: Option<Endpoint>) -> Result<()> {
        let peer_addr = stream.peer_addr().map_err(NetworkError::Connection)?;
        let local_addr = stream.local_addr().map_err(NetworkError::Connection)?;

        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            tracing::warn!(target: "networker::connection", "{}: failed to set TCP_NODELAY: {e}", self.id);
        }

        if self.state() != ConnectionState::Disconnected
            && let Err(e) = self.disconnect().await
        {
            tracing::warn!(target: "networker::connection", "{}: error closing previous socket: {e}", self.id);
        }

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.receiver.lock().await = ReceiverSlot::Parked(StreamReader::new(read_half));

        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Connected;
            inner.endpoint = Some(endpoint.unwrap_or_else(|| Endpoint::from_addr(peer_addr)));
            inner.peer_addr = Some(peer_addr);
            inner.local_addr = Some(local_addr);
        }
        tracing::debug!(target: "networker::connection", "{}: connected to {peer_addr}", self.id);

        if self.config.auto_listen {
            self.start_listening().await?;
        }
        Ok(())
    }

    /// Close the socket and stop the receive loop.
    ///
    /// Every teardown step is attempted even if an earlier one fails; the
    /// first error is returned. Disconnecting a disconnected connection is a
    /// no-op. Buffered messages stay in the queues.
    pub async fn disconnect(&self) -> Result<()> {
        self.listening.store(false, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Disconnected {
                return Ok(());
            }
            inner.state = ConnectionState::Closing;
        }

        let mut first_error = None;

        let slot = std::mem::take(&mut *self.receiver.lock().await);
        if let ReceiverSlot::Running(receive_loop) = slot
            && let Err(e) = receive_loop.stop().await
        {
            first_error.get_or_insert(e);
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            first_error.get_or_insert(NetworkError::Connection(e));
        }

        self.inner.lock().state = ConnectionState::Disconnected;
        tracing::debug!(target: "networker::connection", "{}: disconnected", self.id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disconnect, then dial the same endpoint again.
    ///
    /// On failure the connection is left disconnected.
    pub async fn reconnect(&self) -> Result<()> {
        if let Err(e) = self.disconnect().await {
            tracing::warn!(target: "networker::connection", "{}: error during disconnect before reconnect: {e}", self.id);
        }

        let endpoint = self
            .inner
            .lock()
            .endpoint
            .clone()
            .ok_or(NetworkError::NotConnected)?;
        tracing::debug!(target: "networker::connection", "{}: reconnecting to {}", self.id, endpoint.address());

        let stream = endpoint.dial().await?;
        self.attach(stream, Some(endpoint)).await
    }

    /// Write raw bytes to the peer.
    ///
    /// A failed write does not disconnect the connection.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetworkError::NotConnected)?;
        writer.write_all(data).await.map_err(NetworkError::Send)?;
        writer.flush().await.map_err(NetworkError::Send)
    }

    /// Write text to the peer. No line terminator is appended.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Write `line` followed by `\n`.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send_bytes(&data).await
    }

    /// Take the oldest received text line, if any.
    pub fn receive_text(&self) -> Option<String> {
        self.text_messages.poll()
    }

    /// Take the oldest received binary chunk, if any.
    pub fn receive_bytes(&self) -> Option<Bytes> {
        self.binary_messages.poll()
    }

    /// Copy of all buffered text lines, oldest first.
    pub fn all_text_messages(&self) -> Vec<String> {
        self.text_messages.snapshot()
    }

    /// Copy of all buffered binary chunks, oldest first.
    pub fn all_binary_messages(&self) -> Vec<Bytes> {
        self.binary_messages.snapshot()
    }

    /// Shared handle to the text queue.
    pub fn text_queue(&self) -> MessageQueue<String> {
        self.text_messages.clone()
    }

    /// Shared handle to the binary queue.
    pub fn binary_queue(&self) -> MessageQueue<Bytes> {
        self.binary_messages.clone()
    }

    /// Start the receive loop in the current receive mode.
    ///
    /// Does nothing if the connection is already listening, even when the
    /// previous loop has since ended on its own; use
    /// [`restart_listening`](Self::restart_listening) in that case.
    pub async fn start_listening(&self) -> Result<()> {
        let mut slot = self.receiver.lock().await;
        if self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }

        let reader = match std::mem::take(&mut *slot) {
            ReceiverSlot::Parked(reader) => reader,
            ReceiverSlot::Running(receive_loop) => receive_loop.stop().await?,
            ReceiverSlot::Empty => return Err(NetworkError::NotConnected),
        };

        let mode = self.receive_mode();
        let sink = match mode {
            ReceiveMode::Text => Sink::Text(self.text_messages.clone()),
            ReceiveMode::Binary => Sink::Binary {
                queue: self.binary_messages.clone(),
                chunk_size: self.config.read_chunk_size,
            },
        };

        *slot = ReceiverSlot::Running(ReceiveLoop::spawn(
            reader,
            sink,
            self.id,
            self.receiving.clone(),
        ));
        self.listening.store(true, Ordering::SeqCst);
        tracing::debug!(target: "networker::connection", "{}: listening in {mode} mode", self.id);
        Ok(())
    }

    /// Stop the receive loop.
    ///
    /// Returns once the loop has exited; a pending read is interrupted
    /// without losing buffered bytes.
    pub async fn stop_listening(&self) -> Result<()> {
        self.listening.store(false, Ordering::SeqCst);

        let mut slot = self.receiver.lock().await;
        *slot = match std::mem::take(&mut *slot) {
            ReceiverSlot::Running(receive_loop) => ReceiverSlot::Parked(receive_loop.stop().await?),
            other => other,
        };
        Ok(())
    }

    /// Stop then start the receive loop, picking up a changed receive mode.
    pub async fn restart_listening(&self) -> Result<()> {
        self.stop_listening().await?;
        self.start_listening().await
    }

    /// Receive binary chunks after the next restart.
    pub fn set_receiver_to_binary(&self) {
        self.inner.lock().receive_mode = ReceiveMode::Binary;
    }

    /// Receive text lines after the next restart.
    pub fn set_receiver_to_text(&self) {
        self.inner.lock().receive_mode = ReceiveMode::Text;
    }

    /// The mode the next receive loop will use.
    pub fn receive_mode(&self) -> ReceiveMode {
        self.inner.lock().receive_mode
    }

    /// Whether a socket is attached and was not closed locally.
    ///
    /// A peer closing its end is not detected here; see
    /// [`is_receiving`](Self::is_receiving).
    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    /// Whether a receive loop was started and not stopped.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Whether the receive loop task is still running.
    ///
    /// Turns false when the loop ends on end-of-stream or a read error while
    /// [`is_listening`](Self::is_listening) stays true.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Get the unique connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the peer socket address of the current or last socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().peer_addr
    }

    /// Get the local socket address of the current or last socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Host dialed by [`reconnect`](Self::reconnect).
    pub fn remote_host(&self) -> Option<String> {
        self.inner.lock().endpoint.as_ref().map(|e| e.host.clone())
    }

    /// Port dialed by [`reconnect`](Self::reconnect).
    pub fn remote_port(&self) -> Option<u16> {
        self.inner.lock().endpoint.as_ref().map(|e| e.port)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        let flag = if inner.state == ConnectionState::Connected {
            "A"
        } else {
            "C"
        };
        match (&inner.peer_addr, &inner.endpoint) {
            (Some(addr), _) => write!(f, "Connection-{flag}:[{addr}]"),
            (None, Some(endpoint)) => write!(f, "Connection-{flag}:[{}]", endpoint.address()),
            (None, None) => write!(f, "Connection-{flag}:[]"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("receive_mode", &inner.receive_mode)
            .field("peer_addr", &inner.peer_addr)
            .field("listening", &self.is_listening())
            .field("pending_text", &self.text_messages.len())
            .field("pending_binary", &self.binary_messages.len())
            .finish()
    }
}
