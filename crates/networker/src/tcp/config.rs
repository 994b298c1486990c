//! Configuration types for TCP connections and acceptors.

use super::state::ReceiveMode;

/// Default number of bytes read per binary chunk.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

/// Options applied to every [`Connection`](super::Connection).
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum size of one binary chunk, in bytes.
    pub read_chunk_size: usize,
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Receive mode used by the first receive loop.
    pub receive_mode: ReceiveMode,
    /// Start the receive loop as soon as a socket is attached.
    pub auto_listen: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            no_delay: false,
            receive_mode: ReceiveMode::Text,
            auto_listen: true,
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the binary chunk size. Zero is raised to one byte.
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Set the initial receive mode.
    pub fn receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.receive_mode = mode;
        self
    }

    /// Receive binary chunks from the start.
    pub fn binary(self) -> Self {
        self.receive_mode(ReceiveMode::Binary)
    }

    /// Do not start the receive loop on connect; call `start_listening` instead.
    pub fn manual_listen(mut self) -> Self {
        self.auto_listen = false;
        self
    }
}

/// Configuration for an [`Acceptor`](super::Acceptor).
#[derive(Clone, Debug)]
pub struct AcceptorConfig {
    /// The address to bind to.
    pub bind_address: String,
    /// The port to listen on. `0` lets the OS pick a free port.
    pub port: u16,
    /// Options for accepted connections.
    pub connection: ConnectionConfig,
}

impl AcceptorConfig {
    /// Create a new acceptor configuration.
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            connection: ConnectionConfig::default(),
        }
    }

    /// Listen on all interfaces on the given port, or on a free port if `None`.
    pub fn any_address(port: Option<u16>) -> Self {
        Self::new("0.0.0.0", port.unwrap_or(0))
    }

    /// Set options for accepted connections.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Enable TCP_NODELAY for accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.connection.no_delay = enabled;
        self
    }

    /// Get the bind address string (address:port).
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
