//! State enums for TCP connections and acceptors.

/// How a connection's receive loop interprets incoming bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReceiveMode {
    /// Newline-delimited UTF-8 lines.
    #[default]
    Text,
    /// Raw chunks, exactly as read from the socket.
    Binary,
}

impl std::fmt::Display for ReceiveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "Text"),
            Self::Binary => write!(f, "Binary"),
        }
    }
}

/// Current state of a TCP connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket is attached.
    #[default]
    Disconnected,
    /// A socket is attached and usable for sending.
    Connected,
    /// The socket is being torn down.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

/// Current state of an acceptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AcceptorState {
    /// The listening socket is bound; nothing has been accepted yet.
    #[default]
    Bound,
    /// Bound and not accepting right now.
    Idle,
    /// A caller is blocked in [`accept`](super::Acceptor::accept).
    AcceptingSync,
    /// A background accept loop is running.
    AcceptingAsync,
    /// Listening was stopped.
    Stopped,
}

impl std::fmt::Display for AcceptorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bound => write!(f, "Bound"),
            Self::Idle => write!(f, "Idle"),
            Self::AcceptingSync => write!(f, "AcceptingSync"),
            Self::AcceptingAsync => write!(f, "AcceptingAsync"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
