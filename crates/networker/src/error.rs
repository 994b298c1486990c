//! Error types for the networking module.

use std::io;

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Network-specific errors.
///
/// Errors raised inside a background receive loop are never returned to a
/// caller; they are logged and end that loop only.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Binding the listening socket failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialing a remote endpoint failed.
    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        /// The address that could not be reached.
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The socket could not be attached to a connection.
    #[error("Connection error: {0}")]
    Connection(#[source] io::Error),

    /// The operation needs an open socket, but the connection holds none.
    #[error("Not connected")]
    NotConnected,

    /// Writing to the socket failed.
    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    /// Accepting an incoming socket failed while the acceptor was listening.
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),

    /// No connection is registered under the given UID.
    #[error("No connection registered with UID {0}")]
    UnknownUid(u64),

    /// The receive loop task could not be joined.
    #[error("Receive loop failed: {0}")]
    ReceiveLoop(String),
}

impl NetworkError {
    /// Create a bind error.
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// Create a dial error.
    pub fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }

    /// Whether the error came from the peer going away.
    pub fn is_disconnect(&self) -> bool {
        let source = match self {
            Self::Send(e) | Self::Connection(e) => e,
            Self::NotConnected => return true,
            _ => return false,
        };
        matches!(
            source.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = NetworkError::bind(
            "0.0.0.0:80",
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );
        assert_eq!(err.to_string(), "Failed to bind 0.0.0.0:80: address in use");
        assert_eq!(NetworkError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_is_disconnect() {
        assert!(NetworkError::NotConnected.is_disconnect());
        assert!(NetworkError::Send(io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!NetworkError::Send(io::ErrorKind::PermissionDenied.into()).is_disconnect());
        assert!(!NetworkError::ReceiveLoop("panicked".into()).is_disconnect());
    }
}
