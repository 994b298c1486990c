//! Minimal bidirectional TCP communication.
//!
//! This crate wraps TCP sockets in two types:
//!
//! - [`Connection`](tcp::Connection): either the dialing side or an accepted
//!   peer. A background receive loop drains the socket into a message queue,
//!   split into newline-delimited text lines or raw binary chunks.
//! - [`Acceptor`](tcp::Acceptor): binds a port and produces one connection
//!   per inbound socket, handing each peer a server-assigned
//!   [`Uid`](tcp::Uid) as its first line.
//!
//! All I/O runs on tokio; every public operation that touches a socket is
//! `async` and must be called from within a tokio runtime.
//!
//! ```ignore
//! use networker::tcp::{Acceptor, Connection};
//!
//! let acceptor = Acceptor::bind(None).await?;
//! acceptor.listen(1);
//!
//! let client = Connection::dial("127.0.0.1", acceptor.port()).await?;
//! // First line from the server: "UID: <n>"
//! let greeting = client.receive_text();
//! ```
//!
//! There is no framing beyond newline-delimited text, no encryption and no
//! timeouts: reads, writes, dials and accepts wait for the OS.

mod error;
pub mod tcp;

pub use error::{NetworkError, Result};

pub use tcp::{
    Acceptor, AcceptorConfig, AcceptorState, Connection, ConnectionConfig, ConnectionId,
    ConnectionState, MessageQueue, ReceiveMode, Uid,
};
