//! TCP connections with background receive loops and a UID-assigning acceptor.
//!
//! This module provides:
//! - **Connection**: one end of a TCP link, dialed or accepted, whose receive
//!   loop buffers incoming text lines or binary chunks in a [`MessageQueue`]
//! - **Acceptor**: binds a port and turns inbound sockets into connections
//! - **MessageQueue**: the thread-safe FIFO behind every connection
//!
//! # Client Example
//!
//! ```ignore
//! use networker::tcp::Connection;
//!
//! let conn = Connection::dial("127.0.0.1", 15001).await?;
//! conn.send_line("hello").await?;
//!
//! // Polling never blocks.
//! if let Some(line) = conn.receive_text() {
//!     println!("Received: {line}");
//! }
//! ```
//!
//! # Server Example
//!
//! ```ignore
//! use networker::tcp::Acceptor;
//!
//! let acceptor = Acceptor::bind(Some(15001)).await?;
//!
//! // Every peer is greeted with "UID: <n>" and registered.
//! let accept_loop = acceptor.listen(16);
//!
//! for conn in acceptor.connections() {
//!     for line in conn.all_text_messages() {
//!         println!("{conn}: {line}");
//!     }
//! }
//! ```
//!
//! # Receive Modes
//!
//! A connection starts in [`ReceiveMode::Text`]. Switching with
//! `set_receiver_to_binary` only affects the next receive loop, so follow
//! it with `restart_listening`. Lines already queued stay in the text queue.

mod acceptor;
mod config;
mod connection;
mod queue;
mod receiver;
mod registry;
mod state;

pub use acceptor::Acceptor;
pub use config::{AcceptorConfig, ConnectionConfig, DEFAULT_READ_CHUNK_SIZE};
pub use connection::{Connection, ConnectionId};
pub use queue::MessageQueue;
pub use registry::Uid;
pub use state::{AcceptorState, ConnectionState, ReceiveMode};
