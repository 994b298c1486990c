//! Echo server demo.
//!
//! Accepts up to 8 peers, greets each with its UID and echoes every text line
//! back to its sender. A local client connects and talks to it.
//!
//! Run with: cargo run -p networker --example echo_server [port]
//! Set RUST_LOG=networker=debug for connection lifecycle logs.

use std::time::Duration;

use networker::tcp::{Acceptor, Connection, Uid};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> networker::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let port = std::env::args().nth(1).and_then(|arg| arg.parse().ok());
    let acceptor = Acceptor::bind(port).await?;
    println!("Listening on {}", acceptor.local_addr());

    let accept_loop = acceptor.listen(8);

    let client = Connection::dial("127.0.0.1", acceptor.port()).await?;
    for line in ["hello", "echo me", "bye"] {
        client.send_line(line).await?;
    }

    for _ in 0..50 {
        for connection in acceptor.connections() {
            while let Some(line) = connection.receive_text() {
                connection.send_line(&format!("echo: {line}")).await?;
            }
        }

        while let Some(line) = client.receive_text() {
            match Uid::parse_greeting(&line) {
                Some(uid) => println!("Client was assigned UID {uid}"),
                None => println!("Client received: {line}"),
            }
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.disconnect().await?;
    acceptor.shutdown().await;
    match accept_loop.await {
        Ok(result) => println!("Accepted {} connection(s)", result?),
        Err(e) => eprintln!("Accept loop panicked: {e}"),
    }
    Ok(())
}
