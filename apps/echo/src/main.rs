//! Weir example: a WebSocket echo server.
//!
//! Accepts connections on the given port (default 3000) and echoes every
//! text and binary message back to its sender.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use weir_server::{Message, Outcome, Server, WebSocketConnection};

/// How long a connection may sit idle before the echo loop gives up on it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 3000,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(port))
}

async fn run(port: u16) -> anyhow::Result<()> {
    tracing::info!(port, "starting echo server");
    let server = Arc::new(Server::with_port(port));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                cancel.cancel();
            }
        });
    }

    tokio::select! {
        result = server.run(cancel) => result?,
        _ = accept_connections(&server) => {}
    }
    Ok(())
}

async fn accept_connections(server: &Server) {
    while let Some(connection) = server.accept_connection().await {
        tokio::spawn(handle_connection(connection));
    }
}

async fn handle_connection(mut connection: WebSocketConnection<TcpStream>) {
    let id = connection.raw_connection().id();
    let peer = connection.raw_connection().remote_addr();
    tracing::info!(%id, ?peer, "connection open");
    connection
        .raw_connection_mut()
        .set_read_timeout(Some(IDLE_TIMEOUT));

    loop {
        match connection.receive().await {
            Outcome::Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                if !connection.send(&message).await.is_ok() {
                    break;
                }
            }
            Outcome::Ok(_) => {}
            Outcome::Closed => {
                tracing::info!(%id, "connection closed");
                break;
            }
            Outcome::Failed(error) => {
                tracing::warn!(%id, "connection failed: {error}");
                break;
            }
        }
    }
}
