//! Accept loop and connection dispatch.
//!
//! The [`Server`] decouples socket acceptance from application
//! consumption: the accept loop hands every fresh socket to its own
//! handshake task, and only fully upgraded connections reach the queue
//! the application pops from.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use weir_protocol::constants::{DEFAULT_MAX_MESSAGE_SIZE, HANDSHAKE_TIMEOUT};

use crate::ServerError;
use crate::connection::Connection;
use crate::http::HttpConnection;
use crate::websocket::WebSocketConnection;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (default: all interfaces).
    pub addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Deadline for one client to complete its upgrade handshake.
    pub handshake_timeout: Duration,
    /// Per-connection cap on one reassembled message.
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_message_len: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Accepts TCP connections, drives handshakes concurrently, and queues
/// upgraded connections for [`accept_connection`](Server::accept_connection).
///
/// The queue is deliberately unbounded: under sustained accept pressure
/// with a slow consumer it trades memory for simplicity.
pub struct Server {
    config: ServerConfig,
    queue_tx: mpsc::UnboundedSender<WebSocketConnection<TcpStream>>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<WebSocketConnection<TcpStream>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            config,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// A server on the given port with default settings.
    pub fn with_port(port: u16) -> Self {
        Self::new(ServerConfig {
            port,
            ..ServerConfig::default()
        })
    }

    /// The bound address, available once [`run`](Server::run) has bound
    /// the listener (useful with port 0).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Blocks until the next fully handshaken connection is available.
    pub async fn accept_connection(&self) -> Option<WebSocketConnection<TcpStream>> {
        self.queue_rx.lock().await.recv().await
    }

    /// Runs the accept loop until the token is cancelled.
    ///
    /// Cancellation closes the listener only; handshakes already in
    /// flight run to completion. Starting a second loop while one is
    /// running is a usage error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let result = self.accept_loop(&cancel).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn accept_loop(&self, cancel: &CancellationToken) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(%local_addr, "listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("accept loop stopped");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            let queue = self.queue_tx.clone();
                            let handshake_timeout = self.config.handshake_timeout;
                            let max_message_len = self.config.max_message_len;
                            tokio::spawn(handshake_task(
                                socket,
                                peer_addr,
                                handshake_timeout,
                                max_message_len,
                                queue,
                            ));
                        }
                        Err(e) => tracing::error!("accept error: {e}"),
                    }
                }
            }
        }
    }
}

/// Drives one handshake under its deadline. A failed handshake never
/// reaches the queue; the raw socket is dropped without ceremony.
async fn handshake_task(
    socket: TcpStream,
    peer_addr: SocketAddr,
    handshake_timeout: Duration,
    max_message_len: usize,
    queue: mpsc::UnboundedSender<WebSocketConnection<TcpStream>>,
) {
    let connection = Connection::with_remote_addr(socket, Some(peer_addr));
    let id = connection.id();
    let upgrade = HttpConnection::new(connection).upgrade();

    match tokio::time::timeout(handshake_timeout, upgrade).await {
        Ok(Ok(mut websocket)) => {
            websocket.set_max_message_len(max_message_len);
            tracing::debug!(%peer_addr, %id, "connection queued");
            if queue.send(websocket).is_err() {
                tracing::debug!(%peer_addr, "connection queue is gone");
            }
        }
        Ok(Err(e)) => tracing::debug!(%peer_addr, "handshake failed: {e}"),
        Err(_) => tracing::debug!(%peer_addr, "handshake timed out"),
    }
}
