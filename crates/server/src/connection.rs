//! Buffered, deadline-scoped byte-stream I/O.
//!
//! [`Connection`] wraps any async byte stream with a read-ahead buffer so
//! exact-length and line-delimited reads amortize the underlying I/O. It
//! is generic over the stream type: production code uses
//! `tokio::net::TcpStream`, tests use `tokio::io::duplex`.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::ConnectionError;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A buffered byte-stream connection with independent read/write deadlines.
///
/// Single-reader, single-writer: `&mut self` on every operation means no
/// two reads (or writes) can ever be in flight at once.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    read_buf: BytesMut,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    remote_addr: Option<SocketAddr>,
    id: Uuid,
    available: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self::with_remote_addr(stream, None)
    }

    /// Wraps an accepted socket, recording the peer address.
    pub fn with_remote_addr(stream: S, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            read_timeout: None,
            write_timeout: None,
            remote_addr,
            id: Uuid::new_v4(),
            available: true,
        }
    }

    /// Unique identifier of this connection, for logging and correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer address, when the stream came from a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// True until the connection is closed.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Deadline applied to each blocking read. `None` waits indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Deadline applied to each blocking write. `None` waits indefinitely.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Reads exactly `len` bytes.
    ///
    /// End-of-stream before `len` bytes are available is a transport
    /// error ([`ConnectionError::Eof`]), never a short result.
    pub async fn read_exact(&mut self, len: usize) -> Result<BytesMut, ConnectionError> {
        self.ensure_available()?;
        while self.read_buf.len() < len {
            self.fill_read_buf().await?;
        }
        Ok(self.read_buf.split_to(len))
    }

    /// Reads bytes up to and including the next `\n`, decoded as text.
    ///
    /// Fails with a format error once the accumulated length (terminator
    /// included) exceeds `limit` before a terminator is found, and with
    /// [`ConnectionError::Eof`] if the stream ends without one.
    pub async fn read_line(&mut self, limit: usize) -> Result<String, ConnectionError> {
        self.ensure_available()?;
        let mut searched = 0;
        loop {
            if let Some(pos) = self.read_buf[searched..].iter().position(|&b| b == b'\n') {
                let end = searched + pos + 1;
                if end > limit {
                    return Err(ConnectionError::Format("line is too long".into()));
                }
                let line = self.read_buf.split_to(end);
                return String::from_utf8(line.to_vec())
                    .map_err(|_| ConnectionError::Format("line is not valid UTF-8".into()));
            }
            if self.read_buf.len() > limit {
                return Err(ConnectionError::Format("line is too long".into()));
            }
            searched = self.read_buf.len();
            self.fill_read_buf().await?;
        }
    }

    /// Reads a line with no length limit.
    pub async fn read_line_unbounded(&mut self) -> Result<String, ConnectionError> {
        self.read_line(usize::MAX).await
    }

    /// Writes the bytes as one atomic send.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_available()?;
        let deadline = self.write_timeout;
        let write = async {
            self.stream.write_all(data).await?;
            self.stream.flush().await?;
            Ok(())
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, write)
                .await
                .map_err(|_| ConnectionError::Timeout)?,
            None => write.await,
        }
    }

    /// Writes the text as one atomic send.
    pub async fn send_text(&mut self, data: &str) -> Result<(), ConnectionError> {
        self.send(data.as_bytes()).await
    }

    /// Shuts the stream down in both directions. Subsequent operations
    /// fail; closing twice is a no-op.
    pub async fn close(&mut self) {
        if !self.available {
            return;
        }
        self.available = false;
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(id = %self.id, "stream shutdown failed: {e}");
        }
    }

    async fn fill_read_buf(&mut self) -> Result<(), ConnectionError> {
        self.read_buf.reserve(READ_CHUNK_SIZE);
        let deadline = self.read_timeout;
        let read = self.stream.read_buf(&mut self.read_buf);
        let read = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, read)
                .await
                .map_err(|_| ConnectionError::Timeout)??,
            None => read.await?,
        };
        if read == 0 {
            return Err(ConnectionError::Eof);
        }
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), ConnectionError> {
        if self.available {
            Ok(())
        } else {
            Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is closed",
            )))
        }
    }
}
