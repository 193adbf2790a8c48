//! HTTP/1.1 header exchange and the WebSocket upgrade.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use weir_protocol::constants::HEADER_MAX_SIZE;
use weir_protocol::handshake;

use crate::ConnectionError;
use crate::connection::Connection;
use crate::websocket::WebSocketConnection;

/// A parsed HTTP request header.
#[derive(Debug, Clone)]
pub struct HttpRequestHeader {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Header fields, keys trimmed and case preserved as received.
    pub fields: HashMap<String, String>,
}

/// An HTTP response header. Field insertion order is wire order.
#[derive(Debug, Clone)]
pub struct HttpResponseHeader {
    pub version: String,
    pub code: u16,
    pub reason: String,
    fields: Vec<(String, String)>,
}

impl HttpResponseHeader {
    pub fn new(version: &str, code: u16, reason: &str) -> Self {
        Self {
            version: version.to_owned(),
            code,
            reason: reason.to_owned(),
            fields: Vec::new(),
        }
    }

    /// Appends a header field, preserving insertion order.
    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.fields.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

impl fmt::Display for HttpResponseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.code, self.reason)?;
        for (key, value) in &self.fields {
            write!(f, "{key}: {value}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// A connection speaking HTTP, able to upgrade itself to WebSocket mode.
#[derive(Debug)]
pub struct HttpConnection<S> {
    connection: Connection<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpConnection<S> {
    pub fn new(connection: Connection<S>) -> Self {
        Self { connection }
    }

    /// Gives the underlying connection back, abandoning HTTP mode.
    pub fn into_inner(self) -> Connection<S> {
        self.connection
    }

    /// Reads the request line and header fields, stopping at the first
    /// blank line. The whole header section shares one byte budget
    /// ([`HEADER_MAX_SIZE`]), raw line lengths included.
    pub async fn receive_request_header(&mut self) -> Result<HttpRequestHeader, ConnectionError> {
        let mut remaining = HEADER_MAX_SIZE;

        let line = Self::next_line(&mut self.connection, &mut remaining).await?;
        let (method, path, version) = parse_request_line(&line)?;

        let mut fields = HashMap::new();
        loop {
            let line = Self::next_line(&mut self.connection, &mut remaining).await?;
            if line.is_empty() {
                break;
            }
            let (key, value) = parse_header_field(&line)?;
            match fields.entry(key) {
                Entry::Occupied(entry) => {
                    return Err(ConnectionError::Format(format!(
                        "duplicate header field: {}",
                        entry.key()
                    )));
                }
                Entry::Vacant(entry) => {
                    entry.insert(value);
                }
            }
        }

        Ok(HttpRequestHeader {
            method,
            path,
            version,
            fields,
        })
    }

    /// Serializes and sends a response header as one atomic write.
    pub async fn send_response_header(
        &mut self,
        header: &HttpResponseHeader,
    ) -> Result<(), ConnectionError> {
        self.connection.send_text(&header.to_string()).await
    }

    /// Performs the server side of the RFC 6455 opening handshake and
    /// returns the same stream in WebSocket mode.
    ///
    /// Any failure here is a hard error: the caller must drop the raw
    /// connection, nothing of it is reusable.
    pub async fn upgrade(mut self) -> Result<WebSocketConnection<S>, ConnectionError> {
        let request = self.receive_request_header().await?;

        let key = request
            .fields
            .get("Sec-WebSocket-Key")
            .ok_or_else(|| ConnectionError::Format("missing Sec-WebSocket-Key field".into()))?;
        let accept = handshake::accept_key(key);

        let response = HttpResponseHeader::new("HTTP/1.1", 101, "Switching Protocols")
            .field("Connection", "Upgrade")
            .field("Upgrade", "websocket")
            .field("Sec-WebSocket-Accept", &accept);
        self.send_response_header(&response).await?;

        tracing::debug!(id = %self.connection.id(), path = %request.path, "connection upgraded");
        Ok(WebSocketConnection::new(self.connection, request))
    }

    /// Reads one line, charges its raw length (terminator included)
    /// against the shared budget, and returns it trimmed.
    async fn next_line(
        connection: &mut Connection<S>,
        remaining: &mut usize,
    ) -> Result<String, ConnectionError> {
        let line = connection.read_line(*remaining).await?;
        *remaining -= line.len();
        Ok(line.trim().to_owned())
    }
}

fn parse_request_line(line: &str) -> Result<(String, String, String), ConnectionError> {
    let tokens: Vec<&str> = line.split(' ').collect();
    let [method, path, version] = tokens[..] else {
        return Err(ConnectionError::Format(format!(
            "invalid request line: {line:?}"
        )));
    };
    Ok((method.to_owned(), path.to_owned(), version.to_owned()))
}

fn parse_header_field(line: &str) -> Result<(String, String), ConnectionError> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| ConnectionError::Format(format!("invalid header field: {line:?}")))?;
    Ok((key.trim().to_owned(), value.trim().to_owned()))
}
