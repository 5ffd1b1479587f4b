//! HTTP Upgrade handshake (RFC 6455 Section 4)
//!
//! Client side builds the upgrade request for a `ws://` URL and checks the
//! server's answer. Server side reads and validates the upgrade request and
//! writes the `101 Switching Protocols` response.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

/// GUID appended to the client key before hashing
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this implementation speaks
pub const WS_VERSION: &str = "13";

/// Errors that can occur during the opening handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Carries the raw response received so far
    #[error("Handshake failed: {0:?}")]
    Failed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Bad upgrade request: {0}")]
    BadRequest(String),

    #[error("Handshake timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Compute `Sec-WebSocket-Accept` for a client key: base64(SHA-1(key + GUID))
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh `Sec-WebSocket-Key` from 16 random bytes
pub fn generate_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Where a client connects to, parsed from a `ws://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`
    pub resource: String,
}

impl Target {
    /// Parse a `ws://host[:port]/path` URL. TLS (`wss://`) is not supported.
    pub fn parse(raw: &str) -> HandshakeResult<Self> {
        let url = Url::parse(raw)
            .map_err(|e| HandshakeError::InvalidUrl(format!("{}: {}", raw, e)))?;

        if url.scheme() != "ws" {
            return Err(HandshakeError::InvalidUrl(format!(
                "unsupported scheme '{}', expected ws",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| HandshakeError::InvalidUrl(format!("{}: missing host", raw)))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let mut resource = url.path().to_string();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(Self {
            host,
            port,
            resource,
        })
    }

    /// `host:port`, used for both the TCP connect and the `Host` header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build the client upgrade request, extra headers appended after the standard ones
pub fn build_request(target: &Target, key: &str, extra_headers: &[(String, String)]) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: {}\r\n",
        target.resource,
        target.authority(),
        key,
        WS_VERSION
    );
    for (name, value) in extra_headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Check a raw response head against the key that was sent.
///
/// The status line must contain `101` and `Sec-WebSocket-Accept` must match
/// the value derived from `key`.
pub fn verify_response(raw: &str, key: &str) -> HandshakeResult<()> {
    let mut lines = raw.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    if !status_line.contains("101") {
        return Err(HandshakeError::Failed(raw.to_string()));
    }

    let headers: Vec<(String, String)> = lines.filter_map(parse_header_line).collect();
    let expected = compute_accept_key(key);
    match find_header(&headers, "Sec-WebSocket-Accept") {
        Some(accept) if accept == expected => Ok(()),
        _ => Err(HandshakeError::Failed(raw.to_string())),
    }
}

/// Run the client half of the handshake over an already connected stream.
///
/// Anything other than a valid `101` answer within `timeout`, including EOF or
/// a head larger than `max_bytes`, fails with [`HandshakeError::Failed`].
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    target: &Target,
    extra_headers: &[(String, String)],
    timeout: Duration,
    max_bytes: usize,
) -> HandshakeResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = build_request(target, &key, extra_headers);
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    let mut raw = String::new();
    let complete = tokio::time::timeout(timeout, read_head(reader, max_bytes, &mut raw)).await;
    match complete {
        Ok(Ok(true)) => verify_response(&raw, &key),
        Ok(Ok(false)) | Err(_) => Err(HandshakeError::Failed(raw)),
        Ok(Err(e)) => Err(e),
    }
}

/// A parsed server-side upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub resource: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parse a request head (request line plus header lines)
    pub fn parse(head: &str) -> HandshakeResult<Self> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, resource) = match (parts.next(), parts.next()) {
            (Some(method), Some(resource)) => (method.to_string(), resource.to_string()),
            _ => {
                return Err(HandshakeError::BadRequest(format!(
                    "malformed request line: {}",
                    request_line
                )))
            }
        };

        Ok(Self {
            method,
            resource,
            headers: lines.filter_map(parse_header_line).collect(),
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Path component of the request target, without the query
    pub fn path(&self) -> &str {
        self.resource.split('?').next().unwrap_or("/")
    }

    /// Validate the WebSocket upgrade headers and return the client key
    pub fn validate(&self) -> HandshakeResult<&str> {
        if !self.method.eq_ignore_ascii_case("GET") {
            return Err(HandshakeError::BadRequest("method must be GET".to_string()));
        }

        match self.header("Upgrade") {
            Some(v) if v.to_ascii_lowercase().contains("websocket") => {}
            _ => {
                return Err(HandshakeError::BadRequest(
                    "missing or invalid Upgrade header".to_string(),
                ))
            }
        }

        match self.header("Connection") {
            Some(v) if v.to_ascii_lowercase().contains("upgrade") => {}
            _ => {
                return Err(HandshakeError::BadRequest(
                    "missing or invalid Connection header".to_string(),
                ))
            }
        }

        if self.header("Sec-WebSocket-Version") != Some(WS_VERSION) {
            return Err(HandshakeError::BadRequest(
                "missing or invalid Sec-WebSocket-Version (must be 13)".to_string(),
            ));
        }

        self.header("Sec-WebSocket-Key")
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                HandshakeError::BadRequest("missing Sec-WebSocket-Key header".to_string())
            })
    }
}

/// Read the upgrade request head sent by a client.
pub async fn read_upgrade_request<R>(
    reader: &mut R,
    timeout: Duration,
    max_bytes: usize,
) -> HandshakeResult<UpgradeRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = String::new();
    match tokio::time::timeout(timeout, read_head(reader, max_bytes, &mut raw)).await {
        Ok(Ok(true)) => UpgradeRequest::parse(&raw),
        Ok(Ok(false)) => Err(HandshakeError::BadRequest(format!(
            "request head incomplete or larger than {} bytes",
            max_bytes
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(HandshakeError::TimedOut(timeout)),
    }
}

/// Write the `101 Switching Protocols` answer for an accepted client key
pub async fn write_switching_protocols<W>(writer: &mut W, client_key: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        compute_accept_key(client_key)
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Write a plain-text HTTP error response (400, 404, ...)
pub async fn write_http_error<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Read header lines into `raw` until the blank line.
///
/// Returns `Ok(false)` if the stream ended or `max_bytes` was exhausted first.
/// The trailing blank line is not kept in `raw`.
async fn read_head<R>(reader: &mut R, max_bytes: usize, raw: &mut String) -> HandshakeResult<bool>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(max_bytes as u64);
    loop {
        let mut line = String::new();
        let n = limited.read_line(&mut line).await?;
        if n == 0 || !line.ends_with('\n') {
            raw.push_str(&line);
            return Ok(false);
        }
        if line == "\r\n" || line == "\n" {
            return Ok(true);
        }
        raw.push_str(&line);
    }
}

fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
