//! Transport connection
//!
//! A [`Connection`] is the only owner of an upgraded socket. The write half
//! lives in a dedicated writer task fed by a bounded queue, so concurrent
//! writers never interleave partial frames. The read half is driven by
//! [`Connection::read_loop`], which hands complete text messages to the
//! caller and answers control frames itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::frame::{self, FrameError, Opcode, Role, CLOSE_NORMAL};

/// Default cap on a single inbound message (16 MiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Default number of encoded frames buffered per connection
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;

/// How long a write may still run once the connection is Closed
pub const CLOSE_FLUSH_GRACE: Duration = Duration::from_millis(250);

/// Errors raised by a connection's read loop or write operations
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Fragmented messages are not supported")]
    UnsupportedFragmentation,

    #[error("Text frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame masking does not match the sender's role")]
    MaskMismatch,

    #[error("Invalid control frame: {0}")]
    InvalidControlFrame(&'static str),

    #[error("Connection is closed")]
    Closed,

    #[error("Write queue is full")]
    QueueFull,
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded but not yet admitted
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Tunables for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Inbound frames declaring a larger payload are malformed
    pub max_message_bytes: u64,
    /// Capacity of the outbound frame queue
    pub write_queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
        }
    }
}

/// One WebSocket endpoint
pub struct Connection {
    id: Uuid,
    role: Role,
    peer: Option<SocketAddr>,
    /// Set once by the authentication gate
    identity: OnceLock<String>,
    state: watch::Sender<ConnectionState>,
    close_sent: AtomicBool,
    max_message_bytes: u64,
    outbound: mpsc::Sender<Arc<[u8]>>,
}

impl Connection {
    /// Take ownership of the write half of an upgraded stream.
    ///
    /// The connection starts in [`ConnectionState::Connecting`] and its writer
    /// task is already running, so frames can be sent before admission.
    pub fn new<W>(
        writer: W,
        role: Role,
        peer: Option<SocketAddr>,
        options: &ConnectionOptions,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(options.write_queue_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            peer,
            identity: OnceLock::new(),
            state,
            close_sent: AtomicBool::new(false),
            max_message_bytes: options.max_message_bytes,
            outbound,
        });

        tokio::spawn(write_loop(Arc::clone(&connection), outbound_rx, writer));
        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Identity assigned at authentication, if any
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Assign the identity. Returns `false` if one was already set.
    pub fn set_identity(&self, identity: impl Into<String>) -> bool {
        self.identity.set(identity.into()).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move from Connecting to Open. Returns `false` from any other state.
    pub fn mark_open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        })
    }

    /// Transition to Closed.
    ///
    /// Returns `true` only for the call that performed the transition, so the
    /// closed notification fires at most once.
    pub fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    /// Resolve once the connection reaches Closed
    pub async fn closed(&self) {
        let mut state_rx = self.state.subscribe();
        let _ = state_rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Encode and queue a text frame, waiting for queue space if needed
    pub async fn send_text(&self, text: &str) -> ConnectionResult<()> {
        self.send_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Encode and queue a frame of any opcode
    pub async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> ConnectionResult<()> {
        self.ensure_writable()?;
        let bytes: Arc<[u8]> = frame::encode(payload, opcode, self.role).into();
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queue an already encoded frame without waiting.
    ///
    /// The bytes must have been encoded for this connection's role; broadcast
    /// uses this to share one server-role encoding across many connections.
    pub fn try_send_encoded(&self, frame: Arc<[u8]>) -> ConnectionResult<()> {
        self.ensure_writable()?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Start the close handshake. Safe to call any number of times from any task.
    pub fn close(&self, code: u16, reason: &str) {
        if self.state() == ConnectionState::Closed || self.close_sent.swap(true, Ordering::AcqRel) {
            return;
        }

        // Queue the Close frame before leaving Open so the writer flushes it
        let payload = frame::close_payload(code, reason);
        let bytes: Arc<[u8]> = frame::encode(&payload, Opcode::Close, self.role).into();
        if self.outbound.try_send(bytes).is_err() {
            debug!(connection = %self.id, "Close frame dropped, write queue unavailable");
        }

        self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Open => {
                *state = ConnectionState::Closing;
                true
            }
            _ => false,
        });
    }

    /// Read frames until the connection closes.
    ///
    /// Complete text messages are forwarded to `inbound` in receipt order.
    /// Pings are answered, a Close frame is echoed, and binary frames are
    /// ignored. Protocol violations end the loop with an error. The
    /// connection is Closed when this returns, whatever the outcome.
    pub async fn read_loop<R>(
        &self,
        reader: &mut R,
        inbound: mpsc::Sender<String>,
    ) -> ConnectionResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.read_frames(reader, inbound).await;
        self.mark_closed();
        result
    }

    async fn read_frames<R>(
        &self,
        reader: &mut R,
        inbound: mpsc::Sender<String>,
    ) -> ConnectionResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut state_rx = self.state.subscribe();
        let closing =
            |s: &ConnectionState| matches!(s, ConnectionState::Closing | ConnectionState::Closed);

        loop {
            let decoded = tokio::select! {
                decoded = frame::decode(reader, self.max_message_bytes) => decoded,
                _ = state_rx.wait_for(closing) => return Ok(()),
            };

            let frame = match decoded {
                Ok(frame) => frame,
                Err(FrameError::Eof) => {
                    debug!(connection = %self.id, "Peer went away without a Close frame");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let expect_masked = self.role == Role::Server;
            if frame.is_masked() != expect_masked {
                return Err(ConnectionError::MaskMismatch);
            }
            if frame.opcode.is_control() {
                if !frame.fin {
                    return Err(ConnectionError::InvalidControlFrame("fragmented"));
                }
                if frame.payload.len() > frame::MAX_SHORT_PAYLOAD {
                    return Err(ConnectionError::InvalidControlFrame("payload over 125 bytes"));
                }
            }

            match frame.opcode {
                Opcode::Continuation => return Err(ConnectionError::UnsupportedFragmentation),
                Opcode::Text | Opcode::Binary if !frame.fin => {
                    return Err(ConnectionError::UnsupportedFragmentation)
                }
                Opcode::Text => {
                    let text = String::from_utf8(frame.payload)
                        .map_err(|_| ConnectionError::InvalidUtf8)?;
                    tokio::select! {
                        sent = inbound.send(text) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                        _ = state_rx.wait_for(closing) => return Ok(()),
                    }
                }
                Opcode::Binary => {
                    warn!(
                        connection = %self.id,
                        bytes = frame.payload.len(),
                        "Received binary message, ignoring"
                    );
                }
                Opcode::Ping => {
                    let pong: Arc<[u8]> =
                        frame::encode(&frame.payload, Opcode::Pong, self.role).into();
                    if self.outbound.try_send(pong).is_err() {
                        debug!(connection = %self.id, "Pong dropped, write queue full");
                    }
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = frame::close_code(&frame.payload).unwrap_or(CLOSE_NORMAL);
                    debug!(connection = %self.id, code, "Peer requested close");
                    // Echo unless we started the close ourselves
                    self.close(code, "");
                    return Ok(());
                }
            }
        }
    }

    /// Finish a close we started: discard inbound frames until the peer's
    /// Close arrives, the stream ends or `timeout` elapses. Leaves the
    /// connection Closed.
    pub async fn drain<R>(&self, reader: &mut R, timeout: Duration)
    where
        R: AsyncRead + Unpin,
    {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                match frame::decode(reader, self.max_message_bytes).await {
                    Ok(frame) if frame.opcode == Opcode::Close => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            debug!(connection = %self.id, "Peer did not answer Close in time");
        }
        self.mark_closed();
    }

    fn ensure_writable(&self) -> ConnectionResult<()> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(ConnectionError::Closed),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
impl Connection {
    /// Open server-role connection over an in-memory pipe.
    ///
    /// Returns the connection, its unread read half, and the peer's end.
    pub(crate) fn test_pair() -> (
        Arc<Self>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
    ) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(local);
        let connection =
            Connection::new(write_half, Role::Server, None, &ConnectionOptions::default());
        connection.mark_open();
        (connection, read_half, peer)
    }
}

/// Single writer for a connection: drains the queue until the connection is Closed.
///
/// Once Closed, a write that does not finish within [`CLOSE_FLUSH_GRACE`] is
/// abandoned so a peer that stopped reading cannot hold the socket open.
async fn write_loop<W>(
    connection: Arc<Connection>,
    mut outbound_rx: mpsc::Receiver<Arc<[u8]>>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin,
{
    let mut state_rx = connection.subscribe_state();

    loop {
        let next = tokio::select! {
            // Queued frames win over the Closed signal so a final Close frame is flushed
            biased;
            next = outbound_rx.recv() => next,
            _ = closed_then(&mut state_rx, Duration::ZERO) => None,
        };
        let Some(bytes) = next else { break };

        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        let written = tokio::select! {
            written = write => written,
            _ = closed_then(&mut state_rx, CLOSE_FLUSH_GRACE) => {
                debug!(connection = %connection.id, "Peer stopped reading, abandoning write");
                break;
            }
        };
        if let Err(e) = written {
            debug!(connection = %connection.id, "Write failed: {}", e);
            connection.mark_closed();
            break;
        }
    }

    let _ = tokio::time::timeout(CLOSE_FLUSH_GRACE, writer.shutdown()).await;
}

/// Resolve `after` the state reaches Closed
async fn closed_then(state_rx: &mut watch::Receiver<ConnectionState>, after: Duration) {
    if state_rx
        .wait_for(|s| *s == ConnectionState::Closed)
        .await
        .is_err()
    {
        return;
    }
    if !after.is_zero() {
        tokio::time::sleep(after).await;
    }
}
