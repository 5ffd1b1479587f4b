//! Outbound client connection
//!
//! Dials a `ws://` URL, runs the client handshake and wraps the socket in a
//! client-role [`Connection`] whose text messages arrive on a channel.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::connection::{Connection, ConnectionError, ConnectionOptions, ConnectionResult};
use super::frame::{Role, CLOSE_NORMAL};
use super::handshake::{self, HandshakeError, Target};

/// Errors that can occur while connecting
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("Failed to connect: {0}")]
    Connect(#[from] std::io::Error),
}

/// Options for an outbound connection
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on waiting for the `101` response
    pub handshake_timeout: Duration,
    /// Bound on the size of the response head
    pub max_handshake_bytes: usize,
    /// Capacity of the received message channel
    pub inbound_queue_capacity: usize,
    pub connection: ConnectionOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            max_handshake_bytes: 8192,
            inbound_queue_capacity: 64,
            connection: ConnectionOptions::default(),
        }
    }
}

/// A connected client
pub struct WsClient {
    connection: Arc<Connection>,
    messages: mpsc::Receiver<String>,
    reader: JoinHandle<ConnectionResult<()>>,
}

impl WsClient {
    /// Connect to `url`, sending `extra_headers` with the upgrade request
    pub async fn connect(
        url: &str,
        extra_headers: &[(String, String)],
        options: &ClientOptions,
    ) -> Result<Self, ClientError> {
        let target = Target::parse(url)?;
        let stream = TcpStream::connect(target.authority()).await?;
        let peer = stream.peer_addr().ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        handshake::client_handshake(
            &mut reader,
            &mut write_half,
            &target,
            extra_headers,
            options.handshake_timeout,
            options.max_handshake_bytes,
        )
        .await?;
        debug!("Connected to {}", url);

        let connection = Connection::new(write_half, Role::Client, peer, &options.connection);
        connection.mark_open();

        let (tx, messages) = mpsc::channel(options.inbound_queue_capacity.max(1));
        let conn = Arc::clone(&connection);
        let reader = tokio::spawn(async move { conn.read_loop(&mut reader, tx).await });

        Ok(Self {
            connection,
            messages,
            reader,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Send one text message
    pub async fn send_text(&self, text: &str) -> ConnectionResult<()> {
        self.connection.send_text(text).await
    }

    /// Next text message from the server, `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Close the connection and wait for the read loop to finish
    pub async fn close(self) -> ConnectionResult<()> {
        self.connection.close(CLOSE_NORMAL, "");
        match self.reader.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Closed),
        }
    }
}
