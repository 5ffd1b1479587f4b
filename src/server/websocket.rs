//! WebSocket server implementation
//!
//! Accepts TCP connections, negotiates the upgrade, runs the authentication
//! gate and wires each admitted connection's read loop to the event router.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::auth::{AuthGate, AuthRejection};
use super::protocol::{Envelope, ErrorCode, ProtocolError, ProtocolResult};
use super::registry::{RegistryError, SessionRegistry};
use super::router::{EventRouter, HandlerContext};
use crate::config::ServerConfig;
use crate::ws::frame::{self, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION};
use crate::ws::handshake::{self, HandshakeError};
use crate::ws::{Connection, ConnectionError, Opcode, Role};

/// Errors from [`ServerHandle::emit`]
#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Result of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued on
    pub delivered: usize,
    /// Identities whose connection could not take the frame
    pub failed: Vec<String>,
}

/// Cheap, cloneable view of the server handed to handlers
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<SessionRegistry>,
}

impl ServerHandle {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send one envelope to `connection`
    pub async fn emit(
        &self,
        connection: &Connection,
        event: &str,
        data: Value,
    ) -> Result<(), EmitError> {
        let json = Envelope::new(event, data).to_json()?;
        connection.send_text(&json).await?;
        Ok(())
    }

    /// Send one envelope to every open connection.
    ///
    /// The frame is encoded once. A connection that cannot take it (closing,
    /// or its write queue is full) is skipped and reported.
    pub async fn broadcast(&self, event: &str, data: Value) -> ProtocolResult<BroadcastReport> {
        let json = Envelope::new(event, data).to_json()?;
        let encoded: Arc<[u8]> = frame::encode(json.as_bytes(), Opcode::Text, Role::Server).into();

        let mut report = BroadcastReport::default();
        for (identity, connection) in self.registry.all().await {
            match connection.try_send_encoded(Arc::clone(&encoded)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        identity = %identity,
                        connection = %connection.id(),
                        "Broadcast write failed: {}", e
                    );
                    report.failed.push(identity);
                }
            }
        }

        debug!(event, delivered = report.delivered, failed = report.failed.len(), "Broadcast sent");
        Ok(report)
    }

    /// Identity registered for `connection`
    pub async fn get_identity(&self, connection: &Connection) -> Option<String> {
        self.registry.identity_of(connection).await
    }

    /// Live connection for `identity`
    pub async fn get_connection(&self, identity: &str) -> Option<Arc<Connection>> {
        self.registry.lookup(identity).await
    }

    /// Number of live connections
    pub async fn count(&self) -> usize {
        self.registry.count().await
    }

    /// Sorted identities of live connections
    pub async fn identities(&self) -> Vec<String> {
        self.registry.identities().await
    }
}

/// State shared by every connection task
struct Shared {
    config: ServerConfig,
    router: EventRouter,
    gate: AuthGate,
    handle: ServerHandle,
}

/// WebSocket server for game clients
pub struct GameServer {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new server dispatching to `router`
    pub fn new(config: ServerConfig, router: EventRouter) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let gate = AuthGate::from_config(&config.auth);
        Self {
            shared: Arc::new(Shared {
                config,
                router,
                gate,
                handle: ServerHandle::new(Arc::new(SessionRegistry::new())),
            }),
            shutdown_tx,
        }
    }

    /// Handle for emitting and inspecting sessions from outside a handler
    pub fn handle(&self) -> ServerHandle {
        self.shared.handle.clone()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.shared.config.server.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// On shutdown the accept loop stops and every connection is closed with
    /// status 1001.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("Game server listening on ws://{}{}", addr, self.shared.config.server.path);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let shared = Arc::clone(&self.shared);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                let result =
                                    handle_connection(stream, peer_addr, shared, shutdown_rx).await;
                                if let Err(e) = result {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.shared.handle.count().await;
        if session_count > 0 {
            info!("Closing {} active sessions", session_count);
        }

        Ok(())
    }
}

/// Handle a single connection from TCP accept to unregister
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let transport = &shared.config.transport;
    let (read_half, mut write_half) = stream.into_split();
    // Kept for the whole connection so bytes buffered past the request head are not lost
    let mut reader = BufReader::new(read_half);

    let request = match handshake::read_upgrade_request(
        &mut reader,
        transport.handshake_timeout(),
        transport.max_handshake_bytes,
    )
    .await
    {
        Ok(request) => request,
        Err(HandshakeError::Io(e)) => return Err(e.into()),
        Err(HandshakeError::TimedOut(after)) => {
            warn!("Handshake from {} timed out after {:?}", peer_addr, after);
            handshake::write_http_error(
                &mut write_half,
                408,
                "Request Timeout",
                "handshake timed out",
            )
            .await?;
            return Ok(());
        }
        Err(e) => {
            warn!("Bad upgrade request from {}: {}", peer_addr, e);
            handshake::write_http_error(&mut write_half, 400, "Bad Request", &e.to_string()).await?;
            return Ok(());
        }
    };

    if request.path() != shared.config.server.path {
        debug!("Upgrade for unknown path {} from {}", request.path(), peer_addr);
        handshake::write_http_error(&mut write_half, 404, "Not Found", "not found").await?;
        return Ok(());
    }

    let key = match request.validate() {
        Ok(key) => key,
        Err(e) => {
            warn!("Bad upgrade request from {}: {}", peer_addr, e);
            handshake::write_http_error(&mut write_half, 400, "Bad Request", &e.to_string()).await?;
            return Ok(());
        }
    };
    handshake::write_switching_protocols(&mut write_half, key).await?;

    let connection = Connection::new(
        write_half,
        Role::Server,
        Some(peer_addr),
        &transport.connection_options(),
    );

    let identity = match shared.gate.admit(&request, shared.handle.registry()).await {
        Ok(identity) => identity,
        Err(rejection) => {
            warn!(
                connection = %connection.id(),
                peer = %peer_addr,
                "Connection rejected: {}", rejection
            );
            reject(&connection, &mut reader, &rejection, &shared).await;
            return Ok(());
        }
    };

    connection.set_identity(identity.as_str());
    connection.mark_open();
    if let Err(e) = shared.handle.registry().register(&identity, Arc::clone(&connection)).await {
        // Lost a race with another connection for the same identity
        let rejection = match e {
            RegistryError::AlreadyConnected(_) => AuthRejection::new(ErrorCode::AlreadyConnected),
            RegistryError::NotOpen => return Ok(()),
        };
        warn!(
            connection = %connection.id(),
            identity = %identity,
            "Connection rejected: {}", rejection
        );
        reject(&connection, &mut reader, &rejection, &shared).await;
        return Ok(());
    }
    info!(
        connection = %connection.id(),
        identity = %identity,
        peer = %peer_addr,
        "Player connected"
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(transport.inbound_queue_capacity.max(1));
    tokio::spawn(dispatch_loop(
        Arc::clone(&shared),
        Arc::clone(&connection),
        inbound_rx,
    ));

    let read = connection.read_loop(&mut reader, inbound_tx);
    tokio::pin!(read);
    let result = tokio::select! {
        result = &mut read => result,
        _ = shutdown_rx.recv() => {
            connection.close(CLOSE_GOING_AWAY, "server shutting down");
            read.await
        }
    };

    if let Err(e) = &result {
        warn!(
            connection = %connection.id(),
            identity = %identity,
            "Protocol violation, closing: {}", e
        );
    }

    // Handlers still in flight finish on their own; the entry goes now
    shared.handle.registry().unregister_connection(&connection).await;
    info!(connection = %connection.id(), identity = %identity, "Player disconnected");
    Ok(())
}

/// Send the rejection envelope, close, and wait briefly for the peer's Close
async fn reject<R>(
    connection: &Connection,
    reader: &mut R,
    rejection: &AuthRejection,
    shared: &Shared,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    match rejection.envelope().to_json() {
        Ok(json) => {
            if let Err(e) = connection.send_text(&json).await {
                debug!(connection = %connection.id(), "Rejection envelope not sent: {}", e);
            }
        }
        Err(e) => error!("Failed to encode rejection envelope: {}", e),
    }
    connection.close(CLOSE_POLICY_VIOLATION, rejection.code.as_str());
    connection
        .drain(reader, shared.config.transport.handshake_timeout())
        .await;
}

/// Run handlers for one connection, one message at a time, in receipt order
async fn dispatch_loop(
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    mut inbound: mpsc::Receiver<String>,
) {
    while let Some(raw) = inbound.recv().await {
        if !connection.is_open() {
            break;
        }
        let ctx = HandlerContext::new(Arc::clone(&connection), shared.handle.clone());
        shared.router.dispatch(ctx, &raw).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::Claims;
    use crate::server::handler::builtin_router;
    use crate::server::router::{handler_fn, HandlerError};
    use crate::ws::{ClientError, ClientOptions, ConnectionOptions, WsClient};
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SECRET: &str = "integration-secret";

    fn token() -> String {
        let claims = Claims {
            sub: "game-client".to_string(),
            exp: None,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default().with_secret(Some(SECRET.to_string()));
        config.transport.handshake_timeout_ms = 500;
        config
    }

    fn test_router() -> EventRouter {
        let mut router = builtin_router().unwrap();
        router
            .on(
                "greet",
                handler_fn(|data: Value, _ctx| async move {
                    let Some(name) = data["name"].as_str() else {
                        return Err(HandlerError::InvalidData("name is required".to_string()));
                    };
                    Ok(Some(json!({ "message": format!("Hello, {}!", name) })))
                }),
            )
            .unwrap()
            .on(
                "explode",
                handler_fn(|_data, _ctx| async move {
                    Err(HandlerError::Failed("inventory service unavailable".to_string()))
                }),
            )
            .unwrap()
            .on(
                "whisper",
                handler_fn(|data: Value, ctx: HandlerContext| async move {
                    let to = data["to"].as_str().unwrap_or_default().to_string();
                    let Some(target) = ctx.server.get_connection(&to).await else {
                        return Ok(Some(json!({ "delivered": false })));
                    };
                    let from = ctx.server.get_identity(&ctx.connection).await;
                    let whisper = json!({ "from": from, "text": data["text"] });
                    if let Err(e) = ctx.server.emit(&target, "whispered", whisper).await {
                        return Err(HandlerError::Failed(e.to_string()));
                    }
                    Ok(Some(json!({ "delivered": true })))
                }),
            )
            .unwrap();
        router
    }

    async fn start(
        router: EventRouter,
    ) -> (Arc<GameServer>, String, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let server = Arc::new(GameServer::new(test_config(), router));
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        (server, url, task)
    }

    fn headers(token: Option<&str>, player: Option<&str>) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(token) = token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        if let Some(player) = player {
            headers.push(("Player-ID".to_string(), player.to_string()));
        }
        headers
    }

    async fn connect(url: &str, player: &str) -> WsClient {
        WsClient::connect(url, &headers(Some(&token()), Some(player)), &ClientOptions::default())
            .await
            .unwrap()
    }

    async fn recv_json(client: &mut WsClient) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("timed out waiting for message")
            .map(|text| serde_json::from_str(&text).unwrap())
    }

    async fn request(client: &mut WsClient, event: &str, data: Value) -> Value {
        let json = Envelope::new(event, data).to_json().unwrap();
        client.send_text(&json).await.unwrap();
        recv_json(client).await.expect("connection closed")
    }

    async fn wait_for_count(handle: &ServerHandle, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    #[tokio::test]
    async fn test_greet_round_trip() {
        let (_server, url, _task) = start(test_router()).await;
        let mut client = connect(&url, "ava").await;

        let reply = request(&mut client, "greet", json!({"name": "Ava"})).await;
        assert_eq!(reply, json!({"event": "greet", "data": {"message": "Hello, Ava!"}}));
    }

    #[tokio::test]
    async fn test_unknown_event_keeps_connection_open() {
        let (server, url, _task) = start(test_router()).await;
        let mut client = connect(&url, "p1").await;

        let json = Envelope::new("unknownThing", json!({})).to_json().unwrap();
        client.send_text(&json).await.unwrap();
        client.send_text("this is not json").await.unwrap();

        let reply = request(&mut client, "ping", json!(1)).await;
        assert_eq!(reply["data"], json!({"pong": 1}));
        assert!(client.connection().is_open());
        assert_eq!(server.handle().count().await, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_close() {
        let (_server, url, _task) = start(test_router()).await;
        let mut first = connect(&url, "p1").await;
        let mut second = connect(&url, "p2").await;

        let json = Envelope::new("explode", Value::Null).to_json().unwrap();
        first.send_text(&json).await.unwrap();

        let reply = request(&mut first, "greet", json!({"name": "Bo"})).await;
        assert_eq!(reply["data"]["message"], "Hello, Bo!");
        let reply = request(&mut second, "greet", json!({"name": "Cy"})).await;
        assert_eq!(reply["data"]["message"], "Hello, Cy!");
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut router = test_router();
        let recorder = Arc::clone(&seen);
        router
            .on(
                "record",
                handler_fn(move |data: Value, _ctx| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        // Earlier messages sleep longer
                        let n = data.as_u64().unwrap_or_default();
                        tokio::time::sleep(Duration::from_millis(30 - n * 10)).await;
                        recorder.lock().unwrap().push(n);
                        Ok(None)
                    }
                }),
            )
            .unwrap();

        let (_server, url, _task) = start(router).await;
        let mut client = connect(&url, "p1").await;
        for n in 1..=3 {
            let json = Envelope::new("record", json!(n)).to_json().unwrap();
            client.send_text(&json).await.unwrap();
        }

        request(&mut client, "ping", Value::Null).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected_until_first_closes() {
        let (server, url, _task) = start(test_router()).await;
        let handle = server.handle();

        let mut first = connect(&url, "p1").await;
        request(&mut first, "ping", Value::Null).await;

        let mut second = connect(&url, "p1").await;
        let rejection = recv_json(&mut second).await.unwrap();
        assert_eq!(rejection["event"], "error");
        assert_eq!(rejection["data"]["error"], "ERR_ALREADY_CONNECTED");
        assert!(recv_json(&mut second).await.is_none());

        first.close().await.unwrap();
        wait_for_count(&handle, 0).await;

        let mut third = connect(&url, "p1").await;
        let reply = request(&mut third, "ping", json!("again")).await;
        assert_eq!(reply["data"]["pong"], "again");
        assert_eq!(handle.identities().await, vec!["p1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_identity_single_winner() {
        let (server, url, _task) = start(test_router()).await;

        let attempt = |url: String| async move {
            let mut client = connect(&url, "p1").await;
            let json = Envelope::new("ping", Value::Null).to_json().unwrap();
            let _ = client.send_text(&json).await;
            let first = recv_json(&mut client).await.unwrap();
            (first["event"].as_str().unwrap().to_string(), client)
        };

        let (a, b) = tokio::join!(attempt(url.clone()), attempt(url.clone()));
        let mut events = vec![a.0, b.0];
        events.sort();
        assert_eq!(events, vec!["error", "ping"]);
        assert_eq!(server.handle().count().await, 1);
    }

    #[tokio::test]
    async fn test_auth_rejections() {
        let (server, url, _task) = start(test_router()).await;

        let cases = [
            (headers(None, Some("p1")), "ERR_MISSING_TOKEN"),
            (headers(Some("forged"), Some("p1")), "ERR_VALID_TOKEN"),
            (headers(Some(&token()), None), "ERR_MISSING_PLAYER_ID"),
        ];
        for (headers, expected) in cases {
            let mut client = WsClient::connect(&url, &headers, &ClientOptions::default())
                .await
                .unwrap();
            let rejection = recv_json(&mut client).await.unwrap();
            assert_eq!(rejection["data"]["error"], expected);
            assert!(recv_json(&mut client).await.is_none());
        }
        assert_eq!(server.handle().count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_path_gets_404() {
        let (_server, url, _task) = start(test_router()).await;
        let url = format!("{}lobby", url);

        let headers = headers(Some(&token()), Some("p1"));
        let result = WsClient::connect(&url, &headers, &ClientOptions::default()).await;
        match result {
            Err(ClientError::Handshake(HandshakeError::Failed(raw))) => {
                assert!(raw.contains("404"))
            }
            other => panic!("expected handshake failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_plain_http_request_gets_400() {
        let (_server, url, _task) = start(test_router()).await;
        let addr = url.trim_start_matches("ws://").trim_end_matches('/');

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_stuck_connection() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = ServerHandle::new(Arc::clone(&registry));

        let (healthy, _healthy_read, mut healthy_peer) = Connection::test_pair();
        registry.register("ash", healthy).await.unwrap();

        // One-frame queue over a tiny pipe that is never read
        let (local, _stuck_peer) = tokio::io::duplex(16);
        let (_stuck_read, stuck_write) = tokio::io::split(local);
        let options = ConnectionOptions {
            write_queue_capacity: 1,
            ..ConnectionOptions::default()
        };
        let stuck = Connection::new(stuck_write, Role::Server, None, &options);
        stuck.mark_open();
        registry.register("gary", Arc::clone(&stuck)).await.unwrap();

        let filler: Arc<[u8]> = frame::encode(&[0u8; 256], Opcode::Binary, Role::Server).into();
        let mut queued = 0;
        while queued < 8 && stuck.try_send_encoded(Arc::clone(&filler)).is_ok() {
            queued += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            stuck.try_send_encoded(Arc::clone(&filler)),
            Err(ConnectionError::QueueFull)
        ));

        let report = handle.broadcast("news", json!({"season": 3})).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec!["gary"]);

        let received = frame::decode(&mut healthy_peer, 1 << 20).await.unwrap();
        let news: Value = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(news, json!({"event": "news", "data": {"season": 3}}));
        assert!(stuck.is_open());
    }

    #[tokio::test]
    async fn test_broadcast_and_emit() {
        let (server, url, _task) = start(test_router()).await;
        let handle = server.handle();
        let mut red = connect(&url, "red").await;
        let mut blue = connect(&url, "blue").await;
        request(&mut red, "ping", Value::Null).await;
        request(&mut blue, "ping", Value::Null).await;

        let report = handle.broadcast("news", json!({"season": 2})).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());
        for client in [&mut red, &mut blue] {
            let news = recv_json(client).await.unwrap();
            assert_eq!(news, json!({"event": "news", "data": {"season": 2}}));
        }

        let reply = request(&mut red, "whisper", json!({"to": "blue", "text": "trade?"})).await;
        assert_eq!(reply["data"]["delivered"], true);
        let whispered = recv_json(&mut blue).await.unwrap();
        assert_eq!(whispered["event"], "whispered");
        assert_eq!(whispered["data"], json!({"from": "red", "text": "trade?"}));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (server, url, _task) = start(test_router()).await;
        let handle = server.handle();
        let mut client = connect(&url, "p1").await;
        request(&mut client, "ping", Value::Null).await;
        assert_eq!(handle.count().await, 1);

        client.close().await.unwrap();
        wait_for_count(&handle, 0).await;
        assert!(handle.get_connection("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (server, url, task) = start(test_router()).await;
        let mut client = connect(&url, "p1").await;
        request(&mut client, "ping", Value::Null).await;

        server.shutdown();
        assert!(recv_json(&mut client).await.is_none());
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        wait_for_count(&server.handle(), 0).await;
    }

    #[tokio::test]
    async fn test_interop_with_tungstenite_client() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::Message;

        let (_server, url, _task) = start(test_router()).await;

        let mut req = url.as_str().into_client_request().unwrap();
        req.headers_mut()
            .insert("Authorization", format!("Bearer {}", token()).parse().unwrap());
        req.headers_mut().insert("Player-ID", "misty".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

        ws.send(Message::Ping(vec![7, 7])).await.unwrap();
        ws.send(Message::Text(r#"{"event":"greet","data":{"name":"Misty"}}"#.to_string()))
            .await
            .unwrap();

        let mut saw_pong = false;
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match msg {
                Message::Pong(payload) => {
                    assert_eq!(payload, vec![7, 7]);
                    saw_pong = true;
                }
                Message::Text(text) => {
                    let reply: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(reply["data"]["message"], "Hello, Misty!");
                    break;
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(saw_pong);
        ws.close(None).await.unwrap();
    }
}
