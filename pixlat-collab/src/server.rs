//! WebSocket canvas server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── SyncService ────┐
//!            ├── connection ───┼── WriteAdmission ─┼── PixelStore (RocksDB)
//! Client B ──┘    (per task)   ├── ExportService ──┘
//!                              └── ActivePresence
//!                                        │
//!                   accepted write ──────┴──► PixelBroadcast
//!                                                  │
//!                                   ┌──────────────┼──────────────┐
//!                                   ▼              ▼              ▼
//!                                Client A       Client B       Client C
//! ```
//!
//! Connection tasks hold no canvas state: every request reads and writes the
//! shared store, and pushed pixel events are a latency optimization on top
//! of the delta sync, not a replacement for it. Store calls block (a write
//! may wait on a row lock), so they run on tokio's blocking pool.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 7

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite::Message;

use pixlat_core::{CanvasConfig, Clock, TileGrid, WriterId};

use crate::admission::{AdmissionConfig, PlacementRequest, WriteAdmission};
use crate::broadcast::{PeerInfo, PixelBroadcast};
use crate::export::{Export, ExportQuery, ExportService};
use crate::protocol::{binary_follows, Endpoint, PixelEvent, Request, ServerMessage};
use crate::stats::{ActivePresence, StatsReport, DEFAULT_PRESENCE_TTL_SECS};
use crate::storage::{PixelStore, StoreConfig, StoreError};
use crate::sync::{ChecksumBody, StateQuery, SyncService};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Pixel store settings
    pub storage: StoreConfig,
    /// Canvas geometry
    pub canvas: CanvasConfig,
    /// Write admission settings
    pub admission: AdmissionConfig,
    /// Pixel events buffered per connection
    pub broadcast_capacity: usize,
    /// Seconds a caller counts as active after its last stats request
    pub presence_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage: StoreConfig::default(),
            canvas: CanvasConfig::default(),
            admission: AdmissionConfig::default(),
            broadcast_capacity: 1024,
            presence_ttl_secs: DEFAULT_PRESENCE_TTL_SECS,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub accepted_writes: u64,
    pub rejected_writes: u64,
    pub malformed_frames: u64,
}

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Store(StoreError),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Store(e) => write!(f, "Store error: {e}"),
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Store(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Handles shared by every connection task.
struct CanvasContext {
    store: Arc<PixelStore>,
    sync: SyncService,
    admission: WriteAdmission,
    exporter: ExportService,
    presence: ActivePresence,
    broadcast: PixelBroadcast,
    clock: Arc<dyn Clock>,
    stats: RwLock<ServerStats>,
}

/// Frames produced by one request.
struct Routed {
    reply: ServerMessage,
    binary: Option<Vec<u8>>,
    event: Option<PixelEvent>,
}

impl Routed {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply,
            binary: None,
            event: None,
        }
    }
}

/// The canvas server.
pub struct CanvasServer {
    config: ServerConfig,
    ctx: Arc<CanvasContext>,
}

impl CanvasServer {
    /// Open the provisioned store named in `config` and build the server.
    pub fn open(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self, ServerError> {
        let store = Arc::new(PixelStore::open(config.storage.clone())?);
        Ok(Self::with_store(config, store, clock))
    }

    /// Build the server around an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<PixelStore>, clock: Arc<dyn Clock>) -> Self {
        let grid = TileGrid::new(config.canvas);
        let ctx = CanvasContext {
            sync: SyncService::new(store.clone(), grid, clock.clone()),
            admission: WriteAdmission::new(store.clone(), grid, clock.clone(), config.admission),
            exporter: ExportService::new(store.clone(), grid, clock.clone()),
            presence: ActivePresence::new(config.presence_ttl_secs),
            broadcast: PixelBroadcast::new(config.broadcast_capacity),
            store,
            clock,
            stats: RwLock::new(ServerStats::default()),
        };
        Self {
            config,
            ctx: Arc::new(ctx),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Canvas server listening on {} ({}x{}, tile {})",
            listener.local_addr()?,
            self.config.canvas.width(),
            self.config.canvas.height(),
            self.config.canvas.tile_size()
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<CanvasContext>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let peer = PeerInfo::new(addr);
        let peer_id = peer.peer_id;
        let writer = peer.writer.clone();
        let mut broadcast_rx = ctx.broadcast.add_peer(peer).await;

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let routed = Self::handle_frame(&ctx, text.as_str(), &writer).await;
                                ws_sender.send(Message::Text(routed.reply.encode()?.into())).await?;
                                if let Some(bytes) = routed.binary {
                                    ws_sender.send(Message::Binary(bytes.into())).await?;
                                }
                                if let Some(event) = routed.event {
                                    ctx.broadcast.publish(event)?;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                ctx.stats.write().await.malformed_frames += 1;
                                let reply = ServerMessage::error(0, 400, "Binary frames are not accepted");
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = broadcast_rx.recv() => {
                        match frame {
                            Ok(text) => {
                                ws_sender.send(Message::Text(text.as_str().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                ctx.broadcast.record_skipped(n);
                                log::warn!("Peer {addr} lagged by {n} pixel events");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        ctx.broadcast.remove_peer(&peer_id).await;
        ctx.stats.write().await.active_connections -= 1;
        result
    }

    /// Decode one text frame and route it.
    async fn handle_frame(ctx: &Arc<CanvasContext>, text: &str, writer: &WriterId) -> Routed {
        ctx.stats.write().await.total_requests += 1;
        match Request::decode(text) {
            Ok(request) => Self::route(ctx, request, writer).await,
            Err(e) => {
                log::warn!("Malformed frame from {writer}: {e}");
                ctx.stats.write().await.malformed_frames += 1;
                Routed::reply(ServerMessage::error(0, 400, "Malformed request"))
            }
        }
    }

    /// Dispatch a decoded request to its endpoint.
    async fn route(ctx: &Arc<CanvasContext>, request: Request, writer: &WriterId) -> Routed {
        let id = request.id;
        let Some(endpoint) = Endpoint::parse(&request.endpoint) else {
            return Routed::reply(ServerMessage::error(id, 404, "Unknown endpoint"));
        };
        if !endpoint.allows(request.method) {
            return Routed::reply(ServerMessage::error(id, 405, "Method not allowed"));
        }
        log::debug!("{writer} → {} #{id}", endpoint.as_str());

        match endpoint {
            Endpoint::State => Self::handle_state(ctx, &request).await,
            Endpoint::Pixel => Self::handle_pixel(ctx, &request, writer).await,
            Endpoint::Export => Self::handle_export(ctx, &request).await,
            Endpoint::Stats => Self::handle_stats(ctx, &request, writer).await,
        }
    }

    async fn handle_state(ctx: &Arc<CanvasContext>, request: &Request) -> Routed {
        let id = request.id;
        let parts = request
            .query_or_default::<StateQuery>()
            .and_then(|q| request.body_or_default::<ChecksumBody>().map(|b| (q, b)));
        let (query, body) = match parts {
            Ok(parts) => parts,
            Err(e) => return Routed::reply(ServerMessage::error(id, 400, e.to_string())),
        };

        let handled = match on_blocking_pool(ctx, move |ctx| ctx.sync.handle(query, body)).await {
            Ok(handled) => handled,
            Err(e) => return Routed::reply(join_failure(id, e)),
        };
        match handled {
            Ok(response) => Routed::reply(ok_or_internal(id, &response)),
            Err(e) => {
                if e.status() >= 500 {
                    log::error!("State request #{id} failed: {e}");
                }
                Routed::reply(ServerMessage::error(id, e.status(), e.public_message()))
            }
        }
    }

    async fn handle_pixel(ctx: &Arc<CanvasContext>, request: &Request, writer: &WriterId) -> Routed {
        let id = request.id;
        let placement: PlacementRequest = match request.body_required() {
            Ok(p) => p,
            Err(e) => {
                return Routed::reply(ServerMessage::error(
                    id,
                    400,
                    format!("Missing or invalid pixel parameters: {e}"),
                ))
            }
        };

        let caller = writer.clone();
        let placed = on_blocking_pool(ctx, move |ctx| ctx.admission.place(&placement, &caller)).await;
        let placed = match placed {
            Ok(placed) => placed,
            Err(e) => return Routed::reply(join_failure(id, e)),
        };
        match placed {
            Ok(admitted) => {
                ctx.stats.write().await.accepted_writes += 1;
                Routed {
                    reply: ok_or_internal(id, &admitted.placement),
                    binary: None,
                    event: Some(PixelEvent::from(&admitted.record)),
                }
            }
            Err(rejection) => {
                ctx.stats.write().await.rejected_writes += 1;
                let body = rejection.to_body();
                Routed::reply(match serde_json::to_value(&body) {
                    Ok(value) => ServerMessage::reply(id, rejection.status(), value),
                    Err(e) => ServerMessage::error(id, 500, e.to_string()),
                })
            }
        }
    }

    async fn handle_export(ctx: &Arc<CanvasContext>, request: &Request) -> Routed {
        let id = request.id;
        let query: ExportQuery = match request.query_or_default() {
            Ok(q) => q,
            Err(e) => return Routed::reply(ServerMessage::error(id, 400, e.to_string())),
        };

        let exported = match on_blocking_pool(ctx, move |ctx| ctx.exporter.export(&query)).await {
            Ok(exported) => exported,
            Err(e) => return Routed::reply(join_failure(id, e)),
        };
        match exported {
            Ok(Export::Pixels(body)) => Routed::reply(ok_or_internal(id, &body)),
            Ok(Export::Grid(body)) => Routed::reply(ok_or_internal(id, &body)),
            Ok(Export::Csv(data)) => Routed::reply(ServerMessage::reply(
                id,
                200,
                serde_json::json!({ "success": true, "format": "csv", "data": data }),
            )),
            Ok(Export::Binary(bytes)) => Routed {
                reply: ServerMessage::reply(id, 200, binary_follows(bytes.len())),
                binary: Some(bytes),
                event: None,
            },
            Err(e) => {
                if e.status() >= 500 {
                    log::error!("Export request #{id} failed: {e}");
                }
                Routed::reply(ServerMessage::error(id, e.status(), e.public_message()))
            }
        }
    }

    async fn handle_stats(ctx: &Arc<CanvasContext>, request: &Request, writer: &WriterId) -> Routed {
        let id = request.id;
        let now = ctx.clock.now();
        match StatsReport::collect(ctx.store.clone(), &ctx.presence, writer, now).await {
            Ok(report) => Routed::reply(ok_or_internal(id, &report)),
            Err(e) => {
                log::error!("Stats request #{id} failed: {e}");
                Routed::reply(ServerMessage::error(id, 500, "Storage unavailable"))
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PixelStore> {
        &self.ctx.store
    }

    pub fn broadcast(&self) -> &PixelBroadcast {
        &self.ctx.broadcast
    }
}

/// Run a store-bound call on the blocking pool.
async fn on_blocking_pool<T, F>(ctx: &Arc<CanvasContext>, call: F) -> Result<T, JoinError>
where
    F: FnOnce(&CanvasContext) -> T + Send + 'static,
    T: Send + 'static,
{
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || call(&ctx)).await
}

fn join_failure(id: u64, e: JoinError) -> ServerMessage {
    log::error!("Request #{id} did not complete: {e}");
    ServerMessage::error(id, 500, "Internal error")
}

fn ok_or_internal(id: u64, body: &impl serde::Serialize) -> ServerMessage {
    ServerMessage::ok(id, body).unwrap_or_else(|e| {
        log::error!("Failed to encode reply #{id}: {e}");
        ServerMessage::error(id, 500, "Internal error")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixlat_core::ManualClock;
    use serde_json::json;

    fn test_server(dir: &tempfile::TempDir) -> CanvasServer {
        let storage = StoreConfig::for_testing(dir.path().join("db"));
        PixelStore::provision(&storage).unwrap();
        let config = ServerConfig {
            storage,
            canvas: CanvasConfig::new(8, 8, 4).unwrap(),
            admission: AdmissionConfig::unlimited(),
            ..ServerConfig::default()
        };
        CanvasServer::open(config, Arc::new(ManualClock::new(100))).unwrap()
    }

    fn request(id: u64, method: &str, endpoint: &str, body: serde_json::Value) -> String {
        json!({"id": id, "method": method, "endpoint": endpoint, "body": body}).to_string()
    }

    fn reply_parts(msg: &ServerMessage) -> (u64, u16, &serde_json::Value) {
        match msg {
            ServerMessage::Reply { id, status, body } => (*id, *status, body),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.canvas.tile_size(), 32);
        assert_eq!(config.presence_ttl_secs, 30);
    }

    #[test]
    fn test_open_unprovisioned_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage: StoreConfig::for_testing(dir.path().join("nothing")),
            ..ServerConfig::default()
        };
        assert!(matches!(
            CanvasServer::open(config, Arc::new(ManualClock::new(0))),
            Err(ServerError::Store(StoreError::NotProvisioned(_)))
        ));
    }

    #[tokio::test]
    async fn test_route_unknown_and_method() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir);
        let writer = WriterId::new("127.0.0.1");

        let routed = CanvasServer::handle_frame(&server.ctx, &request(1, "GET", "nope", json!(null)), &writer).await;
        assert_eq!(reply_parts(&routed.reply).1, 404);

        let routed = CanvasServer::handle_frame(&server.ctx, &request(2, "GET", "pixel", json!(null)), &writer).await;
        let (id, status, _) = reply_parts(&routed.reply);
        assert_eq!((id, status), (2, 405));

        let routed = CanvasServer::handle_frame(&server.ctx, "{not json", &writer).await;
        assert_eq!(reply_parts(&routed.reply).0, 0);
        assert_eq!(reply_parts(&routed.reply).1, 400);
        assert_eq!(server.stats().await.malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_route_pixel_produces_event() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir);
        let writer = WriterId::new("127.0.0.1");

        let frame = request(3, "POST", "pixel", json!({"x": 1, "y": 2, "r": 3, "g": 4, "b": 5}));
        let routed = CanvasServer::handle_frame(&server.ctx, &frame, &writer).await;
        let (_, status, body) = reply_parts(&routed.reply);
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
        assert_eq!(body["stats"]["user_pixels"], 1);
        assert_eq!(
            routed.event,
            Some(PixelEvent { x: 1, y: 2, r: 3, g: 4, b: 5, timestamp: 100 })
        );
        assert_eq!(server.stats().await.accepted_writes, 1);
    }

    #[tokio::test]
    async fn test_route_pixel_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir);
        let writer = WriterId::new("127.0.0.1");

        let frame = request(4, "POST", "pixel", json!({"x": 8, "y": 0, "r": 0, "g": 0, "b": 0}));
        let routed = CanvasServer::handle_frame(&server.ctx, &frame, &writer).await;
        assert_eq!(reply_parts(&routed.reply).1, 400);
        assert!(routed.event.is_none());

        let frame = request(5, "POST", "pixel", json!({"x": 1}));
        let routed = CanvasServer::handle_frame(&server.ctx, &frame, &writer).await;
        assert_eq!(reply_parts(&routed.reply).1, 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_pixels_on_different_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir);

        let tasks: Vec<_> = (0..4u32)
            .map(|i| {
                let ctx = server.ctx.clone();
                tokio::spawn(async move {
                    let writer = WriterId::new(format!("10.0.0.{i}"));
                    let (x, y) = ((i % 2) * 4, (i / 2) * 4);
                    let frame = request(
                        u64::from(i),
                        "POST",
                        "pixel",
                        json!({"x": x, "y": y, "r": 1, "g": 2, "b": 3}),
                    );
                    CanvasServer::handle_frame(&ctx, &frame, &writer).await
                })
            })
            .collect();

        for task in tasks {
            let routed = task.await.unwrap();
            assert_eq!(reply_parts(&routed.reply).1, 200);
            assert!(routed.event.is_some());
        }
        assert_eq!(server.store().live_pixels().unwrap(), 4);
        assert_eq!(server.stats().await.accepted_writes, 4);
    }

    #[tokio::test]
    async fn test_route_stats_counts_live_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir);
        let a = WriterId::new("10.0.0.1");
        let b = WriterId::new("10.0.0.2");
        let pixel = |id| request(id, "POST", "pixel", json!({"x": 0, "y": 0, "r": 1, "g": 1, "b": 1}));

        CanvasServer::handle_frame(&server.ctx, &pixel(1), &a).await;
        CanvasServer::handle_frame(&server.ctx, &pixel(2), &a).await;
        CanvasServer::handle_frame(&server.ctx, &pixel(3), &b).await;

        let routed = CanvasServer::handle_frame(&server.ctx, &request(4, "GET", "stats", json!(null)), &b).await;
        let (_, status, body) = reply_parts(&routed.reply);
        assert_eq!(status, 200);
        assert_eq!(
            body["user_stats"],
            json!({"user_pixels": 1, "total_pixels": 1, "percentage": 100.0})
        );
        assert_eq!(body["top_contributor"]["pixels"], 1);
    }

    #[tokio::test]
    async fn test_route_binary_export() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(&dir);
        let writer = WriterId::new("127.0.0.1");

        let frame = json!({"id": 6, "method": "GET", "endpoint": "export",
                           "query": {"format": "binary"}})
        .to_string();
        let routed = CanvasServer::handle_frame(&server.ctx, &frame, &writer).await;
        let (_, status, body) = reply_parts(&routed.reply);
        assert_eq!(status, 200);
        assert_eq!(body["format"], "binary");
        assert_eq!(routed.binary, Some(vec![0, 0, 0, 0]));
    }
}
