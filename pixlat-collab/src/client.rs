//! WebSocket canvas client.
//!
//! Provides:
//! - Request/reply correlation by id over one connection
//! - Bootstrap (board info + full canvas) into a [`CanvasMirror`]
//! - Delta sync carrying the mirror's per-tile checksums
//! - Pixel placement with an optional checksum precondition
//! - Pushed pixel events, applied to the mirror and forwarded to the caller
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use pixlat_core::{CanvasConfig, Pixel, TileChecksum, TileCoord, TileGrid};

use crate::admission::{Placement, PlacementRequest, RejectionBody};
use crate::export::{decode_binary, ExportFormat, ExportQuery};
use crate::mirror::CanvasMirror;
use crate::protocol::{announces_binary, Endpoint, Method, PixelEvent, ProtocolError, Request, ServerMessage};
use crate::stats::StatsReport;
use crate::sync::{ChecksumBody, StateQuery, StateResponse};

/// Seconds subtracted from the cursor on every delta request.
///
/// Timestamps have one-second resolution, so a write committed in the same
/// second as the previous reply would otherwise be skipped. Replays are
/// idempotent.
pub const SYNC_OVERLAP_SECS: u64 = 1;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A pixel committed by any writer
    Pixel(PixelEvent),
    /// Connection lost
    Disconnected,
}

/// A reply as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
    /// Binary frame that followed the reply, if announced
    pub binary: Option<Vec<u8>>,
}

impl Reply {
    /// Decode a 200 reply body.
    pub fn into_ok<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        if self.status != 200 {
            return Err(self.unexpected());
        }
        serde_json::from_value(self.body)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    fn unexpected(&self) -> ProtocolError {
        ProtocolError::UnexpectedReply {
            status: self.status,
            body: self.body.to_string(),
        }
    }
}

/// Outcome of a placement that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceOutcome {
    Placed(Placement),
    /// The tile changed under us; the mirror should be refreshed
    ChecksumMismatch { current: TileChecksum },
    RateLimited { retry_after_secs: u64 },
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// The canvas client.
pub struct CanvasClient {
    server_url: String,
    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Message>,
    /// Requests awaiting a reply, by id
    pending: PendingReplies,
    next_id: AtomicU64,
    /// Loaded by `bootstrap`
    mirror: Arc<RwLock<Option<CanvasMirror>>>,
    state: Arc<RwLock<ConnectionState>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    request_timeout: Duration,
}

impl CanvasClient {
    /// Connect to a canvas server.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self, ProtocolError> {
        let server_url = server_url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&server_url)
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {server_url}: {e}");
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(1024);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let mirror: Arc<RwLock<Option<CanvasMirror>>> = Arc::new(RwLock::new(None));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: route replies and pushed events
        {
            let pending = pending.clone();
            let mirror = mirror.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let mut awaiting_binary: Option<(u64, u16, Value)> = None;
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                            Ok(ServerMessage::Reply { id, status, body }) => {
                                if status == 200 && announces_binary(&body) {
                                    awaiting_binary = Some((id, status, body));
                                } else {
                                    complete(&pending, id, Reply { status, body, binary: None }).await;
                                }
                            }
                            Ok(ServerMessage::Pixel(event)) => {
                                if let Some(m) = mirror.write().await.as_mut() {
                                    m.apply_event(&event);
                                }
                                if event_tx.try_send(ClientEvent::Pixel(event)).is_err() {
                                    log::debug!("Event queue full, dropping pixel event");
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from server: {e}"),
                        },
                        Ok(Message::Binary(data)) => match awaiting_binary.take() {
                            Some((id, status, body)) => {
                                let reply = Reply { status, body, binary: Some(data.to_vec()) };
                                complete(&pending, id, reply).await;
                            }
                            None => log::warn!("Unannounced binary frame of {} bytes", data.len()),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                // Connection lost: fail every outstanding request
                *state.write().await = ConnectionState::Disconnected;
                pending.lock().await.clear();
                let _ = event_tx.try_send(ClientEvent::Disconnected);
            });
        }

        log::info!("Connected to canvas server {server_url}");
        Ok(Self {
            server_url,
            outgoing_tx,
            pending,
            next_id: AtomicU64::new(1),
            mirror,
            state,
            event_rx: Some(event_rx),
            request_timeout: Duration::from_secs(10),
        })
    }

    /// Set how long to wait for each reply.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<Reply, ProtocolError> {
        let id = request.id;
        let text = request.encode()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing_tx.send(Message::Text(text.into())).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Build a request with a fresh id.
    pub fn new_request(&self, method: Method, endpoint: Endpoint) -> Request {
        Request::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, endpoint)
    }

    /// Raw state query.
    pub async fn state(
        &self,
        query: &StateQuery,
        body: &ChecksumBody,
    ) -> Result<StateResponse, ProtocolError> {
        let request = self
            .new_request(Method::Get, Endpoint::State)
            .with_query(query)?
            .with_body(body)?;
        self.request(request).await?.into_ok()
    }

    /// Load board geometry and the full canvas into a fresh mirror.
    pub async fn bootstrap(&self) -> Result<StateResponse, ProtocolError> {
        let info_query = StateQuery {
            info: true,
            ..StateQuery::default()
        };
        let info = self
            .state(&info_query, &ChecksumBody::default())
            .await?
            .info
            .ok_or_else(|| ProtocolError::DeserializationError("board info missing".into()))?;
        let config = CanvasConfig::new(info.max_x + 1, info.max_y + 1, info.tile_width)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;

        let full = self
            .state(&StateQuery::default(), &ChecksumBody::default())
            .await?;
        let mut mirror = CanvasMirror::new(TileGrid::new(config));
        mirror.apply_full(&full);
        log::info!(
            "Bootstrapped {} pixels from {}",
            mirror.pixel_count(),
            self.server_url
        );
        *self.mirror.write().await = Some(mirror);
        Ok(full)
    }

    /// Reload one tile into the mirror.
    pub async fn fetch_tile(&self, tile: TileCoord) -> Result<StateResponse, ProtocolError> {
        let query = StateQuery {
            tile_x: Some(tile.x as i64),
            tile_y: Some(tile.y as i64),
            ..StateQuery::default()
        };
        let response = self.state(&query, &ChecksumBody::default()).await?;
        self.mirror
            .write()
            .await
            .as_mut()
            .ok_or(ProtocolError::NotBootstrapped)?
            .apply_tile(tile, &response);
        Ok(response)
    }

    /// Delta sync using the mirror's cursor and checksums of its occupied
    /// tiles.
    pub async fn sync(&self) -> Result<StateResponse, ProtocolError> {
        let (since, checksums) = {
            let guard = self.mirror.read().await;
            let mirror = guard.as_ref().ok_or(ProtocolError::NotBootstrapped)?;
            let since = mirror.cursor().unwrap_or(0).saturating_sub(SYNC_OVERLAP_SECS);
            (since, mirror.checksum_map(mirror.occupied_tiles()))
        };
        self.sync_with(since, checksums).await
    }

    /// Delta sync with explicit cursor and checksums.
    pub async fn sync_with(
        &self,
        since: u64,
        checksums: BTreeMap<String, String>,
    ) -> Result<StateResponse, ProtocolError> {
        let query = StateQuery {
            since: Some(since),
            ..StateQuery::default()
        };
        let body = ChecksumBody {
            checksums: Some(checksums),
        };
        let response = self.state(&query, &body).await?;
        if let Some(mirror) = self.mirror.write().await.as_mut() {
            mirror.apply_delta(&response);
        }
        Ok(response)
    }

    /// Place a pixel.
    ///
    /// With `precondition`, the mirror's digest of the target tile is sent
    /// and the server refuses the write if the tile has moved on.
    pub async fn place_pixel(&self, pixel: Pixel, precondition: bool) -> Result<PlaceOutcome, ProtocolError> {
        let mut body = PlacementRequest::new(pixel);
        if precondition {
            let guard = self.mirror.read().await;
            let mirror = guard.as_ref().ok_or(ProtocolError::NotBootstrapped)?;
            body = body.with_checksum(mirror.local_checksum(mirror.grid().tile_of(pixel.x, pixel.y)));
        }
        self.place(pixel, &body).await
    }

    /// Place a pixel with an explicit request body.
    pub async fn place(&self, pixel: Pixel, body: &PlacementRequest) -> Result<PlaceOutcome, ProtocolError> {
        let request = self.new_request(Method::Post, Endpoint::Pixel).with_body(body)?;
        let reply = self.request(request).await?;

        let succeeded = reply.body.get("success").and_then(Value::as_bool) == Some(true);
        match reply.status {
            200 if succeeded => {
                let placement: Placement = reply.into_ok()?;
                if let Some(mirror) = self.mirror.write().await.as_mut() {
                    mirror.apply_placement(pixel, &placement);
                }
                Ok(PlaceOutcome::Placed(placement))
            }
            200 | 429 => {
                let status = reply.status;
                let rejection: RejectionBody = serde_json::from_value(reply.body.clone())
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                match (status, rejection.checksum, rejection.retry_after) {
                    (200, Some(current), _) => {
                        if let Some(mirror) = self.mirror.write().await.as_mut() {
                            let tile = mirror.grid().tile_of(pixel.x, pixel.y);
                            mirror.note_server_checksum(tile, current);
                        }
                        Ok(PlaceOutcome::ChecksumMismatch { current })
                    }
                    (429, _, retry_after) => Ok(PlaceOutcome::RateLimited {
                        retry_after_secs: retry_after.unwrap_or(0),
                    }),
                    _ => Err(reply.unexpected()),
                }
            }
            _ => Err(reply.unexpected()),
        }
    }

    /// Contributor statistics for this connection's address.
    pub async fn stats(&self) -> Result<StatsReport, ProtocolError> {
        let request = self.new_request(Method::Get, Endpoint::Stats);
        self.request(request).await?.into_ok()
    }

    /// Raw export reply in any format.
    pub async fn export(&self, query: &ExportQuery) -> Result<Reply, ProtocolError> {
        let request = self.new_request(Method::Get, Endpoint::Export).with_query(query)?;
        self.request(request).await
    }

    /// Binary export of the whole canvas, decoded.
    pub async fn export_binary(&self) -> Result<Vec<Pixel>, ProtocolError> {
        let reply = self.export(&ExportQuery::whole_canvas(ExportFormat::Binary)).await?;
        let bytes = match (reply.status, &reply.binary) {
            (200, Some(bytes)) => bytes,
            _ => return Err(reply.unexpected()),
        };
        decode_binary(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Run `f` against the mirror, if it has been loaded.
    pub async fn with_mirror<R>(&self, f: impl FnOnce(&CanvasMirror) -> R) -> Option<R> {
        self.mirror.read().await.as_ref().map(f)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

async fn complete(pending: &PendingReplies, id: u64, reply: Reply) {
    match pending.lock().await.remove(&id) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => log::debug!("Reply #{id} has no waiting request"),
    }
}
