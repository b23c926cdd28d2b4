//! Read path: full canvas, single tile and delta-since queries.
//!
//! ```text
//!   client                               server
//!     │  state {}                           │
//!     │ ──────────────────────────────────► │  every stored pixel
//!     │ ◄────────────────────────────────── │  + cursor T0
//!     │                                     │
//!     │  state {since: T0}                  │
//!     │  body {checksums: {"tx,ty": C}}     │
//!     │ ──────────────────────────────────► │  pixels written after T0
//!     │                                     │  + fresh checksum per tile
//!     │ ◄────────────────────────────────── │  + full tiles where C is stale
//!     │                                     │    or the tile moved
//! ```
//!
//! A tile sent in full always replaces its partial entries in the delta, so
//! the client never applies both.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use pixlat_core::{CanvasError, Clock, Pixel, TileChecksum, TileCoord, TileGrid};

use crate::storage::{PixelStore, StoreError};

/// Read path errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Bad query parameters (400)
    InvalidInput(String),
    /// Store failure (500)
    Storage(StoreError),
}

impl SyncError {
    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            SyncError::InvalidInput(_) => 400,
            SyncError::Storage(_) => 500,
        }
    }

    /// Message safe to show the caller.
    pub fn public_message(&self) -> String {
        match self {
            SyncError::InvalidInput(e) => e.clone(),
            SyncError::Storage(_) => "Storage unavailable".to_string(),
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::InvalidInput(e) => write!(f, "Invalid input: {e}"),
            SyncError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<CanvasError> for SyncError {
    fn from(e: CanvasError) -> Self {
        SyncError::InvalidInput(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Query parameters of a state request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub info: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub verify_checksums: bool,
}

/// Optional request body: the client's last known checksum per tile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums: Option<BTreeMap<String, String>>,
}

/// One state request, after precedence has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateRequest {
    VerifyChecksums(BTreeMap<String, String>),
    BoardInfo,
    Tile { tile_x: i64, tile_y: i64 },
    Since { since: u64, checksums: BTreeMap<String, String> },
    FullCanvas,
}

impl StateRequest {
    /// Pick the request shape: verify, info, tile, since, then full canvas.
    pub fn from_parts(query: StateQuery, body: ChecksumBody) -> Result<Self, SyncError> {
        if query.verify_checksums {
            let checksums = body.checksums.ok_or_else(|| {
                SyncError::InvalidInput("No checksum data provided for verification".into())
            })?;
            return Ok(StateRequest::VerifyChecksums(checksums));
        }
        if query.info {
            return Ok(StateRequest::BoardInfo);
        }
        match (query.tile_x, query.tile_y) {
            (Some(tile_x), Some(tile_y)) => return Ok(StateRequest::Tile { tile_x, tile_y }),
            (None, None) => {}
            _ => {
                return Err(SyncError::InvalidInput(
                    "tile_x and tile_y must be supplied together".into(),
                ))
            }
        }
        if let Some(since) = query.since {
            return Ok(StateRequest::Since {
                since,
                checksums: body.checksums.unwrap_or_default(),
            });
        }
        Ok(StateRequest::FullCanvas)
    }
}

/// Canvas bounds as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub max_tile_x: u32,
    pub max_tile_y: u32,
}

impl BoardInfo {
    pub fn of(grid: &TileGrid) -> Self {
        let config = grid.config();
        Self {
            min_x: 0,
            max_x: config.width() - 1,
            min_y: 0,
            max_y: config.height() - 1,
            tile_width: config.tile_size(),
            tile_height: config.tile_size(),
            max_tile_x: grid.max_tile_x(),
            max_tile_y: grid.max_tile_y(),
        }
    }
}

/// Complete content of one tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePayload {
    pub pixels: Vec<Pixel>,
    pub checksum: TileChecksum,
}

/// Body of every successful state reply.
///
/// Which optional fields are present depends on the request shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixels: Option<Vec<Pixel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_tiles: Option<BTreeMap<String, TilePayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_checksums: Option<BTreeMap<String, TileChecksum>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<TileChecksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdated_tiles: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<BoardInfo>,
    /// Server time; the client's next `since` cursor
    pub timestamp: u64,
}

impl StateResponse {
    fn at(timestamp: u64) -> Self {
        Self {
            success: true,
            pixels: None,
            changed_tiles: None,
            tile_checksums: None,
            checksum: None,
            outdated_tiles: None,
            info: None,
            timestamp,
        }
    }
}

/// Stateless read handler over the shared store.
pub struct SyncService {
    store: Arc<PixelStore>,
    grid: TileGrid,
    clock: Arc<dyn Clock>,
}

impl SyncService {
    pub fn new(store: Arc<PixelStore>, grid: TileGrid, clock: Arc<dyn Clock>) -> Self {
        Self { store, grid, clock }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Answer a raw state request.
    pub fn handle(&self, query: StateQuery, body: ChecksumBody) -> Result<StateResponse, SyncError> {
        match StateRequest::from_parts(query, body)? {
            StateRequest::VerifyChecksums(checksums) => self.verify_checksums(&checksums),
            StateRequest::BoardInfo => Ok(self.board_info()),
            StateRequest::Tile { tile_x, tile_y } => self.tile(tile_x, tile_y),
            StateRequest::Since { since, checksums } => self.delta_since(since, &checksums),
            StateRequest::FullCanvas => self.full_canvas(),
        }
    }

    /// Every stored pixel.
    pub fn full_canvas(&self) -> Result<StateResponse, SyncError> {
        let timestamp = self.clock.now();
        let mut response = StateResponse::at(timestamp);
        response.pixels = Some(self.store.all_pixels()?);
        Ok(response)
    }

    /// All pixels of one tile plus its checksum.
    pub fn tile(&self, tile_x: i64, tile_y: i64) -> Result<StateResponse, SyncError> {
        let tile = self.grid.validate_tile(tile_x, tile_y)?;
        let timestamp = self.clock.now();
        let payload = self.load_tile(tile)?;
        let mut response = StateResponse::at(timestamp);
        response.pixels = Some(payload.pixels);
        response.checksum = Some(payload.checksum);
        Ok(response)
    }

    /// Pixels written strictly after `since`, reconciled against the
    /// client's checksums.
    ///
    /// A supplied tile is sent in full when its checksum differs or when it
    /// already holds delta pixels; its partial entries are then removed.
    /// Keys that do not name a valid tile are skipped.
    pub fn delta_since(
        &self,
        since: u64,
        checksums: &BTreeMap<String, String>,
    ) -> Result<StateResponse, SyncError> {
        let timestamp = self.clock.now();
        let mut pixels: Vec<Pixel> = self
            .store
            .records_since(&self.grid, since)?
            .into_iter()
            .map(|r| r.pixel)
            .collect();
        let touched: BTreeSet<TileCoord> =
            pixels.iter().map(|p| self.grid.tile_of(p.x, p.y)).collect();

        let mut changed_tiles = BTreeMap::new();
        let mut tile_checksums = BTreeMap::new();
        let mut full_tiles = BTreeSet::new();

        for (key, client_checksum) in checksums {
            let tile = match self.grid.tile_from_key(key) {
                Ok(tile) => tile,
                Err(e) => {
                    log::debug!("Skipping checksum entry: {e}");
                    continue;
                }
            };
            let payload = self.load_tile(tile)?;
            tile_checksums.insert(tile.key(), payload.checksum);
            if !payload.checksum.matches(client_checksum) || touched.contains(&tile) {
                full_tiles.insert(tile);
                changed_tiles.insert(tile.key(), payload);
            }
        }

        pixels.retain(|p| !full_tiles.contains(&self.grid.tile_of(p.x, p.y)));

        let mut response = StateResponse::at(timestamp);
        response.pixels = Some(pixels);
        response.changed_tiles = Some(changed_tiles);
        response.tile_checksums = Some(tile_checksums);
        Ok(response)
    }

    /// Report which supplied tiles are stale, without sending pixels.
    pub fn verify_checksums(
        &self,
        checksums: &BTreeMap<String, String>,
    ) -> Result<StateResponse, SyncError> {
        let timestamp = self.clock.now();
        let mut outdated = BTreeMap::new();
        for (key, client_checksum) in checksums {
            let Ok(tile) = self.grid.tile_from_key(key) else {
                continue;
            };
            if !self.store.tile_checksum(&self.grid, tile)?.matches(client_checksum) {
                outdated.insert(tile.key(), true);
            }
        }
        let mut response = StateResponse::at(timestamp);
        response.outdated_tiles = Some(outdated);
        Ok(response)
    }

    /// Canvas bounds and tile geometry.
    pub fn board_info(&self) -> StateResponse {
        let mut response = StateResponse::at(self.clock.now());
        response.info = Some(BoardInfo::of(&self.grid));
        response
    }

    fn load_tile(&self, tile: TileCoord) -> Result<TilePayload, StoreError> {
        let pixels = self.store.pixels_in_rect(self.grid.bounds_of(tile))?;
        let checksum = TileChecksum::of_sorted(&pixels);
        Ok(TilePayload { pixels, checksum })
    }
}
