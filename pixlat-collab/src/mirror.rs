//! Client-side copy of the canvas, organised by tile.
//!
//! The mirror applies the four kinds of server updates:
//!
//! | Update          | Effect                                              |
//! |-----------------|-----------------------------------------------------|
//! | full canvas     | replace everything, move the cursor                 |
//! | single tile     | replace one tile, record its server checksum        |
//! | delta           | upsert pixels, replace full tiles, move the cursor  |
//! | pushed pixel    | upsert one pixel                                    |
//!
//! Replacing a tile wholesale is what makes removals (a bulk reset on the
//! server) visible: partial updates can only add or recolor pixels.

use std::collections::{BTreeMap, HashMap};

use pixlat_core::{Color, Pixel, TileChecksum, TileCoord, TileGrid};

use crate::admission::Placement;
use crate::protocol::PixelEvent;
use crate::sync::StateResponse;

/// Mirrored canvas state.
#[derive(Debug, Clone)]
pub struct CanvasMirror {
    grid: TileGrid,
    /// Per tile: `(y, x)` → color, so iteration is in canonical order
    tiles: HashMap<TileCoord, BTreeMap<(u32, u32), Color>>,
    /// Last checksum the server reported for each tile
    server_checksums: HashMap<TileCoord, TileChecksum>,
    /// Server timestamp of the last full or delta update
    cursor: Option<u64>,
}

impl CanvasMirror {
    pub fn new(grid: TileGrid) -> Self {
        Self {
            grid,
            tiles: HashMap::new(),
            server_checksums: HashMap::new(),
            cursor: None,
        }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Cursor for the next delta request; `None` before the first load.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Color at a coordinate, if painted.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        self.tiles
            .get(&self.grid.tile_of(x, y))
            .and_then(|tile| tile.get(&(y, x)).copied())
    }

    pub fn pixel_count(&self) -> usize {
        self.tiles.values().map(BTreeMap::len).sum()
    }

    /// Pixels of one tile in `(y, x)` order.
    pub fn tile_pixels(&self, tile: TileCoord) -> Vec<Pixel> {
        self.tiles
            .get(&tile)
            .map(|t| {
                t.iter()
                    .map(|(&(y, x), &color)| Pixel::new(x, y, color))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Digest of the mirrored content of a tile.
    pub fn local_checksum(&self, tile: TileCoord) -> TileChecksum {
        TileChecksum::of_sorted(&self.tile_pixels(tile))
    }

    pub fn server_checksum(&self, tile: TileCoord) -> Option<TileChecksum> {
        self.server_checksums.get(&tile).copied()
    }

    /// Tiles holding at least one mirrored pixel, in row-major order.
    pub fn occupied_tiles(&self) -> Vec<TileCoord> {
        let mut tiles: Vec<TileCoord> = self
            .tiles
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(tile, _)| *tile)
            .collect();
        tiles.sort_unstable_by_key(|t| (t.y, t.x));
        tiles
    }

    /// Local digests keyed `"tx,ty"`, as sent with a delta request.
    pub fn checksum_map(&self, tiles: impl IntoIterator<Item = TileCoord>) -> BTreeMap<String, String> {
        tiles
            .into_iter()
            .map(|tile| (tile.key(), self.local_checksum(tile).to_hex()))
            .collect()
    }

    /// Replace the whole mirror with a full-canvas response.
    pub fn apply_full(&mut self, response: &StateResponse) {
        self.tiles.clear();
        self.server_checksums.clear();
        for pixel in response.pixels.iter().flatten() {
            self.set(*pixel);
        }
        self.cursor = Some(response.timestamp);
    }

    /// Replace one tile with a single-tile response.
    ///
    /// The cursor is left alone: a tile read says nothing about the rest of
    /// the canvas.
    pub fn apply_tile(&mut self, tile: TileCoord, response: &StateResponse) {
        let pixels = response.pixels.as_deref().unwrap_or_default();
        self.replace_tile(tile, pixels);
        if let Some(checksum) = response.checksum {
            self.server_checksums.insert(tile, checksum);
        }
    }

    /// Merge a delta response.
    ///
    /// Partial pixels are applied first, then every tile sent in full
    /// replaces the mirrored tile.
    pub fn apply_delta(&mut self, response: &StateResponse) {
        for pixel in response.pixels.iter().flatten() {
            self.set(*pixel);
        }
        for (key, payload) in response.changed_tiles.iter().flatten() {
            match self.grid.tile_from_key(key) {
                Ok(tile) => {
                    self.replace_tile(tile, &payload.pixels);
                    self.server_checksums.insert(tile, payload.checksum);
                }
                Err(e) => log::warn!("Ignoring changed tile {key:?}: {e}"),
            }
        }
        for (key, checksum) in response.tile_checksums.iter().flatten() {
            if let Ok(tile) = self.grid.tile_from_key(key) {
                self.server_checksums.insert(tile, *checksum);
            }
        }
        self.cursor = Some(self.cursor.map_or(response.timestamp, |c| c.max(response.timestamp)));
    }

    /// Apply a pixel pushed by the server.
    pub fn apply_event(&mut self, event: &PixelEvent) {
        self.set(event.pixel());
    }

    /// Apply our own accepted placement.
    pub fn apply_placement(&mut self, pixel: Pixel, placement: &Placement) {
        self.set(pixel);
        self.server_checksums
            .insert(self.grid.tile_of(pixel.x, pixel.y), placement.checksum);
    }

    /// Record a checksum learned from a rejected placement.
    pub fn note_server_checksum(&mut self, tile: TileCoord, checksum: TileChecksum) {
        self.server_checksums.insert(tile, checksum);
    }

    /// Whether the mirrored tile matches the server's last reported digest.
    pub fn is_tile_current(&self, tile: TileCoord) -> Option<bool> {
        self.server_checksum(tile)
            .map(|server| server == self.local_checksum(tile))
    }

    fn set(&mut self, pixel: Pixel) {
        if !self.grid.contains(pixel.x as i64, pixel.y as i64) {
            log::debug!("Ignoring pixel outside the canvas: ({}, {})", pixel.x, pixel.y);
            return;
        }
        self.tiles
            .entry(self.grid.tile_of(pixel.x, pixel.y))
            .or_default()
            .insert(pixel.scan_key(), pixel.color());
    }

    fn replace_tile(&mut self, tile: TileCoord, pixels: &[Pixel]) {
        let bounds = self.grid.bounds_of(tile);
        let content: BTreeMap<(u32, u32), Color> = pixels
            .iter()
            .filter(|p| bounds.contains(p.x, p.y))
            .map(|p| (p.scan_key(), p.color()))
            .collect();
        self.tiles.insert(tile, content);
    }
}
