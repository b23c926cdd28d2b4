//! Tile indexer: partitions the canvas into fixed-size square tiles.
//!
//! ```text
//!   x →  0   S   2S  ...           W
//! y  ┌───┬───┬───┬─────────────┬──┐
//! ↓  │0,0│1,0│2,0│     ...     │  │ ← last column clipped to W
//!  S ├───┼───┼───┼─────────────┼──┤
//!    │0,1│1,1│2,1│     ...     │  │
//!    ├───┼───┼───┼─────────────┼──┤
//!  H └───┴───┴───┴─────────────┴──┘ ← last row clipped to H
//! ```
//!
//! A coordinate belongs to exactly one tile, chosen by floor division.
//! Everything here is a pure function of the [`CanvasConfig`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::CanvasConfig;
use crate::error::CanvasError;

/// Tile coordinate `(tile_x, tile_y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Wire key used in checksum maps: `"tx,ty"`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Raw, unvalidated tile key as sent by a client.
///
/// Parsed leniently into signed integers so that negative or oversized
/// coordinates can be reported (or skipped) by [`TileGrid::validate_tile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileKey {
    pub x: i64,
    pub y: i64,
}

impl FromStr for TileKey {
    type Err = CanvasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CanvasError::MalformedTileKey(s.to_string());
        let (x, y) = s.split_once(',').ok_or_else(malformed)?;
        let x = x.trim().parse::<i64>().map_err(|_| malformed())?;
        let y = y.trim().parse::<i64>().map_err(|_| malformed())?;
        Ok(Self { x, y })
    }
}

/// Half-open pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileRect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersection with another rectangle, `None` when disjoint.
    pub fn intersect(&self, other: &TileRect) -> Option<TileRect> {
        let rect = TileRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        (!rect.is_empty()).then_some(rect)
    }
}

/// Deterministic tile partition of one canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    config: CanvasConfig,
}

impl TileGrid {
    pub fn new(config: CanvasConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CanvasConfig {
        &self.config
    }

    /// Tile containing pixel `(x, y)`.
    pub fn tile_of(&self, x: u32, y: u32) -> TileCoord {
        let s = self.config.tile_size();
        TileCoord::new(x / s, y / s)
    }

    /// Pixel rectangle covered by `tile`, clipped to the canvas.
    pub fn bounds_of(&self, tile: TileCoord) -> TileRect {
        let s = self.config.tile_size() as u64;
        let clip = |start: u64, limit: u32| start.min(limit as u64) as u32;
        let x0 = tile.x as u64 * s;
        let y0 = tile.y as u64 * s;
        TileRect {
            x0: clip(x0, self.config.width()),
            y0: clip(y0, self.config.height()),
            x1: clip(x0 + s, self.config.width()),
            y1: clip(y0 + s, self.config.height()),
        }
    }

    pub fn max_tile_x(&self) -> u32 {
        (self.config.width() - 1) / self.config.tile_size()
    }

    pub fn max_tile_y(&self) -> u32 {
        (self.config.height() - 1) / self.config.tile_size()
    }

    /// Number of tiles in the partition.
    pub fn tile_count(&self) -> u64 {
        (self.max_tile_x() as u64 + 1) * (self.max_tile_y() as u64 + 1)
    }

    pub fn is_valid_tile(&self, tile_x: i64, tile_y: i64) -> bool {
        tile_x >= 0
            && tile_y >= 0
            && tile_x <= self.max_tile_x() as i64
            && tile_y <= self.max_tile_y() as i64
    }

    /// Validate a client-supplied tile coordinate.
    pub fn validate_tile(&self, tile_x: i64, tile_y: i64) -> Result<TileCoord, CanvasError> {
        if !self.is_valid_tile(tile_x, tile_y) {
            return Err(CanvasError::InvalidTile {
                tile_x,
                tile_y,
                max_tile_x: self.max_tile_x(),
                max_tile_y: self.max_tile_y(),
            });
        }
        Ok(TileCoord::new(tile_x as u32, tile_y as u32))
    }

    /// Parse and validate a `"tx,ty"` key.
    pub fn tile_from_key(&self, key: &str) -> Result<TileCoord, CanvasError> {
        let raw: TileKey = key.parse()?;
        self.validate_tile(raw.x, raw.y)
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.config.width() as i64 && y < self.config.height() as i64
    }

    /// Validate a client-supplied pixel coordinate.
    pub fn validate_coordinate(&self, x: i64, y: i64) -> Result<(u32, u32), CanvasError> {
        if !self.contains(x, y) {
            return Err(CanvasError::CoordinateOutOfBounds {
                x,
                y,
                max_x: self.config.width() - 1,
                max_y: self.config.height() - 1,
            });
        }
        Ok((x as u32, y as u32))
    }

    /// Whole canvas as a rectangle.
    pub fn canvas_rect(&self) -> TileRect {
        TileRect {
            x0: 0,
            y0: 0,
            x1: self.config.width(),
            y1: self.config.height(),
        }
    }

    /// All tiles in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> {
        let max_x = self.max_tile_x();
        let max_y = self.max_tile_y();
        (0..=max_y).flat_map(move |y| (0..=max_x).map(move |x| TileCoord::new(x, y)))
    }
}
