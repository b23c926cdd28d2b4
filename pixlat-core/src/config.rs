//! Canvas geometry fixed at deployment time.
//!
//! Every coordinate and tile computation derives from the three values held
//! here. The configuration is an immutable value handed to each component
//! constructor, so independent canvases can coexist in one process.

use serde::{Deserialize, Serialize};

use crate::error::CanvasError;

/// Canvas bounds and tile size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasConfig {
    /// Canvas width in pixels
    width: u32,
    /// Canvas height in pixels
    height: u32,
    /// Edge length of a square tile in pixels
    tile_size: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 1000,
            tile_size: 32,
        }
    }
}

impl CanvasConfig {
    /// Create a validated configuration.
    ///
    /// All three values must be non-zero.
    pub fn new(width: u32, height: u32, tile_size: u32) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidConfig(format!(
                "canvas must be at least 1x1, got {width}x{height}"
            )));
        }
        if tile_size == 0 {
            return Err(CanvasError::InvalidConfig("tile size must be non-zero".into()));
        }
        Ok(Self { width, height, tile_size })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Total number of addressable pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}
