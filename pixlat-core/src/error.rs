//! Validation errors shared by every Pixlat crate.

/// Errors raised while validating canvas input.
///
/// All variants are permanent for the request that produced them: the
/// caller must correct its input before trying again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasError {
    /// Canvas dimensions or tile size are unusable
    InvalidConfig(String),
    /// Pixel coordinate outside `[0, W) × [0, H)`
    CoordinateOutOfBounds { x: i64, y: i64, max_x: u32, max_y: u32 },
    /// A color channel outside `[0, 255]`
    InvalidColor { r: i64, g: i64, b: i64 },
    /// Tile coordinate negative or beyond the last tile
    InvalidTile { tile_x: i64, tile_y: i64, max_tile_x: u32, max_tile_y: u32 },
    /// Tile key not of the form `"tx,ty"`
    MalformedTileKey(String),
    /// Checksum text is not a 128-bit hex digest
    MalformedChecksum(String),
}

impl std::fmt::Display for CanvasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanvasError::InvalidConfig(e) => write!(f, "Invalid canvas configuration: {e}"),
            CanvasError::CoordinateOutOfBounds { x, y, max_x, max_y } => write!(
                f,
                "Coordinates ({x}, {y}) out of bounds (0-{max_x}, 0-{max_y})"
            ),
            CanvasError::InvalidColor { r, g, b } => write!(
                f,
                "Color values must be between 0-255 (got {r}, {g}, {b})"
            ),
            CanvasError::InvalidTile { tile_x, tile_y, max_tile_x, max_tile_y } => write!(
                f,
                "Invalid tile coordinates: ({tile_x}, {tile_y}). Valid range: (0-{max_tile_x}, 0-{max_tile_y})"
            ),
            CanvasError::MalformedTileKey(key) => write!(f, "Malformed tile key: {key:?}"),
            CanvasError::MalformedChecksum(text) => write!(f, "Malformed checksum: {text:?}"),
        }
    }
}

impl std::error::Error for CanvasError {}
