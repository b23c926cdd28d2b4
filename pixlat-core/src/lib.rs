//! # pixlat-core — Canvas geometry and tile digests
//!
//! Pure building blocks shared by the server and its clients:
//!
//! - [`config`] — canvas bounds and tile size, fixed at deployment
//! - [`tile`] — tile indexer (floor-division partition, clipped bounds)
//! - [`pixel`] — pixel, color and writer identity types
//! - [`checksum`] — 128-bit tile content digest over the canonical `(y, x)` scan
//! - [`clock`] — injectable wall clock
//!
//! Nothing in this crate performs I/O.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod pixel;
pub mod tile;

pub use checksum::{TileChecksum, CHECKSUM_LEN};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CanvasConfig;
pub use error::CanvasError;
pub use pixel::{Color, Pixel, PixelRecord, WriterId};
pub use tile::{TileCoord, TileGrid, TileKey, TileRect};
