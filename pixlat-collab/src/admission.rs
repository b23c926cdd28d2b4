//! Write admission path.
//!
//! ```text
//! PlacementRequest
//!       │ 1. bounds + channel validation       → InvalidInput
//!       ▼
//! optional checksum precondition              → ChecksumMismatch
//!       │ 2. recompute target tile digest
//!       ▼
//! ┌───────────────── one transaction ─────────────────┐
//! │ 3. writer row: minimum interval     → RateLimited │
//! │ 4. pixel upsert + tile row + ownership counts     │
//! │ 5. tile digest + live counts as committed         │
//! └───────────────────────────────────────────────────┘
//!       ▼
//! Admitted
//! ```
//!
//! Nothing is read after the commit, so a write that committed is always
//! reported and broadcast.
//!
//! The checksum precondition is read before the transaction opens, so two
//! writers holding the same stale digest can both pass it. The check detects
//! staleness; it is not a compare-and-swap over the tile.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use pixlat_core::{CanvasError, Clock, Color, Pixel, PixelRecord, TileChecksum, TileGrid, WriterId};

use crate::stats::PlacementStats;
use crate::storage::{PixelStore, PixelWrite, StoreError, UpsertOutcome};

/// Admission settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Minimum seconds between two placements by one writer (0 disables)
    pub rate_limit_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { rate_limit_secs: 5 }
    }
}

impl AdmissionConfig {
    /// No rate limit.
    pub fn unlimited() -> Self {
        Self { rate_limit_secs: 0 }
    }
}

/// Untrusted placement as sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub x: i64,
    pub y: i64,
    pub r: i64,
    pub g: i64,
    pub b: i64,
    /// Tile checksum the client last observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl PlacementRequest {
    pub fn new(pixel: Pixel) -> Self {
        Self {
            x: pixel.x as i64,
            y: pixel.y as i64,
            r: pixel.r as i64,
            g: pixel.g as i64,
            b: pixel.b as i64,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: TileChecksum) -> Self {
        self.checksum = Some(checksum.to_hex());
        self
    }

    /// Validate bounds and channels without touching the store.
    pub fn validate(&self, grid: &TileGrid) -> Result<Pixel, CanvasError> {
        let (x, y) = grid.validate_coordinate(self.x, self.y)?;
        let color = Color::from_channels(self.r, self.g, self.b)?;
        Ok(Pixel::new(x, y, color))
    }
}

/// Body of an accepted placement reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub success: bool,
    pub x: u32,
    pub y: u32,
    pub stats: PlacementStats,
    /// Tile checksum after the write
    pub checksum: TileChecksum,
    pub timestamp: u64,
}

/// An accepted placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub placement: Placement,
    /// Row as committed
    pub record: PixelRecord,
    /// First write to this coordinate
    pub created: bool,
}

/// Reasons a placement was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Malformed or out-of-range input; permanent for this request
    InvalidInput(String),
    /// Tile changed since the client read it; retry after refreshing
    ChecksumMismatch { current: TileChecksum },
    /// Writer placed too recently; retry after the interval
    RateLimited { retry_after_secs: u64 },
    /// Store could not be reached or the transaction lost a lock race
    StorageUnavailable(String),
    /// Stored data failed an integrity check
    StorageInvariantViolation(String),
}

/// JSON body of a rejected placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<TileChecksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Rejection {
    /// HTTP-equivalent status; a checksum mismatch is a normal reply.
    pub fn status(&self) -> u16 {
        match self {
            Rejection::InvalidInput(_) => 400,
            Rejection::ChecksumMismatch { .. } => 200,
            Rejection::RateLimited { .. } => 429,
            Rejection::StorageUnavailable(_) | Rejection::StorageInvariantViolation(_) => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidInput(_) => "invalid_input",
            Rejection::ChecksumMismatch { .. } => "checksum_mismatch",
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::StorageUnavailable(_) => "storage_unavailable",
            Rejection::StorageInvariantViolation(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Rejection::InvalidInput(_))
    }

    /// Reply body; storage detail is replaced by a generic message.
    pub fn to_body(&self) -> RejectionBody {
        let message = match self {
            Rejection::InvalidInput(e) => e.clone(),
            Rejection::ChecksumMismatch { .. } => {
                "The tile has been modified since you last fetched it. Please refresh.".into()
            }
            Rejection::RateLimited { retry_after_secs } => {
                format!("Rate limit exceeded. Try again in {retry_after_secs} seconds.")
            }
            Rejection::StorageUnavailable(_) => "Storage temporarily unavailable".into(),
            Rejection::StorageInvariantViolation(_) => "Internal storage error".into(),
        };
        RejectionBody {
            success: false,
            error: self.code().to_string(),
            message,
            checksum: match self {
                Rejection::ChecksumMismatch { current } => Some(*current),
                _ => None,
            },
            retry_after: match self {
                Rejection::RateLimited { retry_after_secs } => Some(*retry_after_secs),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InvalidInput(e) => write!(f, "Invalid input: {e}"),
            Rejection::ChecksumMismatch { current } => {
                write!(f, "Checksum mismatch (current {current})")
            }
            Rejection::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited for {retry_after_secs}s")
            }
            Rejection::StorageUnavailable(e) => write!(f, "Storage unavailable: {e}"),
            Rejection::StorageInvariantViolation(e) => write!(f, "Storage invariant violated: {e}"),
        }
    }
}

impl std::error::Error for Rejection {}

impl From<CanvasError> for Rejection {
    fn from(e: CanvasError) -> Self {
        Rejection::InvalidInput(e.to_string())
    }
}

impl From<StoreError> for Rejection {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotProvisioned(_) | StoreError::Unavailable(_) | StoreError::Conflict(_) => {
                Rejection::StorageUnavailable(e.to_string())
            }
            StoreError::InvariantViolation(_)
            | StoreError::Serialization(_)
            | StoreError::Deserialization(_) => Rejection::StorageInvariantViolation(e.to_string()),
        }
    }
}

/// Admits or rejects pixel placements against the shared store.
pub struct WriteAdmission {
    store: Arc<PixelStore>,
    grid: TileGrid,
    clock: Arc<dyn Clock>,
    config: AdmissionConfig,
}

impl WriteAdmission {
    pub fn new(
        store: Arc<PixelStore>,
        grid: TileGrid,
        clock: Arc<dyn Clock>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            grid,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Validate, check the precondition, and commit one placement.
    pub fn place(&self, request: &PlacementRequest, writer: &WriterId) -> Result<Admitted, Rejection> {
        let pixel = request.validate(&self.grid)?;
        self.admit(pixel, request.checksum.as_deref(), writer)
            .inspect_err(|rejection| log_storage_failure(rejection, writer))
    }

    fn admit(
        &self,
        pixel: Pixel,
        expected: Option<&str>,
        writer: &WriterId,
    ) -> Result<Admitted, Rejection> {
        let tile = self.grid.tile_of(pixel.x, pixel.y);

        if let Some(expected) = expected {
            let current = self.store.tile_checksum(&self.grid, tile)?;
            if !current.matches(expected) {
                log::debug!("Checksum mismatch from {writer} on tile {tile}");
                return Err(Rejection::ChecksumMismatch { current });
            }
        }

        let write = PixelWrite {
            pixel,
            writer: writer.clone(),
            timestamp: self.clock.now(),
        };
        let applied = match self.store.upsert(&self.grid, &write, self.config.rate_limit_secs)? {
            UpsertOutcome::Applied(applied) => applied,
            UpsertOutcome::Throttled { retry_after_secs, .. } => {
                log::debug!("Rate limited {writer} for {retry_after_secs}s");
                return Err(Rejection::RateLimited { retry_after_secs });
            }
        };

        log::debug!(
            "Placed ({}, {}) by {writer}, tile {tile} now {}",
            pixel.x,
            pixel.y,
            applied.checksum
        );

        Ok(Admitted {
            placement: Placement {
                success: true,
                x: pixel.x,
                y: pixel.y,
                stats: PlacementStats::compute(applied.writer_pixels, applied.total_pixels),
                checksum: applied.checksum,
                timestamp: write.timestamp,
            },
            record: applied.record,
            created: applied.created,
        })
    }
}

fn log_storage_failure(rejection: &Rejection, writer: &WriterId) {
    match rejection {
        Rejection::StorageUnavailable(detail) => {
            log::warn!("Placement by {writer} failed on storage: {detail}")
        }
        Rejection::StorageInvariantViolation(detail) => {
            log::error!("Placement by {writer} hit corrupt storage: {detail}")
        }
        _ => {}
    }
}
