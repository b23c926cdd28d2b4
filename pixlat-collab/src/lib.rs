//! # pixlat-collab — Shared canvas server, storage and client
//!
//! Serves one tile-partitioned pixel canvas to many WebSocket clients.
//! Writes are admitted against a per-writer rate limit and an optional tile
//! checksum precondition; reads are full, per-tile or delta since a
//! timestamp.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient │ ◄─────────────────► │ CanvasServer │
//! │ (per user)   │   JSON + binary    │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ CanvasMirror │                     │ PixelStore   │
//! │ (local)      │                     │ (authority)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ PixelBroadcast│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — RocksDB pixel store with transactional upserts
//! - [`sync`] — state query resolution: full, tile, delta, checksum verify
//! - [`admission`] — validation, rate limit and checksum precondition
//! - [`export`] — region export as JSON, dense grid, CSV or binary
//! - [`stats`] — contributor counts and active presence
//! - [`protocol`] — request/reply envelope and pushed pixel events
//! - [`broadcast`] — fan-out of committed pixels
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client keeping a [`mirror`]

pub mod admission;
pub mod broadcast;
pub mod client;
pub mod export;
pub mod mirror;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use admission::{
    AdmissionConfig, Admitted, Placement, PlacementRequest, Rejection, RejectionBody,
    WriteAdmission,
};
pub use broadcast::{BroadcastStats, PeerInfo, PixelBroadcast};
pub use client::{CanvasClient, ClientEvent, ConnectionState, PlaceOutcome, Reply};
pub use export::{Export, ExportError, ExportFormat, ExportQuery, ExportService, Region};
pub use mirror::CanvasMirror;
pub use protocol::{Endpoint, Method, PixelEvent, ProtocolError, Request, ServerMessage};
pub use server::{CanvasServer, ServerConfig, ServerError, ServerStats};
pub use stats::{ActivePresence, ContributorStats, PlacementStats, StatsReport, TopContributor};
pub use storage::{
    AppliedWrite, PixelStore, PixelWrite, StoreConfig, StoreError, UpsertOutcome, WriterRecord,
};
pub use sync::{
    BoardInfo, ChecksumBody, StateQuery, StateRequest, StateResponse, SyncError, SyncService,
    TilePayload,
};
