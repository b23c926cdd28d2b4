//! Durable pixel storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   reads    ┌──────────────────────────────────────┐
//! │ SyncService  │ ─────────► │ PixelStore (RocksDB TransactionDB)   │
//! └──────────────┘            │                                      │
//! ┌──────────────┐   upsert   │ CF "pixels"   — (y, x) → color, ts   │
//! │WriteAdmission│ ─────────► │ CF "tiles"    — (ty, tx) → ts, live  │
//! └──────────────┘  (one txn) │ CF "writers"  — writer → last placed │
//!                             │ CF "counters" — (writer, tile) → live│
//!                             └──────────────────────────────────────┘
//! ```
//!
//! The store is the single source of truth and the only synchronization
//! point between request handlers; nothing is cached in process.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{
    AppliedWrite, PixelStore, PixelWrite, StoreConfig, StoreError, UpsertOutcome, WriterRecord,
};
