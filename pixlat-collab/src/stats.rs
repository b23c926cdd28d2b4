//! Contributor statistics and short-lived presence.
//!
//! Counts are of live pixels: a coordinate counts once, for the writer whose
//! placement it currently shows. The store maintains them inside the write
//! transaction, so they never disagree with the committed pixels.
//! Presence is in-memory only: a last-seen table pruned by TTL.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use pixlat_core::WriterId;

use crate::storage::{PixelStore, StoreError};

/// Default time a caller counts as active after its last request.
pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 30;

/// Read access to live pixel counts.
pub trait ContributorStats {
    /// Pixels on the canvas currently showing this writer's placement.
    fn total_pixels_by(&self, writer: &WriterId) -> Result<u64, StoreError>;

    /// Painted pixels on the whole canvas.
    fn total_pixels_on_canvas(&self) -> Result<u64, StoreError>;
}

impl ContributorStats for PixelStore {
    fn total_pixels_by(&self, writer: &WriterId) -> Result<u64, StoreError> {
        self.live_pixels_by(writer)
    }

    fn total_pixels_on_canvas(&self) -> Result<u64, StoreError> {
        self.live_pixels()
    }
}

/// A writer's share of the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementStats {
    pub user_pixels: u64,
    pub total_pixels: u64,
    /// `user / total * 100`, rounded to two decimals
    pub percentage: f64,
}

impl PlacementStats {
    pub fn compute(user_pixels: u64, total_pixels: u64) -> Self {
        let percentage = if total_pixels == 0 {
            0.0
        } else {
            round2(user_pixels as f64 / total_pixels as f64 * 100.0)
        };
        Self {
            user_pixels,
            total_pixels,
            percentage,
        }
    }

    /// Read both counters from `source` and compute the share.
    pub fn for_writer(
        source: &impl ContributorStats,
        writer: &WriterId,
    ) -> Result<Self, StoreError> {
        Ok(Self::compute(
            source.total_pixels_by(writer)?,
            source.total_pixels_on_canvas()?,
        ))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Most prolific writer, with its identity masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopContributor {
    pub partial_ip: String,
    pub pixels: u64,
    pub country: String,
}

impl TopContributor {
    /// Look up the writer owning the most pixels.
    pub fn lookup(store: &PixelStore) -> Result<Option<Self>, StoreError> {
        Ok(store.top_writer()?.map(|(writer, pixels)| Self {
            partial_ip: writer.masked(),
            pixels,
            country: writer.origin_label().to_string(),
        }))
    }
}

/// Body of a stats reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub user_stats: PlacementStats,
    pub active_users: usize,
    pub top_contributor: Option<TopContributor>,
}

impl StatsReport {
    /// Record `writer` as present and gather every statistic for it.
    ///
    /// The store scans run on the blocking pool.
    pub async fn collect(
        store: Arc<PixelStore>,
        presence: &ActivePresence,
        writer: &WriterId,
        now: u64,
    ) -> Result<Self, StoreError> {
        presence.touch(writer.clone(), now).await;
        let active_users = presence.active_count(now).await;

        let writer = writer.clone();
        let (user_stats, top_contributor) = tokio::task::spawn_blocking(move || {
            Ok::<_, StoreError>((
                PlacementStats::for_writer(store.as_ref(), &writer)?,
                TopContributor::lookup(&store)?,
            ))
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("stats task failed: {e}")))??;

        Ok(Self {
            user_stats,
            active_users,
            top_contributor,
        })
    }
}

/// In-memory last-seen table.
///
/// An entry older than the TTL no longer counts and is dropped on the next
/// count.
pub struct ActivePresence {
    last_seen: RwLock<HashMap<WriterId, u64>>,
    ttl_secs: u64,
}

impl ActivePresence {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            ttl_secs,
        }
    }

    /// Mark `writer` as seen at `now`.
    pub async fn touch(&self, writer: WriterId, now: u64) {
        let mut seen = self.last_seen.write().await;
        let entry = seen.entry(writer).or_insert(now);
        *entry = (*entry).max(now);
    }

    /// Number of writers seen within the TTL, pruning stale entries.
    pub async fn active_count(&self, now: u64) -> usize {
        let mut seen = self.last_seen.write().await;
        let ttl = self.ttl_secs;
        seen.retain(|_, last| now.saturating_sub(*last) < ttl);
        seen.len()
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }
}

impl Default for ActivePresence {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL_SECS)
    }
}
