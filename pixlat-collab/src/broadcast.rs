//! Fan-out of committed pixels to every connection.
//!
//! Uses a tokio broadcast channel: one encode per event, O(1) send to all
//! subscribers. Each connection gets an independent receiver buffering up to
//! `capacity` frames; a connection that falls further behind skips frames
//! and recovers them through its next delta sync.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use pixlat_core::WriterId;

use crate::protocol::{PixelEvent, ProtocolError, ServerMessage};

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub addr: SocketAddr,
    pub writer: WriterId,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            addr,
            writer: WriterId::from_ip(addr.ip()),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub frames_skipped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    frames_skipped: AtomicU64,
}

/// Broadcast group for one canvas.
pub struct PixelBroadcast {
    /// Pre-encoded text frames
    sender: broadcast::Sender<Arc<String>>,

    /// Connected peers
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,

    /// Frames buffered per receiver
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl PixelBroadcast {
    /// Create a group buffering up to `capacity` frames per peer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<String>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every receiver.
    ///
    /// Returns the number of receivers reached (0 when nobody listens).
    pub fn publish(&self, event: PixelEvent) -> Result<usize, ProtocolError> {
        let frame = Arc::new(ServerMessage::Pixel(event).encode()?);
        Ok(self.publish_raw(frame))
    }

    /// Send an already encoded frame.
    pub fn publish_raw(&self, frame: Arc<String>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Pixel event fanned out to {count} receivers");
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_skipped(&self, n: u64) {
        self.atomic_stats.frames_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            frames_skipped: self.atomic_stats.frames_skipped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver, not registered as a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<String>> {
        self.sender.subscribe()
    }
}
