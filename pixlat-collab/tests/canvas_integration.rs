//! Store, admission and sync working together on a real RocksDB store.
//!
//! Verifies:
//! - Tile checksums follow the canonical `(y, x)` scan
//! - Per-writer rate limiting with an injected clock
//! - Checksum preconditions reject stale writers and report the new digest
//! - Delta queries: strict-greater `since`, full-tile replacement
//! - Identical writes and single-tile isolation
//! - Persistence across reopen

use std::collections::BTreeMap;
use std::sync::Arc;

use pixlat_collab::admission::{AdmissionConfig, PlacementRequest, Rejection, WriteAdmission};
use pixlat_collab::export::{Export, ExportFormat, ExportQuery, ExportService};
use pixlat_collab::stats::{ContributorStats, PlacementStats};
use pixlat_collab::storage::{PixelStore, StoreConfig};
use pixlat_collab::sync::{ChecksumBody, StateQuery, SyncService};
use pixlat_core::{CanvasConfig, Clock, Color, ManualClock, Pixel, TileChecksum, TileCoord, TileGrid, WriterId};
use tempfile::TempDir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Canvas {
    _dir: TempDir,
    store: Arc<PixelStore>,
    grid: TileGrid,
    clock: Arc<ManualClock>,
    admission: WriteAdmission,
    sync: SyncService,
}

fn canvas(width: u32, height: u32, tile: u32, rate_limit_secs: u64) -> Canvas {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("canvas"));
    PixelStore::provision(&config).unwrap();
    let store = Arc::new(PixelStore::open(config).unwrap());
    let grid = TileGrid::new(CanvasConfig::new(width, height, tile).unwrap());
    let clock = Arc::new(ManualClock::new(0));
    let admission = WriteAdmission::new(
        store.clone(),
        grid,
        clock.clone(),
        AdmissionConfig { rate_limit_secs },
    );
    let sync = SyncService::new(store.clone(), grid, clock.clone());
    Canvas {
        _dir: dir,
        store,
        grid,
        clock,
        admission,
        sync,
    }
}

fn place(x: i64, y: i64, r: i64, g: i64, b: i64) -> PlacementRequest {
    PlacementRequest {
        x,
        y,
        r,
        g,
        b,
        checksum: None,
    }
}

fn px(x: u32, y: u32, r: u8, g: u8, b: u8) -> Pixel {
    Pixel::new(x, y, Color::new(r, g, b))
}

// ─── Checksums ───────────────────────────────────────────────────────────────

#[test]
fn test_tile_checksum_scenario() {
    let c = canvas(4, 4, 2, 0);
    let alice = WriterId::new("10.0.0.1");

    c.admission.place(&place(0, 0, 255, 0, 0), &alice).unwrap();
    let tile = c.sync.tile(0, 0).unwrap();
    assert_eq!(tile.pixels.unwrap(), vec![px(0, 0, 255, 0, 0)]);
    assert_eq!(tile.checksum.unwrap(), TileChecksum::of_canonical("0,0,255,0,0;"));

    let admitted = c.admission.place(&place(1, 1, 0, 255, 0), &alice).unwrap();
    let expected = TileChecksum::of_canonical("0,0,255,0,0;1,1,0,255,0;");
    assert_eq!(admitted.placement.checksum, expected);
    assert_eq!(c.sync.tile(0, 0).unwrap().checksum.unwrap(), expected);
}

#[test]
fn test_checksum_ignores_write_order() {
    let a = canvas(4, 4, 2, 0);
    let b = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");

    for (x, y) in [(1, 1), (0, 1), (1, 0)] {
        a.admission.place(&place(x, y, 9, 9, 9), &w).unwrap();
    }
    for (x, y) in [(1, 0), (1, 1), (0, 1)] {
        b.admission.place(&place(x, y, 9, 9, 9), &w).unwrap();
    }
    let tile = TileCoord::new(0, 0);
    assert_eq!(
        a.store.tile_checksum(&a.grid, tile).unwrap(),
        b.store.tile_checksum(&b.grid, tile).unwrap()
    );
}

#[test]
fn test_write_changes_only_its_tile() {
    let c = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");
    c.admission.place(&place(0, 0, 1, 1, 1), &w).unwrap();
    c.admission.place(&place(3, 3, 1, 1, 1), &w).unwrap();

    let before: Vec<TileChecksum> = c
        .grid
        .tiles()
        .map(|t| c.store.tile_checksum(&c.grid, t).unwrap())
        .collect();
    c.admission.place(&place(3, 2, 200, 0, 0), &w).unwrap();
    let after: Vec<TileChecksum> = c
        .grid
        .tiles()
        .map(|t| c.store.tile_checksum(&c.grid, t).unwrap())
        .collect();

    let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
    // Row-major order: tile (1,1) is the fourth
    assert_eq!(changed, vec![3]);
}

#[test]
fn test_identical_write_is_idempotent_for_content() {
    let c = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");
    let first = c.admission.place(&place(2, 1, 5, 6, 7), &w).unwrap();
    assert!(first.created);

    c.clock.set(10);
    let second = c.admission.place(&place(2, 1, 5, 6, 7), &w).unwrap();
    assert!(!second.created);
    assert_eq!(first.placement.checksum, second.placement.checksum);
    assert_eq!(c.store.all_pixels().unwrap(), vec![px(2, 1, 5, 6, 7)]);
    assert_eq!(c.store.get_pixel(2, 1).unwrap().unwrap().updated_at, 10);
}

// ─── Admission ───────────────────────────────────────────────────────────────

#[test]
fn test_rate_limit_scenario() {
    let c = canvas(8, 8, 4, 5);
    let w = WriterId::new("10.0.0.9");

    c.clock.set(0);
    assert!(c.admission.place(&place(0, 0, 1, 0, 0), &w).is_ok());

    c.clock.set(2);
    match c.admission.place(&place(1, 0, 1, 0, 0), &w) {
        Err(Rejection::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 3),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(c.store.get_pixel(1, 0).unwrap().is_none());

    c.clock.set(6);
    assert!(c.admission.place(&place(2, 0, 1, 0, 0), &w).is_ok());
    assert_eq!(c.store.live_pixels().unwrap(), 2);
}

#[test]
fn test_rate_limit_is_per_writer() {
    let c = canvas(8, 8, 4, 5);
    c.admission.place(&place(0, 0, 1, 0, 0), &WriterId::new("a")).unwrap();
    c.admission.place(&place(1, 0, 1, 0, 0), &WriterId::new("b")).unwrap();
    assert!(c.admission.place(&place(2, 0, 1, 0, 0), &WriterId::new("a")).is_err());
}

#[test]
fn test_checksum_mismatch_scenario() {
    let c = canvas(4, 4, 2, 0);
    let alice = WriterId::new("alice");
    let bob = WriterId::new("bob");
    c.admission.place(&place(0, 0, 1, 1, 1), &alice).unwrap();

    let c0 = c.sync.tile(0, 0).unwrap().checksum.unwrap();
    let c1 = c.admission.place(&place(1, 0, 2, 2, 2), &bob).unwrap().placement.checksum;
    assert_ne!(c0, c1);

    let stale = place(1, 1, 3, 3, 3).with_checksum(c0);
    match c.admission.place(&stale, &alice) {
        Err(Rejection::ChecksumMismatch { current }) => assert_eq!(current, c1),
        other => panic!("expected mismatch, got {other:?}"),
    }
    assert!(c.store.get_pixel(1, 1).unwrap().is_none());

    let fresh = place(1, 1, 3, 3, 3).with_checksum(c1);
    assert!(c.admission.place(&fresh, &alice).is_ok());
}

#[test]
fn test_validation_precedes_storage() {
    let c = canvas(4, 4, 2, 5);
    let w = WriterId::new("w");
    for bad in [place(4, 0, 0, 0, 0), place(0, -1, 0, 0, 0), place(0, 0, 256, 0, 0)] {
        assert!(matches!(
            c.admission.place(&bad, &w),
            Err(Rejection::InvalidInput(_))
        ));
    }
    // Rejected requests do not start the rate-limit window
    assert!(c.admission.place(&place(0, 0, 0, 0, 0), &w).is_ok());
    assert_eq!(c.store.live_pixels().unwrap(), 1);
}

#[test]
fn test_stats_count_pixels_on_canvas() {
    let c = canvas(4, 4, 2, 0);
    let a = WriterId::new("a");
    let b = WriterId::new("b");

    c.admission.place(&place(0, 0, 1, 1, 1), &a).unwrap();
    c.clock.set(1);
    c.admission.place(&place(0, 0, 2, 2, 2), &a).unwrap();
    c.clock.set(2);
    let stats = c.admission.place(&place(0, 0, 3, 3, 3), &b).unwrap().placement.stats;

    assert_eq!(stats, PlacementStats::compute(1, 1));
    assert_eq!(stats.percentage, 100.0);
    assert_eq!(PlacementStats::for_writer(c.store.as_ref(), &a).unwrap().user_pixels, 0);
    assert_eq!(c.store.total_pixels_on_canvas().unwrap(), 1);
}

#[test]
fn test_placement_reports_committed_checksum() {
    let c = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");
    c.admission.place(&place(3, 3, 9, 9, 9), &w).unwrap();
    let placed = c.admission.place(&place(2, 3, 1, 2, 3), &w).unwrap();

    let tile = c.grid.tile_of(2, 3);
    assert_eq!(placed.placement.checksum, c.store.tile_checksum(&c.grid, tile).unwrap());
    assert_eq!(
        placed.placement.checksum,
        TileChecksum::of_sorted(&[px(2, 3, 1, 2, 3), px(3, 3, 9, 9, 9)])
    );
}

// ─── Sync ────────────────────────────────────────────────────────────────────

#[test]
fn test_delta_since_is_strictly_greater() {
    let c = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");
    c.clock.set(100);
    c.admission.place(&place(0, 0, 1, 0, 0), &w).unwrap();
    c.clock.set(105);
    c.admission.place(&place(3, 3, 2, 0, 0), &w).unwrap();
    c.clock.set(110);

    let delta = c.sync.delta_since(100, &BTreeMap::new()).unwrap();
    assert_eq!(delta.pixels.unwrap(), vec![px(3, 3, 2, 0, 0)]);
    assert_eq!(delta.timestamp, 110);

    let delta = c.sync.delta_since(99, &BTreeMap::new()).unwrap();
    assert_eq!(delta.pixels.unwrap().len(), 2);

    let delta = c.sync.delta_since(110, &BTreeMap::new()).unwrap();
    assert!(delta.pixels.unwrap().is_empty());
}

#[test]
fn test_delta_sends_stale_tiles_in_full() {
    let c = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");
    c.clock.set(10);
    c.admission.place(&place(0, 0, 1, 0, 0), &w).unwrap();
    c.admission.place(&place(2, 0, 1, 0, 0), &w).unwrap();
    let synced_at = c.clock.now();

    c.clock.set(20);
    c.admission.place(&place(1, 1, 7, 0, 0), &w).unwrap();
    c.admission.place(&place(3, 3, 7, 0, 0), &w).unwrap();

    // Client holds only (0,0) in tile 0,0 and an out-of-date digest for 1,0
    let mut checksums = BTreeMap::new();
    checksums.insert("0,0".to_string(), TileChecksum::of_canonical("0,0,1,0,0;").to_hex());
    checksums.insert("1,0".to_string(), TileChecksum::empty().to_hex());
    checksums.insert("9,9".to_string(), "ignored".to_string());

    let delta = c.sync.delta_since(synced_at, &checksums).unwrap();
    let changed = delta.changed_tiles.unwrap();

    // 0,0 holds a delta pixel, 1,0 mismatches: both sent whole
    assert_eq!(changed.len(), 2);
    assert_eq!(changed["0,0"].pixels, vec![px(0, 0, 1, 0, 0), px(1, 1, 7, 0, 0)]);
    assert_eq!(changed["1,0"].pixels, vec![px(2, 0, 1, 0, 0)]);

    // Partial pixels only for tiles not sent in full
    assert_eq!(delta.pixels.unwrap(), vec![px(3, 3, 7, 0, 0)]);
    assert_eq!(delta.tile_checksums.unwrap().len(), 2);
}

#[test]
fn test_state_request_precedence() {
    let c = canvas(4, 4, 2, 0);
    let w = WriterId::new("w");
    c.admission.place(&place(0, 0, 1, 2, 3), &w).unwrap();

    let mut checksums = BTreeMap::new();
    checksums.insert("0,0".to_string(), TileChecksum::empty().to_hex());
    checksums.insert("1,1".to_string(), TileChecksum::empty().to_hex());

    // verify_checksums wins over everything else
    let query = StateQuery {
        verify_checksums: true,
        info: true,
        since: Some(0),
        ..StateQuery::default()
    };
    let body = ChecksumBody {
        checksums: Some(checksums),
    };
    let response = c.sync.handle(query, body).unwrap();
    let outdated = response.outdated_tiles.unwrap();
    assert_eq!(outdated.len(), 1);
    assert!(outdated["0,0"]);
    assert!(response.pixels.is_none());

    // half a tile pair is invalid
    let query = StateQuery {
        tile_x: Some(0),
        ..StateQuery::default()
    };
    let err = c.sync.handle(query, ChecksumBody::default()).unwrap_err();
    assert_eq!(err.status(), 400);

    // out-of-range tile
    assert_eq!(c.sync.tile(2, 0).unwrap_err().status(), 400);

    // no parameters: full canvas
    let full = c.sync.handle(StateQuery::default(), ChecksumBody::default()).unwrap();
    assert_eq!(full.pixels.unwrap(), vec![px(0, 0, 1, 2, 3)]);
}

#[test]
fn test_board_info_matches_grid() {
    let c = canvas(10, 7, 4, 0);
    let info = c.sync.board_info().info.unwrap();
    assert_eq!((info.min_x, info.max_x, info.min_y, info.max_y), (0, 9, 0, 6));
    assert_eq!((info.tile_width, info.tile_height), (4, 4));
    assert_eq!((info.max_tile_x, info.max_tile_y), (2, 1));
}

// ─── Export and persistence ──────────────────────────────────────────────────

#[test]
fn test_export_region_csv() {
    let c = canvas(8, 8, 4, 0);
    let w = WriterId::new("w");
    c.admission.place(&place(1, 1, 1, 2, 3), &w).unwrap();
    c.admission.place(&place(6, 6, 4, 5, 6), &w).unwrap();

    let exporter = ExportService::new(c.store.clone(), c.grid, c.clock.clone());
    let query = ExportQuery {
        format: ExportFormat::Csv,
        region_x: Some(0),
        region_y: Some(0),
        region_width: Some(4),
        region_height: Some(4),
    };
    match exporter.export(&query).unwrap() {
        Export::Csv(data) => {
            let lines: Vec<&str> = data.lines().collect();
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[1], "1,1,1,2,3");
        }
        other => panic!("expected csv, got {other:?}"),
    }
}

#[test]
fn test_pixels_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("canvas"));
    PixelStore::provision(&config).unwrap();
    let grid = TileGrid::new(CanvasConfig::new(4, 4, 2).unwrap());
    let checksum = {
        let store = Arc::new(PixelStore::open(config.clone()).unwrap());
        let admission = WriteAdmission::new(
            store.clone(),
            grid,
            Arc::new(ManualClock::new(50)),
            AdmissionConfig::unlimited(),
        );
        admission
            .place(&place(3, 0, 9, 8, 7), &WriterId::new("w"))
            .unwrap()
            .placement
            .checksum
    };

    let store = PixelStore::open(config).unwrap();
    assert_eq!(store.all_pixels().unwrap(), vec![px(3, 0, 9, 8, 7)]);
    assert_eq!(store.tile_checksum(&grid, TileCoord::new(1, 0)).unwrap(), checksum);
    assert_eq!(store.tile_last_updated(TileCoord::new(1, 0)).unwrap(), Some(50));
}
