//! RocksDB-backed durable pixel store.
//!
//! Column families:
//! - `pixels`   — one row per painted coordinate, keyed `<y:4 BE><x:4 BE>`
//!                so a key-ordered scan yields the canonical `(y, x)` order
//! - `tiles`    — per-tile last update and live pixel count, keyed
//!                `<ty:4 BE><tx:4 BE>`
//! - `writers`  — per-writer last placement time
//! - `counters` — live pixels owned by a writer inside one tile, keyed
//!                `<len:2 BE><writer><ty:4 BE><tx:4 BE>`
//!
//! Writes go through a pessimistic `TransactionDB` transaction: the pixel
//! upsert, the tile row, the writer record and the ownership counts commit
//! together or not at all. Rows touched by a write are locked with
//! `get_for_update`, so two writers racing on the same coordinate serialize
//! and the later commit wins. Every counter is scoped to a tile, so writes
//! to different tiles never wait on a shared row.
//!
//! Reference: Kleppmann — DDIA, Chapter 7 (Transactions)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    ErrorKind, IteratorMode, Options, SingleThreaded, Transaction, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pixlat_core::{Color, Pixel, PixelRecord, TileChecksum, TileCoord, TileGrid, TileRect, WriterId};

/// Column family names.
const CF_PIXELS: &str = "pixels";
const CF_TILES: &str = "tiles";
const CF_WRITERS: &str = "writers";
const CF_COUNTERS: &str = "counters";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_PIXELS, CF_TILES, CF_WRITERS, CF_COUNTERS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
    /// How long a transaction waits for a row lock before giving up (ms)
    pub lock_timeout_ms: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pixlat_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            lock_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            lock_timeout_ms: 1_000,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Store directory or column families missing; run provisioning first
    NotProvisioned(String),
    /// RocksDB failure the caller may retry later
    Unavailable(String),
    /// Lock wait timed out or transaction aborted by a concurrent writer
    Conflict(String),
    /// Stored data violates an invariant the store relies on
    InvariantViolation(String),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
}

impl StoreError {
    /// Whether the failure is infrastructure-related rather than a data fault.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotProvisioned(e) => write!(f, "Store not provisioned: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::Conflict(e) => write!(f, "Transaction conflict: {e}"),
            StoreError::InvariantViolation(e) => write!(f, "Storage invariant violated: {e}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            ErrorKind::Busy
            | ErrorKind::TimedOut
            | ErrorKind::TryAgain
            | ErrorKind::Aborted
            | ErrorKind::Expired => StoreError::Conflict(e.to_string()),
            ErrorKind::Corruption => StoreError::InvariantViolation(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Value stored in the `pixels` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPixel {
    r: u8,
    g: u8,
    b: u8,
    updated_at: u64,
    writer: String,
}

impl StoredPixel {
    fn into_record(self, x: u32, y: u32) -> PixelRecord {
        PixelRecord {
            pixel: Pixel::new(x, y, Color::new(self.r, self.g, self.b)),
            updated_at: self.updated_at,
            writer: WriterId::new(self.writer),
        }
    }
}

/// Placement bookkeeping for one writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterRecord {
    /// Timestamp of the most recent accepted placement
    pub last_placed: u64,
}

/// Value stored in the `tiles` column family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TileMeta {
    updated_at: u64,
    /// Painted coordinates inside the tile
    live_pixels: u64,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn decode_count(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::InvariantViolation(format!("counter of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

/// A validated placement ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelWrite {
    pub pixel: Pixel,
    pub writer: WriterId,
    /// Server time of the placement
    pub timestamp: u64,
}

/// Result of a committed upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedWrite {
    /// Row as stored after the commit
    pub record: PixelRecord,
    /// True when the coordinate had never been painted
    pub created: bool,
    /// Digest of the written tile as committed
    pub checksum: TileChecksum,
    /// Live pixels owned by the writer after the commit
    pub writer_pixels: u64,
    /// Live pixels on the canvas after the commit
    pub total_pixels: u64,
}

/// Outcome of [`PixelStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied(AppliedWrite),
    /// Writer placed a pixel less than the minimum interval ago; nothing written
    Throttled { last_placed: u64, retry_after_secs: u64 },
}

/// RocksDB-backed pixel store.
///
/// Holds no in-memory canvas state: every read goes to the database, which
/// is the single source of truth shared by all request handlers.
pub struct PixelStore {
    /// RocksDB instance with pessimistic transactions
    db: TransactionDB<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
}

impl PixelStore {
    /// Create the database and its column families if they are missing.
    ///
    /// Idempotent; meant to run once at deployment, never on the request path.
    pub fn provision(config: &StoreConfig) -> Result<(), StoreError> {
        let store = Self::open_with(config.clone(), true)?;
        log::info!("Provisioned pixel store at {}", store.path().display());
        Ok(())
    }

    /// Open an already provisioned store.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if !config.path.join("CURRENT").exists() {
            return Err(StoreError::NotProvisioned(format!(
                "no database at {}",
                config.path.display()
            )));
        }
        let store = Self::open_with(config, false)?;
        log::info!("Opened pixel store at {}", store.path().display());
        Ok(store)
    }

    fn open_with(config: StoreConfig, create: bool) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(create);
        db_opts.create_missing_column_families(create);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout_ms);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = TransactionDB::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &txn_db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidArgument if !create => StoreError::NotProvisioned(e.to_string()),
            _ => StoreError::from(e),
        })?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PIXELS => {
                // Range scans per tile row dominate reads
                opts.set_max_write_buffer_number(4);
            }
            CF_WRITERS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Load the record stored at one coordinate.
    pub fn get_pixel(&self, x: u32, y: u32) -> Result<Option<PixelRecord>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        match self.db.get_cf(&cf, pixel_key(x, y))? {
            Some(bytes) => Ok(Some(decode::<StoredPixel>(&bytes)?.into_record(x, y))),
            None => Ok(None),
        }
    }

    /// All records inside `rect`, in `(y, x)` order.
    pub fn records_in_rect(&self, rect: TileRect) -> Result<Vec<PixelRecord>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        scan_rect(rect, |start| {
            self.db
                .iterator_cf(cf, IteratorMode::From(start, Direction::Forward))
        })
    }

    /// Pixels inside `rect`, in `(y, x)` order.
    pub fn pixels_in_rect(&self, rect: TileRect) -> Result<Vec<Pixel>, StoreError> {
        Ok(self.records_in_rect(rect)?.into_iter().map(|r| r.pixel).collect())
    }

    /// Every stored pixel, in `(y, x)` order.
    pub fn all_pixels(&self) -> Result<Vec<Pixel>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut pixels = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let (x, y) = split_pixel_key(&key)?;
            pixels.push(decode::<StoredPixel>(&value)?.into_record(x, y).pixel);
        }
        Ok(pixels)
    }

    /// Current digest of one tile, recomputed from stored rows.
    pub fn tile_checksum(&self, grid: &TileGrid, tile: TileCoord) -> Result<TileChecksum, StoreError> {
        let pixels = self.pixels_in_rect(grid.bounds_of(tile))?;
        Ok(TileChecksum::of_sorted(&pixels))
    }

    /// Most recent write timestamp in a tile, if it was ever written.
    pub fn tile_last_updated(&self, tile: TileCoord) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_TILES)?;
        self.db
            .get_cf(&cf, tile_key(tile))?
            .map(|bytes| decode::<TileMeta>(&bytes).map(|meta| meta.updated_at))
            .transpose()
    }

    /// Tiles whose last update is strictly after `since`.
    pub fn tiles_updated_since(&self, since: u64) -> Result<Vec<(TileCoord, u64)>, StoreError> {
        let cf = self.cf(CF_TILES)?;
        let mut tiles = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let meta: TileMeta = decode(&value)?;
            if meta.updated_at > since {
                tiles.push((split_tile_key(&key)?, meta.updated_at));
            }
        }
        Ok(tiles)
    }

    /// Records written strictly after `since`, grouped tile by tile.
    ///
    /// Only tiles whose cached timestamp moved past `since` are scanned.
    pub fn records_since(&self, grid: &TileGrid, since: u64) -> Result<Vec<PixelRecord>, StoreError> {
        let mut records = Vec::new();
        for (tile, _) in self.tiles_updated_since(since)? {
            records.extend(
                self.records_in_rect(grid.bounds_of(tile))?
                    .into_iter()
                    .filter(|r| r.updated_at > since),
            );
        }
        Ok(records)
    }

    /// Placement bookkeeping for a writer.
    pub fn writer_record(&self, writer: &WriterId) -> Result<Option<WriterRecord>, StoreError> {
        let cf = self.cf(CF_WRITERS)?;
        self.db
            .get_cf(&cf, writer.as_str().as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Number of painted coordinates on the canvas.
    pub fn live_pixels(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_TILES)?;
        sum_live_pixels(self.db.iterator_cf(cf, IteratorMode::Start))
    }

    /// Number of painted coordinates whose latest write came from `writer`.
    pub fn live_pixels_by(&self, writer: &WriterId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_COUNTERS)?;
        let prefix = owner_prefix(writer)?;
        sum_owned(&prefix, |start| {
            self.db
                .iterator_cf(cf, IteratorMode::From(start, Direction::Forward))
        })
    }

    /// Writer owning the most live pixels (ties go to the shorter, then smaller id).
    pub fn top_writer(&self) -> Result<Option<(WriterId, u64)>, StoreError> {
        let cf = self.cf(CF_COUNTERS)?;
        let mut best: Option<(WriterId, u64)> = None;
        let mut current: Option<(String, u64)> = None;

        // Keys of one writer are contiguous, so one pass folds them together
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let (writer, _) = split_owner_key(&key)?;
            let count = decode_count(&value)?;
            match current.as_mut() {
                Some((id, total)) if *id == writer => *total += count,
                _ => {
                    if let Some(done) = current.replace((writer, count)) {
                        keep_best(&mut best, done);
                    }
                }
            }
        }
        if let Some(done) = current {
            keep_best(&mut best, done);
        }
        Ok(best)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Insert or update one pixel in a single transaction.
    ///
    /// Within the transaction:
    /// 1. lock the writer row and enforce `min_interval_secs` (0 disables)
    /// 2. lock and upsert the coordinate row; its timestamp never moves back
    /// 3. advance the tile timestamp (monotonic) and its live count
    /// 4. move ownership of the coordinate to the writer
    /// 5. read back the tile digest and the live counts
    ///
    /// Locks are always taken in that order, and ownership rows are only
    /// touched under the tile lock. Any failure drops the transaction, which
    /// rolls everything back.
    pub fn upsert(
        &self,
        grid: &TileGrid,
        write: &PixelWrite,
        min_interval_secs: u64,
    ) -> Result<UpsertOutcome, StoreError> {
        let cf_pixels = self.cf(CF_PIXELS)?;
        let cf_tiles = self.cf(CF_TILES)?;
        let cf_writers = self.cf(CF_WRITERS)?;
        let cf_counters = self.cf(CF_COUNTERS)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        let txn = self.db.transaction_opt(&write_opts, &TransactionOptions::default());

        let writer_key = write.writer.as_str().as_bytes();
        let previous_writer: Option<WriterRecord> = txn
            .get_for_update_cf(&cf_writers, writer_key, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?;

        if let Some(last) = previous_writer.filter(|_| min_interval_secs > 0) {
            let elapsed = write.timestamp.saturating_sub(last.last_placed);
            if elapsed < min_interval_secs {
                txn.rollback()?;
                return Ok(UpsertOutcome::Throttled {
                    last_placed: last.last_placed,
                    retry_after_secs: min_interval_secs - elapsed,
                });
            }
        }

        let Pixel { x, y, r, g, b } = write.pixel;
        let key = pixel_key(x, y);
        let previous: Option<StoredPixel> = txn
            .get_for_update_cf(&cf_pixels, &key, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?;
        let updated_at = previous
            .as_ref()
            .map_or(write.timestamp, |p| p.updated_at.max(write.timestamp));
        let stored = StoredPixel {
            r,
            g,
            b,
            updated_at,
            writer: write.writer.as_str().to_string(),
        };
        txn.put_cf(&cf_pixels, &key, encode(&stored)?)?;

        let tile = grid.tile_of(x, y);
        let tkey = tile_key(tile);
        let mut meta: TileMeta = txn
            .get_for_update_cf(&cf_tiles, &tkey, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?
            .unwrap_or_default();
        meta.updated_at = meta.updated_at.max(updated_at);
        if previous.is_none() {
            meta.live_pixels += 1;
        }
        txn.put_cf(&cf_tiles, &tkey, encode(&meta)?)?;

        let last_placed = previous_writer.map_or(0, |w| w.last_placed);
        let record = WriterRecord {
            last_placed: last_placed.max(write.timestamp),
        };
        txn.put_cf(&cf_writers, writer_key, encode(&record)?)?;

        match previous.as_ref().map(|p| p.writer.as_str()) {
            None => {
                adjust_owned(&txn, cf_counters, &owner_key(&write.writer, tile)?, 1)?;
            }
            Some(old) if old != write.writer.as_str() => {
                let old = WriterId::new(old);
                adjust_owned(&txn, cf_counters, &owner_key(&old, tile)?, -1)?;
                adjust_owned(&txn, cf_counters, &owner_key(&write.writer, tile)?, 1)?;
            }
            Some(_) => {}
        }

        let tile_pixels: Vec<Pixel> = scan_rect(grid.bounds_of(tile), |start| {
            txn.iterator_cf(cf_pixels, IteratorMode::From(start, Direction::Forward))
        })?
        .into_iter()
        .map(|r| r.pixel)
        .collect();
        let checksum = TileChecksum::of_sorted(&tile_pixels);
        let total_pixels = sum_live_pixels(txn.iterator_cf(cf_tiles, IteratorMode::Start))?;
        let writer_pixels = sum_owned(&owner_prefix(&write.writer)?, |start| {
            txn.iterator_cf(cf_counters, IteratorMode::From(start, Direction::Forward))
        })?;

        txn.commit()?;

        Ok(UpsertOutcome::Applied(AppliedWrite {
            record: stored.into_record(x, y),
            created: previous.is_none(),
            checksum,
            writer_pixels,
            total_pixels,
        }))
    }

    /// Delete every pixel, tile row and ownership count.
    ///
    /// Writer records are kept, so rate limits survive a reset. Returns the
    /// number of pixels removed.
    pub fn clear(&self) -> Result<u64, StoreError> {
        let cf_pixels = self.cf(CF_PIXELS)?;
        let cf_tiles = self.cf(CF_TILES)?;
        let cf_counters = self.cf(CF_COUNTERS)?;

        let txn = self.db.transaction();
        let mut removed = 0u64;
        for item in self.db.iterator_cf(&cf_pixels, IteratorMode::Start) {
            let (key, _) = item?;
            txn.delete_cf(&cf_pixels, &key)?;
            removed += 1;
        }
        for item in self.db.iterator_cf(&cf_tiles, IteratorMode::Start) {
            let (key, _) = item?;
            txn.delete_cf(&cf_tiles, &key)?;
        }
        for item in self.db.iterator_cf(&cf_counters, IteratorMode::Start) {
            let (key, _) = item?;
            txn.delete_cf(&cf_counters, &key)?;
        }
        txn.commit()?;

        log::info!("Cleared {removed} pixels from {}", self.path().display());
        Ok(removed)
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::NotProvisioned(format!("column family '{name}' not found")))
    }
}

type Row = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>;

/// Collect the rows of `rect`, seeking once per canvas row.
///
/// `seek` opens a forward iterator at a key, on the database or inside a
/// transaction.
fn scan_rect<I>(rect: TileRect, mut seek: impl FnMut(&[u8]) -> I) -> Result<Vec<PixelRecord>, StoreError>
where
    I: Iterator<Item = Row>,
{
    let mut records = Vec::new();
    for y in rect.y0..rect.y1 {
        for item in seek(&pixel_key(rect.x0, y)) {
            let (key, value) = item?;
            let (px, py) = split_pixel_key(&key)?;
            if py != y || px >= rect.x1 {
                break;
            }
            records.push(decode::<StoredPixel>(&value)?.into_record(px, py));
        }
    }
    Ok(records)
}

fn sum_live_pixels(rows: impl Iterator<Item = Row>) -> Result<u64, StoreError> {
    let mut total = 0u64;
    for item in rows {
        let (_, value) = item?;
        total += decode::<TileMeta>(&value)?.live_pixels;
    }
    Ok(total)
}

fn sum_owned<I>(prefix: &[u8], seek: impl FnOnce(&[u8]) -> I) -> Result<u64, StoreError>
where
    I: Iterator<Item = Row>,
{
    let mut total = 0u64;
    for item in seek(prefix) {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        total += decode_count(&value)?;
    }
    Ok(total)
}

/// Add `delta` to an ownership count; a count reaching zero is deleted.
fn adjust_owned<DB>(
    txn: &Transaction<'_, DB>,
    cf: &ColumnFamily,
    key: &[u8],
    delta: i64,
) -> Result<(), StoreError> {
    let current = txn
        .get_for_update_cf(cf, key, true)?
        .map_or(Ok(0), |bytes| decode_count(&bytes))?;
    let next = current.checked_add_signed(delta).ok_or_else(|| {
        StoreError::InvariantViolation(format!("ownership count {current} moved by {delta}"))
    })?;
    if next == 0 {
        txn.delete_cf(cf, key)?;
    } else {
        txn.put_cf(cf, key, next.to_be_bytes())?;
    }
    Ok(())
}

fn keep_best(best: &mut Option<(WriterId, u64)>, (id, count): (String, u64)) {
    if best.as_ref().map_or(true, |(_, top)| count > *top) {
        *best = Some((WriterId::new(id), count));
    }
}

/// Ownership prefix: writer id length (2 bytes BE) + writer id bytes.
fn owner_prefix(writer: &WriterId) -> Result<Vec<u8>, StoreError> {
    let id = writer.as_str().as_bytes();
    let len = u16::try_from(id.len()).map_err(|_| {
        StoreError::Serialization(format!("writer id of {} bytes", id.len()))
    })?;
    let mut key = Vec::with_capacity(2 + id.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(id);
    Ok(key)
}

/// Ownership key: owner prefix + tile key.
fn owner_key(writer: &WriterId, tile: TileCoord) -> Result<Vec<u8>, StoreError> {
    let mut key = owner_prefix(writer)?;
    key.extend_from_slice(&tile_key(tile));
    Ok(key)
}

fn split_owner_key(key: &[u8]) -> Result<(String, TileCoord), StoreError> {
    let malformed = || StoreError::InvariantViolation(format!("ownership key of {} bytes", key.len()));
    let len_bytes: [u8; 2] = key.get(..2).and_then(|b| b.try_into().ok()).ok_or_else(malformed)?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if key.len() != 2 + len + 8 {
        return Err(malformed());
    }
    let id = String::from_utf8(key[2..2 + len].to_vec())
        .map_err(|_| StoreError::InvariantViolation("writer id is not UTF-8".into()))?;
    Ok((id, split_tile_key(&key[2 + len..])?))
}

/// Pixel key: y (4 bytes BE) + x (4 bytes BE).
fn pixel_key(x: u32, y: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&y.to_be_bytes());
    key[4..].copy_from_slice(&x.to_be_bytes());
    key
}

fn split_pixel_key(key: &[u8]) -> Result<(u32, u32), StoreError> {
    let (y, x) = split_pair(key, "pixel")?;
    Ok((x, y))
}

/// Tile key: ty (4 bytes BE) + tx (4 bytes BE).
fn tile_key(tile: TileCoord) -> [u8; 8] {
    pixel_key(tile.x, tile.y)
}

fn split_tile_key(key: &[u8]) -> Result<TileCoord, StoreError> {
    let (ty, tx) = split_pair(key, "tile")?;
    Ok(TileCoord::new(tx, ty))
}

fn split_pair(key: &[u8], what: &str) -> Result<(u32, u32), StoreError> {
    if key.len() != 8 {
        return Err(StoreError::InvariantViolation(format!(
            "{what} key of {} bytes",
            key.len()
        )));
    }
    let mut hi = [0u8; 4];
    let mut lo = [0u8; 4];
    hi.copy_from_slice(&key[..4]);
    lo.copy_from_slice(&key[4..]);
    Ok((u32::from_be_bytes(hi), u32::from_be_bytes(lo)))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixlat_core::CanvasConfig;

    fn open_temp() -> (tempfile::TempDir, PixelStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        PixelStore::provision(&config).unwrap();
        let store = PixelStore::open(config).unwrap();
        (dir, store)
    }

    fn grid() -> TileGrid {
        TileGrid::new(CanvasConfig::new(64, 64, 8).unwrap())
    }

    fn write(x: u32, y: u32, rgb: (u8, u8, u8), writer: &str, ts: u64) -> PixelWrite {
        PixelWrite {
            pixel: Pixel::new(x, y, Color::new(rgb.0, rgb.1, rgb.2)),
            writer: WriterId::new(writer),
            timestamp: ts,
        }
    }

    fn applied(outcome: UpsertOutcome) -> AppliedWrite {
        match outcome {
            UpsertOutcome::Applied(a) => a,
            other => panic!("expected applied write, got {other:?}"),
        }
    }

    #[test]
    fn test_open_requires_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("missing"));
        match PixelStore::open(config) {
            Err(StoreError::NotProvisioned(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened an unprovisioned store"),
        }
    }

    #[test]
    fn test_provision_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        PixelStore::provision(&config).unwrap();
        PixelStore::provision(&config).unwrap();
        assert!(PixelStore::open(config).is_ok());
    }

    #[test]
    fn test_upsert_insert_then_update() {
        let (_dir, store) = open_temp();
        let g = grid();

        let first = applied(store.upsert(&g, &write(3, 4, (1, 2, 3), "a", 10), 0).unwrap());
        assert!(first.created);
        assert_eq!(first.writer_pixels, 1);
        assert_eq!(first.total_pixels, 1);

        let second = applied(store.upsert(&g, &write(3, 4, (9, 9, 9), "b", 11), 0).unwrap());
        assert!(!second.created);
        assert_eq!(second.total_pixels, 1);
        assert_eq!(second.writer_pixels, 1);
        assert_eq!(second.checksum, store.tile_checksum(&g, TileCoord::new(0, 0)).unwrap());

        let record = store.get_pixel(3, 4).unwrap().unwrap();
        assert_eq!(record.pixel.color(), Color::new(9, 9, 9));
        assert_eq!(record.writer, WriterId::new("b"));
        assert_eq!(record.updated_at, 11);
        assert_eq!(store.all_pixels().unwrap().len(), 1);
    }

    #[test]
    fn test_pixel_timestamp_never_moves_back() {
        let (_dir, store) = open_temp();
        let g = grid();
        store.upsert(&g, &write(0, 0, (1, 1, 1), "a", 50), 0).unwrap();
        let late = applied(store.upsert(&g, &write(0, 0, (2, 2, 2), "a", 40), 0).unwrap());
        assert_eq!(late.record.updated_at, 50);
        assert_eq!(store.tile_last_updated(TileCoord::new(0, 0)).unwrap(), Some(50));
    }

    #[test]
    fn test_rect_scan_order_and_clipping() {
        let (_dir, store) = open_temp();
        let g = grid();
        for (x, y) in [(7, 1), (0, 1), (5, 0), (8, 0), (2, 8)] {
            store.upsert(&g, &write(x, y, (0, 0, 0), "a", 1), 0).unwrap();
        }
        let tile = store.pixels_in_rect(g.bounds_of(TileCoord::new(0, 0))).unwrap();
        let coords: Vec<(u32, u32)> = tile.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(coords, vec![(5, 0), (0, 1), (7, 1)]);
    }

    #[test]
    fn test_tile_timestamps_and_since() {
        let (_dir, store) = open_temp();
        let g = grid();
        store.upsert(&g, &write(1, 1, (1, 1, 1), "a", 100), 0).unwrap();
        store.upsert(&g, &write(20, 1, (1, 1, 1), "a", 200), 0).unwrap();

        assert_eq!(store.tile_last_updated(TileCoord::new(0, 0)).unwrap(), Some(100));
        assert_eq!(store.tile_last_updated(TileCoord::new(2, 0)).unwrap(), Some(200));
        assert_eq!(store.tile_last_updated(TileCoord::new(1, 1)).unwrap(), None);

        let since = store.records_since(&g, 150).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].pixel.x, 20);
        assert_eq!(store.records_since(&g, 99).unwrap().len(), 2);
        assert!(store.records_since(&g, 200).unwrap().is_empty());
    }

    #[test]
    fn test_throttle_leaves_no_trace() {
        let (_dir, store) = open_temp();
        let g = grid();
        store.upsert(&g, &write(0, 0, (1, 1, 1), "w", 0), 5).unwrap();

        let outcome = store.upsert(&g, &write(1, 0, (1, 1, 1), "w", 2), 5).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Throttled { last_placed: 0, retry_after_secs: 3 }
        );
        assert!(store.get_pixel(1, 0).unwrap().is_none());
        assert_eq!(store.live_pixels().unwrap(), 1);

        // Other writers are not affected
        assert!(matches!(
            store.upsert(&g, &write(1, 0, (1, 1, 1), "v", 2), 5).unwrap(),
            UpsertOutcome::Applied(_)
        ));
    }

    #[test]
    fn test_writer_records_and_top_writer() {
        let (_dir, store) = open_temp();
        let g = grid();
        store.upsert(&g, &write(0, 0, (1, 1, 1), "a", 1), 0).unwrap();
        store.upsert(&g, &write(1, 0, (1, 1, 1), "b", 2), 0).unwrap();
        store.upsert(&g, &write(20, 20, (1, 1, 1), "b", 3), 0).unwrap();

        let b = store.writer_record(&WriterId::new("b")).unwrap().unwrap();
        assert_eq!(b, WriterRecord { last_placed: 3 });
        assert!(store.writer_record(&WriterId::new("c")).unwrap().is_none());

        assert_eq!(store.top_writer().unwrap(), Some((WriterId::new("b"), 2)));
        assert_eq!(store.live_pixels_by(&WriterId::new("b")).unwrap(), 2);
        assert_eq!(store.live_pixels().unwrap(), 3);
    }

    #[test]
    fn test_live_counts_follow_ownership() {
        let (_dir, store) = open_temp();
        let g = grid();
        let (a, b) = (WriterId::new("a"), WriterId::new("b"));

        store.upsert(&g, &write(0, 0, (1, 1, 1), "a", 1), 0).unwrap();
        store.upsert(&g, &write(0, 0, (2, 2, 2), "a", 2), 0).unwrap();
        let last = applied(store.upsert(&g, &write(0, 0, (3, 3, 3), "b", 3), 0).unwrap());

        assert_eq!((last.writer_pixels, last.total_pixels), (1, 1));
        assert_eq!(store.live_pixels_by(&a).unwrap(), 0);
        assert_eq!(store.live_pixels_by(&b).unwrap(), 1);
        assert_eq!(store.live_pixels().unwrap(), 1);
        assert_eq!(store.top_writer().unwrap(), Some((b, 1)));
    }

    #[test]
    fn test_live_counts_do_not_leak_across_prefixes() {
        let (_dir, store) = open_temp();
        let g = grid();
        store.upsert(&g, &write(0, 0, (1, 1, 1), "ab", 1), 0).unwrap();
        store.upsert(&g, &write(1, 0, (1, 1, 1), "a", 1), 0).unwrap();
        store.upsert(&g, &write(40, 0, (1, 1, 1), "a", 1), 0).unwrap();

        assert_eq!(store.live_pixels_by(&WriterId::new("a")).unwrap(), 2);
        assert_eq!(store.live_pixels_by(&WriterId::new("ab")).unwrap(), 1);
        assert_eq!(store.live_pixels_by(&WriterId::new("b")).unwrap(), 0);
    }

    #[test]
    fn test_writes_to_different_tiles_commit_concurrently() {
        let (_dir, store) = open_temp();
        let store = std::sync::Arc::new(store);
        let g = grid();

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..20u32 {
                        let w = write(i * 8, j % 8, (1, 1, 1), &format!("w{i}"), u64::from(j));
                        assert!(matches!(
                            store.upsert(&g, &w, 0).unwrap(),
                            UpsertOutcome::Applied(_)
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.live_pixels().unwrap(), 64);
        assert_eq!(store.live_pixels_by(&WriterId::new("w3")).unwrap(), 8);
    }

    #[test]
    fn test_clear_resets_live_counts() {
        let (_dir, store) = open_temp();
        let g = grid();
        store.upsert(&g, &write(0, 0, (1, 1, 1), "a", 1), 0).unwrap();
        store.upsert(&g, &write(30, 30, (1, 1, 1), "a", 1), 0).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.all_pixels().unwrap().is_empty());
        assert!(store.tiles_updated_since(0).unwrap().is_empty());
        assert_eq!(store.live_pixels().unwrap(), 0);
        assert_eq!(store.live_pixels_by(&WriterId::new("a")).unwrap(), 0);
        assert!(store.top_writer().unwrap().is_none());
        assert!(store.writer_record(&WriterId::new("a")).unwrap().is_some());
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        PixelStore::provision(&config).unwrap();
        {
            let store = PixelStore::open(config.clone()).unwrap();
            store.upsert(&grid(), &write(9, 9, (4, 5, 6), "a", 7), 0).unwrap();
            store.flush().unwrap();
        }
        let store = PixelStore::open(config).unwrap();
        let record = store.get_pixel(9, 9).unwrap().unwrap();
        assert_eq!(record.pixel.color(), Color::new(4, 5, 6));
    }

    #[test]
    fn test_owner_key_layout() {
        let key = owner_key(&WriterId::new("10.0.0.1"), TileCoord::new(3, 2)).unwrap();
        assert_eq!(
            split_owner_key(&key).unwrap(),
            ("10.0.0.1".to_string(), TileCoord::new(3, 2))
        );
        assert!(key.starts_with(&owner_prefix(&WriterId::new("10.0.0.1")).unwrap()));
        assert!(split_owner_key(&key[..key.len() - 1]).is_err());
    }

    #[test]
    fn test_key_layout_sorts_rows_first() {
        assert!(pixel_key(63, 0) < pixel_key(0, 1));
        assert_eq!(split_pixel_key(&pixel_key(5, 9)).unwrap(), (5, 9));
        assert!(split_pixel_key(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Conflict("busy".into()).is_transient());
        assert!(StoreError::Unavailable("io".into()).is_transient());
        assert!(!StoreError::InvariantViolation("bad".into()).is_transient());
    }
}
