//! Pixlat server binary.
//!
//! ```text
//! pixlat-server provision --db ./pixlat_data
//! pixlat-server serve --bind 0.0.0.0:9090 --width 1000 --height 1000
//! pixlat-server reset --db ./pixlat_data --yes
//! ```
//!
//! Every flag can also be set through its `PIXLAT_*` environment variable.
//! Log filtering follows `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use pixlat_collab::admission::AdmissionConfig;
use pixlat_collab::server::{CanvasServer, ServerConfig};
use pixlat_collab::stats::DEFAULT_PRESENCE_TTL_SECS;
use pixlat_collab::storage::{PixelStore, StoreConfig};
use pixlat_core::{CanvasConfig, SystemClock};

#[derive(Parser)]
#[command(name = "pixlat-server", version, about = "Shared pixel canvas server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the canvas over WebSocket
    Serve(ServeArgs),
    /// Create the pixel store if it does not exist
    Provision(StoreArgs),
    /// Delete every pixel; rate-limit state is kept
    Reset {
        #[command(flatten)]
        store: StoreArgs,
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
struct StoreArgs {
    /// Database directory
    #[arg(long, env = "PIXLAT_DB", default_value = "pixlat_data")]
    db: PathBuf,
    /// Fsync every commit
    #[arg(long, env = "PIXLAT_SYNC_WRITES")]
    sync_writes: bool,
    /// Row lock wait before a write gives up (ms)
    #[arg(long, env = "PIXLAT_LOCK_TIMEOUT_MS", default_value_t = 1_000)]
    lock_timeout_ms: i64,
}

impl StoreArgs {
    fn config(&self) -> StoreConfig {
        StoreConfig {
            path: self.db.clone(),
            sync_writes: self.sync_writes,
            lock_timeout_ms: self.lock_timeout_ms,
            ..StoreConfig::default()
        }
    }
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Address to listen on
    #[arg(long, env = "PIXLAT_BIND", default_value = "127.0.0.1:9090")]
    bind: String,
    /// Canvas width in pixels
    #[arg(long, env = "PIXLAT_WIDTH", default_value_t = 1000)]
    width: u32,
    /// Canvas height in pixels
    #[arg(long, env = "PIXLAT_HEIGHT", default_value_t = 1000)]
    height: u32,
    /// Tile edge in pixels
    #[arg(long, env = "PIXLAT_TILE_SIZE", default_value_t = 32)]
    tile_size: u32,
    /// Minimum seconds between placements by one writer (0 disables)
    #[arg(long, env = "PIXLAT_RATE_LIMIT_SECS", default_value_t = 5)]
    rate_limit_secs: u64,
    /// Pixel events buffered per connection
    #[arg(long, env = "PIXLAT_BROADCAST_CAPACITY", default_value_t = 1024)]
    broadcast_capacity: usize,
    /// Seconds a caller counts as active after its last stats request
    #[arg(long, env = "PIXLAT_PRESENCE_TTL_SECS", default_value_t = DEFAULT_PRESENCE_TTL_SECS)]
    presence_ttl_secs: u64,
    /// Provision the store before serving
    #[arg(long)]
    provision: bool,
}

impl ServeArgs {
    fn config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        Ok(ServerConfig {
            bind_addr: self.bind.clone(),
            storage: self.store.config(),
            canvas: CanvasConfig::new(self.width, self.height, self.tile_size)?,
            admission: AdmissionConfig {
                rate_limit_secs: self.rate_limit_secs,
            },
            broadcast_capacity: self.broadcast_capacity,
            presence_ttl_secs: self.presence_ttl_secs,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let config = args.config()?;
            if args.provision {
                PixelStore::provision(&config.storage)?;
            }
            let server = CanvasServer::open(config, Arc::new(SystemClock))?;
            server.run().await?;
        }
        Command::Provision(args) => {
            let config = args.config();
            PixelStore::provision(&config)?;
            info!("Pixel store ready at {}", config.path.display());
        }
        Command::Reset { store, yes } => {
            if !yes {
                warn!("Refusing to reset {} without --yes", store.db.display());
                return Ok(());
            }
            let store = PixelStore::open(store.config())?;
            let removed = store.clear()?;
            store.flush()?;
            info!("Removed {removed} pixels from {}", store.path().display());
        }
    }
    Ok(())
}
