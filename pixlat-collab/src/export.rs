//! Raw canvas export in four formats.
//!
//! | Format    | Shape                                                   |
//! |-----------|---------------------------------------------------------|
//! | `json`    | sparse `{x,y,r,g,b}` list with region metadata          |
//! | `2darray` | dense rows of `[r,g,b]`, unpainted cells white          |
//! | `csv`     | `x,y,r,g,b` header, one line per painted pixel          |
//! | `binary`  | `u32 LE count`, then `u16 LE x, u16 LE y, u8 r, g, b`   |
//!
//! Every format covers a region of the canvas. The dense format refuses
//! regions larger than [`MAX_GRID_CELLS`]; that limit is checked against the
//! region as requested, before it is clamped to the canvas.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use pixlat_core::{CanvasConfig, Clock, Color, Pixel, TileGrid, TileRect};

use crate::storage::{PixelStore, StoreError};

/// Largest region the dense grid format will build.
pub const MAX_GRID_CELLS: i128 = 1_048_576;

/// Bytes per pixel in the binary format.
pub const BINARY_PIXEL_LEN: usize = 7;

/// Export errors.
#[derive(Debug, Clone)]
pub enum ExportError {
    /// Requested region exceeds the dense grid limit
    RegionTooLarge { cells: i128 },
    /// Canvas coordinates do not fit the 16-bit binary fields
    CoordinateOverflow { max_x: u32, max_y: u32 },
    /// Binary payload is shorter or longer than its header claims
    Malformed(String),
    /// Store failure
    Storage(StoreError),
}

impl ExportError {
    pub fn status(&self) -> u16 {
        match self {
            ExportError::RegionTooLarge { .. }
            | ExportError::CoordinateOverflow { .. }
            | ExportError::Malformed(_) => 400,
            ExportError::Storage(_) => 500,
        }
    }

    /// Message safe to show the caller.
    pub fn public_message(&self) -> String {
        match self {
            ExportError::Storage(_) => "Storage unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::RegionTooLarge { cells } => write!(
                f,
                "Region too large for 2D array format ({cells} cells, maximum is {MAX_GRID_CELLS})"
            ),
            ExportError::CoordinateOverflow { max_x, max_y } => write!(
                f,
                "Binary format cannot encode coordinates up to ({max_x}, {max_y})"
            ),
            ExportError::Malformed(e) => write!(f, "Malformed binary export: {e}"),
            ExportError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<StoreError> for ExportError {
    fn from(e: StoreError) -> Self {
        ExportError::Storage(e)
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    #[serde(rename = "2darray")]
    Grid,
    Csv,
    Binary,
}

/// Query parameters of an export request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_height: Option<i64>,
}

impl ExportQuery {
    pub fn whole_canvas(format: ExportFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Region of the canvas, clamped to its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Clamp a requested region: origin into bounds, extent to at least one
    /// pixel and at most what remains of the canvas.
    pub fn clamp(query: &ExportQuery, config: &CanvasConfig) -> Self {
        let w = config.width() as i64;
        let h = config.height() as i64;
        let x = query.region_x.unwrap_or(0).clamp(0, w - 1);
        let y = query.region_y.unwrap_or(0).clamp(0, h - 1);
        let width = query.region_width.unwrap_or(w).min(w - x).max(1);
        let height = query.region_height.unwrap_or(h).min(h - y).max(1);
        Self {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        }
    }

    pub fn rect(&self) -> TileRect {
        TileRect {
            x0: self.x,
            y0: self.y,
            x1: self.x + self.width,
            y1: self.y + self.height,
        }
    }
}

/// Sparse export body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelExport {
    pub success: bool,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub region: Region,
    pub pixel_count: usize,
    pub pixels: Vec<Pixel>,
    pub timestamp: u64,
}

/// Dense export body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridExport {
    pub success: bool,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub region: Region,
    pub grid: Vec<Vec<[u8; 3]>>,
    pub timestamp: u64,
}

/// A rendered export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export {
    Pixels(PixelExport),
    Grid(GridExport),
    Csv(String),
    Binary(Vec<u8>),
}

/// Read-only exporter over the shared store.
pub struct ExportService {
    store: Arc<PixelStore>,
    grid: TileGrid,
    clock: Arc<dyn Clock>,
}

impl ExportService {
    pub fn new(store: Arc<PixelStore>, grid: TileGrid, clock: Arc<dyn Clock>) -> Self {
        Self { store, grid, clock }
    }

    pub fn export(&self, query: &ExportQuery) -> Result<Export, ExportError> {
        let config = *self.grid.config();

        if query.format == ExportFormat::Grid {
            let cells = query.region_width.unwrap_or(config.width() as i64) as i128
                * query.region_height.unwrap_or(config.height() as i64) as i128;
            if cells > MAX_GRID_CELLS {
                return Err(ExportError::RegionTooLarge { cells });
            }
        }

        let region = Region::clamp(query, &config);
        if query.format == ExportFormat::Binary {
            check_binary_range(&region)?;
        }

        let timestamp = self.clock.now();
        let pixels = self.store.pixels_in_rect(region.rect())?;
        log::debug!(
            "Exporting {} pixels as {:?} from {:?}",
            pixels.len(),
            query.format,
            region
        );

        Ok(match query.format {
            ExportFormat::Json => Export::Pixels(PixelExport {
                success: true,
                canvas_width: config.width(),
                canvas_height: config.height(),
                region,
                pixel_count: pixels.len(),
                pixels,
                timestamp,
            }),
            ExportFormat::Grid => Export::Grid(GridExport {
                success: true,
                canvas_width: config.width(),
                canvas_height: config.height(),
                region,
                grid: dense_grid(&region, &pixels),
                timestamp,
            }),
            ExportFormat::Csv => Export::Csv(encode_csv(&pixels)),
            ExportFormat::Binary => Export::Binary(encode_binary(&pixels)?),
        })
    }
}

fn check_binary_range(region: &Region) -> Result<(), ExportError> {
    let max_x = region.x + region.width - 1;
    let max_y = region.y + region.height - 1;
    if max_x > u16::MAX as u32 || max_y > u16::MAX as u32 {
        return Err(ExportError::CoordinateOverflow { max_x, max_y });
    }
    Ok(())
}

/// Dense rows for `region`, white where nothing was painted.
pub fn dense_grid(region: &Region, pixels: &[Pixel]) -> Vec<Vec<[u8; 3]>> {
    let mut grid = vec![vec![Color::WHITE.to_array(); region.width as usize]; region.height as usize];
    let rect = region.rect();
    for p in pixels.iter().filter(|p| rect.contains(p.x, p.y)) {
        grid[(p.y - region.y) as usize][(p.x - region.x) as usize] = p.color().to_array();
    }
    grid
}

/// CSV with a `x,y,r,g,b` header.
pub fn encode_csv(pixels: &[Pixel]) -> String {
    let mut out = String::with_capacity(10 + pixels.len() * 16);
    out.push_str("x,y,r,g,b\n");
    for p in pixels {
        out.push_str(&format!("{},{},{},{},{}\n", p.x, p.y, p.r, p.g, p.b));
    }
    out
}

/// Packed little-endian binary export.
pub fn encode_binary(pixels: &[Pixel]) -> Result<Vec<u8>, ExportError> {
    let count = u32::try_from(pixels.len())
        .map_err(|_| ExportError::Malformed(format!("{} pixels exceed u32", pixels.len())))?;
    let mut out = Vec::with_capacity(4 + pixels.len() * BINARY_PIXEL_LEN);
    out.extend_from_slice(&count.to_le_bytes());
    for p in pixels {
        let (x, y) = match (u16::try_from(p.x), u16::try_from(p.y)) {
            (Ok(x), Ok(y)) => (x, y),
            _ => return Err(ExportError::CoordinateOverflow { max_x: p.x, max_y: p.y }),
        };
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
        out.extend_from_slice(&[p.r, p.g, p.b]);
    }
    Ok(out)
}

/// Decode a packed binary export.
pub fn decode_binary(bytes: &[u8]) -> Result<Vec<Pixel>, ExportError> {
    let header: [u8; 4] = bytes
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ExportError::Malformed("missing count header".into()))?;
    let count = u32::from_le_bytes(header) as usize;
    let body = &bytes[4..];
    if body.len() != count * BINARY_PIXEL_LEN {
        return Err(ExportError::Malformed(format!(
            "header claims {count} pixels, body holds {} bytes",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(BINARY_PIXEL_LEN)
        .map(|c| {
            let x = u16::from_le_bytes([c[0], c[1]]) as u32;
            let y = u16::from_le_bytes([c[2], c[3]]) as u32;
            Pixel::new(x, y, Color::new(c[4], c[5], c[6]))
        })
        .collect())
}
