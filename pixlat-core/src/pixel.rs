//! Pixel, color and writer identity types.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::CanvasError;

/// 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Color of a pixel nobody has painted yet.
    pub const WHITE: Color = Color { r: 255, g: 255, b: 255 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Validate untrusted channel values.
    pub fn from_channels(r: i64, g: i64, b: i64) -> Result<Self, CanvasError> {
        let channel = |v: i64| u8::try_from(v).ok();
        match (channel(r), channel(g), channel(b)) {
            (Some(r), Some(g), Some(b)) => Ok(Self { r, g, b }),
            _ => Err(CanvasError::InvalidColor { r, g, b }),
        }
    }

    pub fn to_array(&self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// A painted pixel as exchanged on the wire: `{x, y, r, g, b}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Pixel {
    pub fn new(x: u32, y: u32, color: Color) -> Self {
        Self { x, y, r: color.r, g: color.g, b: color.b }
    }

    pub fn color(&self) -> Color {
        Color::new(self.r, self.g, self.b)
    }

    /// Canonical scan order: row first, then column.
    pub fn scan_key(&self) -> (u32, u32) {
        (self.y, self.x)
    }
}

/// Opaque identity of whoever placed a pixel (typically a network address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriterId(String);

impl WriterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display form that hides the host part of an address.
    ///
    /// IPv4 keeps the first two octets (`a.b.xxx.xxx`), IPv6 the first two
    /// groups. Anything that is not an address is fully masked.
    pub fn masked(&self) -> String {
        match self.0.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                let [a, b, _, _] = v4.octets();
                format!("{a}.{b}.xxx.xxx")
            }
            Ok(IpAddr::V6(v6)) => {
                let seg = v6.segments();
                format!("{:x}:{:x}:xxxx:xxxx", seg[0], seg[1])
            }
            Err(_) => "unknown.xxx.xxx".to_string(),
        }
    }

    /// Coarse origin label: `Local` for private and loopback addresses.
    pub fn origin_label(&self) -> &'static str {
        match self.0.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) if v4.is_private() || v4.is_loopback() => "Local",
            Ok(IpAddr::V6(v6)) if v6.is_loopback() => "Local",
            _ => "unknown",
        }
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored state of one coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRecord {
    pub pixel: Pixel,
    /// Last write, seconds since the Unix epoch
    pub updated_at: u64,
    pub writer: WriterId,
}
