//! Tile content digest.
//!
//! The digest covers the canonical string of a tile: for every stored pixel
//! in ascending `(y, x)` order, the fields `"x,y,r,g,b;"` concatenated.
//! Unpainted pixels contribute nothing, so an empty tile digests the empty
//! string.
//!
//! The hash is BLAKE3 truncated to 128 bits and rendered as 32 lowercase hex
//! characters. It detects staleness; it is not a security primitive.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CanvasError;
use crate::pixel::Pixel;

/// Digest length in bytes.
pub const CHECKSUM_LEN: usize = 16;

/// 128-bit digest of a tile's pixel set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileChecksum([u8; CHECKSUM_LEN]);

impl TileChecksum {
    /// Digest of an arbitrary pixel collection.
    ///
    /// The pixels are put into canonical order first, so the result does not
    /// depend on the order the storage layer produced them in.
    pub fn of_pixels<'a, I>(pixels: I) -> Self
    where
        I: IntoIterator<Item = &'a Pixel>,
    {
        let mut sorted: Vec<&Pixel> = pixels.into_iter().collect();
        sorted.sort_unstable_by_key(|p| p.scan_key());
        Self::digest(sorted.into_iter())
    }

    /// Digest of pixels already in `(y, x)` order.
    pub fn of_sorted(pixels: &[Pixel]) -> Self {
        debug_assert!(
            pixels.windows(2).all(|w| w[0].scan_key() < w[1].scan_key()),
            "pixels must be in strictly ascending (y, x) order"
        );
        Self::digest(pixels.iter())
    }

    /// Digest of a tile without pixels.
    pub fn empty() -> Self {
        Self::digest(std::iter::empty())
    }

    /// Digest of a raw canonical string.
    pub fn of_canonical(canonical: &str) -> Self {
        Self::truncate(blake3::hash(canonical.as_bytes()))
    }

    /// Canonical string for a pixel collection (debugging and tests).
    pub fn canonical_string<'a, I>(pixels: I) -> String
    where
        I: IntoIterator<Item = &'a Pixel>,
    {
        let mut sorted: Vec<&Pixel> = pixels.into_iter().collect();
        sorted.sort_unstable_by_key(|p| p.scan_key());
        let mut out = String::new();
        for p in sorted {
            push_segment(&mut out, p);
        }
        out
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against a client-supplied digest string.
    pub fn matches(&self, text: &str) -> bool {
        text.parse::<TileChecksum>().is_ok_and(|other| other == *self)
    }

    fn digest<'a>(pixels: impl Iterator<Item = &'a Pixel>) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut segment = String::with_capacity(24);
        for p in pixels {
            segment.clear();
            push_segment(&mut segment, p);
            hasher.update(segment.as_bytes());
        }
        Self::truncate(hasher.finalize())
    }

    fn truncate(hash: blake3::Hash) -> Self {
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
        Self(out)
    }
}

fn push_segment(out: &mut String, p: &Pixel) {
    out.push_str(&format!("{},{},{},{},{};", p.x, p.y, p.r, p.g, p.b));
}

impl fmt::Display for TileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileChecksum({})", self.to_hex())
    }
}

impl FromStr for TileChecksum {
    type Err = CanvasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; CHECKSUM_LEN];
        hex::decode_to_slice(s.trim(), &mut out)
            .map_err(|_| CanvasError::MalformedChecksum(s.to_string()))?;
        Ok(Self(out))
    }
}

impl Serialize for TileChecksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TileChecksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
