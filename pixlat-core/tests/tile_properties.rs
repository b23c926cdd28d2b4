//! Property tests for the tile partition and the tile checksum.

use std::collections::BTreeMap;

use pixlat_core::{CanvasConfig, Color, Pixel, TileChecksum, TileCoord, TileGrid};
use proptest::prelude::*;

fn arb_grid() -> impl Strategy<Value = TileGrid> {
    (1u32..200, 1u32..200, 1u32..40)
        .prop_map(|(w, h, s)| TileGrid::new(CanvasConfig::new(w, h, s).unwrap()))
}

fn arb_grid_and_point() -> impl Strategy<Value = (TileGrid, u32, u32)> {
    arb_grid().prop_flat_map(|g| {
        let w = g.config().width();
        let h = g.config().height();
        (Just(g), 0..w, 0..h)
    })
}

/// Pixel set inside a 16×16 tile at the origin, unique per coordinate.
fn arb_tile_pixels() -> impl Strategy<Value = Vec<Pixel>> {
    prop::collection::btree_map((0u32..16, 0u32..16), any::<(u8, u8, u8)>(), 0..40).prop_map(
        |map: BTreeMap<(u32, u32), (u8, u8, u8)>| {
            map.into_iter()
                .map(|((x, y), (r, g, b))| Pixel::new(x, y, Color::new(r, g, b)))
                .collect()
        },
    )
}

proptest! {
    /// Every coordinate maps to one valid tile whose bounds contain it.
    #[test]
    fn tile_of_is_stable_and_covering((grid, x, y) in arb_grid_and_point()) {
        let tile = grid.tile_of(x, y);
        prop_assert_eq!(tile, grid.tile_of(x, y));
        prop_assert!(grid.is_valid_tile(tile.x as i64, tile.y as i64));
        prop_assert!(grid.bounds_of(tile).contains(x, y));
    }

    /// Tile rectangles are pairwise disjoint and cover the canvas exactly.
    #[test]
    fn tiles_partition_the_canvas(grid in arb_grid()) {
        let tiles: Vec<TileCoord> = grid.tiles().collect();
        let mut covered = 0u64;
        for (i, a) in tiles.iter().enumerate() {
            let ra = grid.bounds_of(*a);
            prop_assert!(!ra.is_empty());
            covered += ra.width() as u64 * ra.height() as u64;
            for b in tiles.iter().skip(i + 1) {
                prop_assert!(ra.intersect(&grid.bounds_of(*b)).is_none());
            }
        }
        prop_assert_eq!(covered, grid.config().area());
    }

    /// The digest does not depend on the order pixels were scanned in.
    #[test]
    fn checksum_permutation_invariant(
        (pixels, permuted) in arb_tile_pixels()
            .prop_flat_map(|p| (Just(p.clone()), Just(p).prop_shuffle())),
    ) {
        prop_assert_eq!(TileChecksum::of_pixels(&pixels), TileChecksum::of_pixels(&permuted));
    }

    /// Changing one pixel's color changes the digest.
    #[test]
    fn checksum_sensitive_to_color(
        pixels in arb_tile_pixels().prop_filter("non-empty", |p| !p.is_empty()),
        pick in any::<prop::sample::Index>(),
        delta in 1u8..=255,
        channel in 0usize..3,
    ) {
        let before = TileChecksum::of_pixels(&pixels);
        let mut changed = pixels.clone();
        let p = &mut changed[pick.index(pixels.len())];
        match channel {
            0 => p.r = p.r.wrapping_add(delta),
            1 => p.g = p.g.wrapping_add(delta),
            _ => p.b = p.b.wrapping_add(delta),
        }
        prop_assert_ne!(before, TileChecksum::of_pixels(&changed));
    }
}

#[test]
fn concrete_four_by_four_scenario() {
    let grid = TileGrid::new(CanvasConfig::new(4, 4, 2).unwrap());
    assert_eq!(grid.tile_count(), 4);

    let red = Pixel::new(0, 0, Color::new(255, 0, 0));
    let green = Pixel::new(1, 1, Color::new(0, 255, 0));
    assert_eq!(grid.tile_of(1, 1), TileCoord::new(0, 0));

    assert_eq!(
        TileChecksum::of_pixels(&[red]),
        TileChecksum::of_canonical("0,0,255,0,0;")
    );
    assert_eq!(
        TileChecksum::of_pixels(&[green, red]),
        TileChecksum::of_canonical("0,0,255,0,0;1,1,0,255,0;")
    );
}
