//! Routines for working with Morton keys.
//!
//! A Morton key is the 64-bit interleaving of an octant's integer anchor
//! coordinates. The key does not encode the level: the pair
//! `(morton, level)` is the persistent identifier of a cell. Keys of a
//! valid linear tree are strictly increasing along the leaf sequence, and
//! the descendants of a cell occupy the contiguous key range
//! `[first_descendant, last_descendant]`.

use crate::constants::MAX_LEVEL;

/// A Morton key.
pub type Morton = u64;

// Spread the low 32 bits of x, inserting one zero bit between each.
fn split_by_one(mut x: u64) -> u64 {
    x &= 0x0000_0000_ffff_ffff;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

// Spread the low 21 bits of x, inserting two zero bits between each.
fn split_by_two(mut x: u64) -> u64 {
    x &= 0x1f_ffff;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

fn compact_by_one(mut x: u64) -> u64 {
    x &= 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    x = (x | (x >> 16)) & 0x0000_0000_ffff_ffff;
    x
}

fn compact_by_two(mut x: u64) -> u64 {
    x &= 0x1249_2492_4924_9249;
    x = (x | (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x | (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x | (x >> 32)) & 0x1f_ffff;
    x
}

/// Encode an integer anchor into a Morton key by bit-interleaving.
///
/// `z` must be zero in two dimensions.
pub fn encode(dim: u8, x: u32, y: u32, z: u32) -> Morton {
    match dim {
        2 => split_by_one(x as u64) | (split_by_one(y as u64) << 1),
        _ => {
            split_by_two(x as u64)
                | (split_by_two(y as u64) << 1)
                | (split_by_two(z as u64) << 2)
        }
    }
}

/// Decode a Morton key back into its anchor coordinates.
pub fn decode(dim: u8, m: Morton) -> [u32; 3] {
    match dim {
        2 => [compact_by_one(m) as u32, compact_by_one(m >> 1) as u32, 0],
        _ => [
            compact_by_two(m) as u32,
            compact_by_two(m >> 1) as u32,
            compact_by_two(m >> 2) as u32,
        ],
    }
}

/// Morton key of the parent of a cell at `level`.
///
/// Clears the interleaved bits below the parent's grid alignment.
pub fn parent(dim: u8, m: Morton, level: u8) -> Morton {
    debug_assert!(level > 0);
    let shift = dim as u32 * (MAX_LEVEL - level + 1) as u32;
    (m >> shift) << shift
}

/// Morton key of child `k` of a cell with key `m` at `level`.
pub fn child(dim: u8, m: Morton, level: u8, k: u8) -> Morton {
    debug_assert!(level < MAX_LEVEL);
    debug_assert!((k as u32) < (1 << dim));
    let shift = dim as u32 * (MAX_LEVEL - level - 1) as u32;
    m | ((k as u64) << shift)
}

/// Morton key of the deepest first descendant of a cell. This is the key
/// of the cell itself.
pub fn first_descendant(m: Morton) -> Morton {
    m
}

/// Morton key of the deepest last descendant of a cell at `level`.
pub fn last_descendant(dim: u8, m: Morton, level: u8) -> Morton {
    let bits = dim as u32 * (MAX_LEVEL - level) as u32;
    m | ((1u64 << bits) - 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::MAX_LENGTH;

    #[test]
    fn test_encode_decode_roundtrip_2d() {
        for &(x, y) in &[
            (0, 0),
            (1, 0),
            (0, 1),
            (123_456, 654_321),
            (MAX_LENGTH - 1, MAX_LENGTH - 1),
        ] {
            let m = encode(2, x, y, 0);
            assert_eq!(decode(2, m), [x, y, 0]);
        }
    }

    #[test]
    fn test_encode_decode_roundtrip_3d() {
        for &(x, y, z) in &[
            (0, 0, 0),
            (1, 2, 4),
            (15, 39, 45),
            (MAX_LENGTH - 1, MAX_LENGTH - 1, MAX_LENGTH - 1),
        ] {
            let m = encode(3, x, y, z);
            assert_eq!(decode(3, m), [x, y, z]);
        }
    }

    #[test]
    fn test_encoding_is_monotone_along_child_order() {
        // The 2^dim children of any cell appear in key order.
        for dim in [2u8, 3u8] {
            let m = encode(dim, 0, 0, 0);
            let level = 3;
            let mut previous = None;
            for k in 0..(1u8 << dim) {
                let c = child(dim, m, level, k);
                if let Some(p) = previous {
                    assert!(c > p);
                }
                previous = Some(c);
            }
        }
    }

    #[test]
    fn test_parent_of_child() {
        for dim in [2u8, 3u8] {
            let half = MAX_LENGTH / 2;
            let quarter = MAX_LENGTH / 4;
            let z = if dim == 3 { half } else { 0 };
            let m = encode(dim, half + quarter, half, z);
            let p = parent(dim, m, 2);
            let coords = decode(dim, p);
            assert_eq!(coords[0], half);
            assert_eq!(coords[1], half);
            assert_eq!(coords[2], z);
        }
    }

    #[test]
    fn test_last_descendant_bounds_subtree() {
        let dim = 3;
        let m = encode(dim, MAX_LENGTH / 2, 0, 0);
        let last = last_descendant(dim, m, 1);
        // Every child key stays within the parent's descendant range.
        for k in 0..8 {
            let c = child(dim, m, 1, k);
            assert!(c >= m && c <= last);
            assert!(last_descendant(dim, c, 2) <= last);
        }
        // The next same-level cell starts right after the range.
        let next = encode(dim, 0, MAX_LENGTH / 2, 0);
        assert_eq!(next, last + 1);
    }

    #[test]
    fn test_deepest_cell_has_degenerate_range() {
        let m = encode(2, 17, 33, 0);
        assert_eq!(last_descendant(2, m, MAX_LEVEL), m);
        assert_eq!(first_descendant(m), m);
    }
}
