//! Space-filling-curve keys.
//!
//! A key is a 63-bit Morton interleave of the three coordinates of a
//! position, normalized to the global bounding box. Lexicographic order on
//! keys equals Z-order on positions, so a sorted particle array is a
//! depth-first flattening of the tree.

use crate::space::OrientedBox;

/// 63-bit SFC key stored in the low bits of a u64. Bit 63 is never set by
/// key generation; lookup keys (see [`crate::tree`]) borrow it for the
/// root's level marker.
pub type Key = u64;

pub const FIRST_POSSIBLE_KEY: Key = 0;
pub const LAST_POSSIBLE_KEY: Key = (1u64 << 63) - 1;

/// Bits of the f32 mantissa kept per coordinate.
const BITS_PER_DIM: u32 = 21;
const DIM_MASK: u64 = (1 << BITS_PER_DIM) - 1;

/// Clamp bound keeping `1.0 + x` strictly below 2.0 after rounding, so a
/// coordinate exactly on the upper box face stays inside the last cell.
const UNDER_ONE: f32 = 1.0 - f32::EPSILON;

#[inline]
fn coord_bits(x: f64) -> u64 {
    // Shift the normalized coordinate into [1, 2): the f32 mantissa is then
    // exactly the binary fraction, and its top 21 bits are the cell index.
    let f = 1.0f32 + (x as f32).clamp(0.0, UNDER_ONE);
    ((f.to_bits() as u64) >> 2) & DIM_MASK
}

/// Generate the 63-bit key for `pos` inside `bbox`.
///
/// The x coordinate supplies bit 62, y bit 61, z bit 60, then x again at
/// bit 59 and so on. Behaviour for positions outside the box is the
/// clamped cell on the nearest face; callers are expected to clip.
pub fn generate_key(pos: [f32; 3], bbox: &OrientedBox) -> Key {
    let nx = coord_bits((pos[0] as f64 - bbox.lesser[0]) / (bbox.greater[0] - bbox.lesser[0]));
    let ny = coord_bits((pos[1] as f64 - bbox.lesser[1]) / (bbox.greater[1] - bbox.lesser[1]));
    let nz = coord_bits((pos[2] as f64 - bbox.lesser[2]) / (bbox.greater[2] - bbox.lesser[2]));

    let mut key: Key = 0;
    for i in 0..BITS_PER_DIM {
        let shift = BITS_PER_DIM - 1 - i;
        key |= ((nx >> shift) & 1) << (62 - 3 * i);
        key |= ((ny >> shift) & 1) << (61 - 3 * i);
        key |= ((nz >> shift) & 1) << (60 - 3 * i);
    }
    key
}

/// Render the top `level` bits of a key as a binary string, for
/// diagnostics and tree dumps.
pub fn key_bits(key: Key, level: u8) -> String {
    (0..level).map(|i| if key >> (62 - i as u64) & 1 == 1 { '1' } else { '0' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn unit_box() -> OrientedBox {
        OrientedBox::new([0.0; 3], [1.0; 3])
    }

    #[test]
    fn corners_map_to_extremes() {
        let b = unit_box();
        assert_eq!(generate_key([0.0, 0.0, 0.0], &b), FIRST_POSSIBLE_KEY);
        assert_eq!(generate_key([1.0, 1.0, 1.0], &b), LAST_POSSIBLE_KEY);
    }

    #[test]
    fn x_supplies_the_top_bit() {
        let b = unit_box();
        let kx = generate_key([0.75, 0.0, 0.0], &b);
        let ky = generate_key([0.0, 0.75, 0.0], &b);
        let kz = generate_key([0.0, 0.0, 0.75], &b);
        assert_eq!(kx >> 62, 1);
        assert_eq!(ky >> 61 & 1, 1);
        assert_eq!(kz >> 60 & 1, 1);
        assert!(kx > ky && ky > kz);
    }

    #[test]
    fn keys_monotone_along_z_order_diagonal() {
        // Points on the main diagonal visit cells in strictly increasing
        // Z-order, so their keys must be non-decreasing.
        let b = unit_box();
        let mut rng = StdRng::seed_from_u64(7);
        let mut ts: Vec<f32> = (0..512).map(|_| rng.gen::<f32>()).collect();
        ts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut prev = FIRST_POSSIBLE_KEY;
        for &t in &ts {
            let k = generate_key([t, t, t], &b);
            assert!(k >= prev, "diagonal keys regressed at t={t}");
            prev = k;
        }
    }

    #[test]
    fn key_bits_renders_prefix() {
        assert_eq!(key_bits(1 << 62, 3), "100");
        assert_eq!(key_bits(0b101 << 60, 3), "101");
    }
}
