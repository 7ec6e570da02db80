//! Splitter assembly and the ownership oracle.
//!
//! After local sort every piece publishes its `(min_key, max_key)` pair;
//! the concatenated pairs, sorted, form the global splitter array. Piece
//! `i` owns the closed key range `[splitters[2i], splitters[2i+1]]`. The
//! oracle below is the sole arbiter of which pieces own a key prefix; it
//! is a pure function of the splitter array, so every co-owner computes
//! identical answers.

use crate::error::{GravityError, Result};
use crate::sfc::Key;

/// Owner set of a node's key prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ownership {
    pub first_owner: usize,
    pub last_owner: usize,
    /// The middle co-owner, which aggregates boundary contributions.
    pub designated: usize,
    pub num_owners: usize,
}

/// Build the global splitter array from per-piece `(min, max)` bounds.
///
/// Pairs are sorted as units by their first key, preserving the min/max
/// pairing; the flattened result must be non-decreasing or the input
/// partition is broken and the run aborts.
pub fn assemble_splitters(bounds: &[(Key, Key)]) -> Result<Vec<Key>> {
    let mut pairs: Vec<(Key, Key)> = bounds.to_vec();
    pairs.sort_by_key(|p| p.0);
    let mut splitters = Vec::with_capacity(2 * pairs.len());
    for (lo, hi) in pairs {
        splitters.push(lo);
        splitters.push(hi);
    }
    if splitters.windows(2).any(|w| w[0] > w[1]) {
        return Err(GravityError::SplittersNotMonotone);
    }
    Ok(splitters)
}

#[inline]
fn upper_bound(a: &[Key], x: Key) -> usize {
    a.partition_point(|&k| k <= x)
}

#[inline]
fn lower_bound_from(a: &[Key], from: usize, x: Key) -> usize {
    from + a[from..].partition_point(|&k| k < x)
}

/// Resolve the owners of the key prefix `[left, right)`.
///
/// Returns `None` when the prefix falls entirely in the gap between two
/// pieces and is owned by nobody; build-time callers prune the node.
pub fn node_ownership(splitters: &[Key], left: Key, right: Key) -> Option<Ownership> {
    let loc_left = upper_bound(splitters, left);
    let loc_right = lower_bound_from(splitters, loc_left, right);
    if loc_left == loc_right {
        if loc_left % 2 == 1 {
            // Strictly inside one piece's range.
            let owner = loc_left / 2;
            Some(Ownership {
                first_owner: owner,
                last_owner: owner,
                designated: owner,
                num_owners: 1,
            })
        } else {
            None
        }
    } else {
        let first = loc_left / 2;
        let last = (loc_right - 1) / 2;
        Some(Ownership {
            first_owner: first,
            last_owner: last,
            designated: (first + last) / 2,
            num_owners: last - first + 1,
        })
    }
}
