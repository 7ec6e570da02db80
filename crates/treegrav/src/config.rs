//! Run configuration.

use serde::Deserialize;

/// Parameters controlling partitioning, tree construction and the walk.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimConfig {
    /// Number of tree pieces the particle set is split into.
    pub num_pieces: usize,
    /// Number of worker groups the pieces are spread over; all pieces in
    /// a group share one scheduler thread and one remote-object cache.
    pub num_groups: usize,
    /// Maximum number of particles in a leaf. A leaf is only cut when it
    /// also lies strictly inside its piece's own key range.
    pub bucket_size: usize,
    /// Multipole opening angle; smaller accepts fewer nodes and is more
    /// accurate and slower.
    pub theta: f64,
    /// Tree levels shipped per remote node fetch: one reply carries up to
    /// `2^cache_line_depth - 1` nodes.
    pub cache_line_depth: u32,
    /// Buckets walked between cooperative yields back to the message
    /// queue.
    pub yield_period: usize,
    /// Route remote fetches through the per-group cache instead of
    /// point-to-point requests.
    pub cache_enabled: bool,
    pub verbosity: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            num_pieces: 8,
            num_groups: 1,
            bucket_size: 12,
            theta: 0.7,
            cache_line_depth: 4,
            yield_period: 16,
            cache_enabled: true,
            verbosity: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SimConfig::default();
        assert_eq!(cfg.bucket_size, 12);
        assert!(cfg.cache_enabled);
        assert!(cfg.theta > 0.0);
        assert!(cfg.num_groups <= cfg.num_pieces);
        assert!(cfg.yield_period >= 1);
    }
}
