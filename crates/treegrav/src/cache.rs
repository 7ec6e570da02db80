//! Remote object cache shared by the pieces co-located in one worker
//! group.
//!
//! The cache holds subtree chunks and bucket particle arrays fetched from
//! other pieces, keyed by `(owner, lookup_key)` and `(owner, bucket_key)`.
//! A miss issues at most one request per key no matter how many walks
//! need it; every caller is parked on the entry's waiter list and resumed
//! when the reply lands. Entries live for one gravity iteration and are
//! dropped at the next `sync`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::msg::{CacheNode, RemoteParticle};
use crate::sfc::Key;

/// A walk parked on a pending fetch: (piece, bucket).
pub type Waiter = (usize, usize);

struct NodeEntry {
    node: Option<CacheNode>,
    waiters: Vec<Waiter>,
}

struct ParticleEntry {
    particles: Option<Arc<[RemoteParticle]>>,
    waiters: Vec<Waiter>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub node_hits: u64,
    pub node_misses: u64,
    /// Distinct `(owner, key)` node records inserted this iteration.
    pub node_inserts: u64,
    pub particle_hits: u64,
    pub particle_misses: u64,
}

/// Outcome of a lookup: either the object, or a registered wait. On a
/// miss, `already_requested` tells the caller whether an earlier waiter
/// has the fetch in flight or this miss must put one on the wire.
pub enum Lookup<T> {
    Hit(T),
    Miss { already_requested: bool },
}

#[derive(Default)]
pub struct CacheManager {
    iteration: u64,
    nodes: HashMap<(usize, Key), NodeEntry>,
    particles: HashMap<(usize, Key), ParticleEntry>,
    pub stats: CacheStats,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start iteration `iteration`: drop the previous iteration's entries.
    /// Idempotent, so every co-located piece may call it.
    pub fn sync(&mut self, iteration: u64) {
        if iteration != self.iteration {
            self.iteration = iteration;
            self.nodes.clear();
            self.particles.clear();
            self.stats = CacheStats::default();
        }
    }

    /// Look up a remote node, parking `waiter` if it is not resident yet.
    pub fn request_node(
        &mut self,
        owner: usize,
        lookup_key: Key,
        waiter: Waiter,
    ) -> Lookup<CacheNode> {
        match self.nodes.entry((owner, lookup_key)) {
            Entry::Occupied(mut e) => match e.get().node {
                Some(node) => {
                    self.stats.node_hits += 1;
                    Lookup::Hit(node)
                }
                None => {
                    self.stats.node_misses += 1;
                    e.get_mut().waiters.push(waiter);
                    Lookup::Miss {
                        already_requested: true,
                    }
                }
            },
            Entry::Vacant(e) => {
                self.stats.node_misses += 1;
                e.insert(NodeEntry {
                    node: None,
                    waiters: vec![waiter],
                });
                Lookup::Miss {
                    already_requested: false,
                }
            }
        }
    }

    /// Ingest a prefix chunk from `owner`. Returns the parked walks to
    /// resume, paired with the node each was waiting for.
    pub fn recv_nodes(
        &mut self,
        owner: usize,
        entries: Vec<(Key, CacheNode)>,
    ) -> Vec<(Waiter, CacheNode)> {
        let mut resumed = Vec::new();
        for (key, node) in entries {
            match self.nodes.entry((owner, key)) {
                Entry::Occupied(mut e) => {
                    let slot = e.get_mut();
                    if slot.node.is_none() {
                        self.stats.node_inserts += 1;
                        slot.node = Some(node);
                        for w in slot.waiters.drain(..) {
                            resumed.push((w, node));
                        }
                    }
                }
                Entry::Vacant(e) => {
                    // Prefetched record nobody asked for yet.
                    self.stats.node_inserts += 1;
                    e.insert(NodeEntry {
                        node: Some(node),
                        waiters: Vec::new(),
                    });
                }
            }
        }
        resumed
    }

    /// Look up a remote bucket's particles.
    pub fn request_particles(
        &mut self,
        owner: usize,
        bucket_key: Key,
        waiter: Waiter,
    ) -> Lookup<Arc<[RemoteParticle]>> {
        match self.particles.entry((owner, bucket_key)) {
            Entry::Occupied(mut e) => match &e.get().particles {
                Some(p) => {
                    self.stats.particle_hits += 1;
                    Lookup::Hit(Arc::clone(p))
                }
                None => {
                    self.stats.particle_misses += 1;
                    e.get_mut().waiters.push(waiter);
                    Lookup::Miss {
                        already_requested: true,
                    }
                }
            },
            Entry::Vacant(e) => {
                self.stats.particle_misses += 1;
                e.insert(ParticleEntry {
                    particles: None,
                    waiters: vec![waiter],
                });
                Lookup::Miss {
                    already_requested: false,
                }
            }
        }
    }

    /// Ingest a particle array, resuming the parked walks.
    pub fn recv_particles(
        &mut self,
        owner: usize,
        bucket_key: Key,
        particles: Arc<[RemoteParticle]>,
    ) -> Vec<(Waiter, Arc<[RemoteParticle]>)> {
        let mut resumed = Vec::new();
        match self.particles.entry((owner, bucket_key)) {
            Entry::Occupied(mut e) => {
                let slot = e.get_mut();
                if slot.particles.is_none() {
                    slot.particles = Some(Arc::clone(&particles));
                    for w in slot.waiters.drain(..) {
                        resumed.push((w, Arc::clone(&particles)));
                    }
                }
            }
            Entry::Vacant(e) => {
                e.insert(ParticleEntry {
                    particles: Some(particles),
                    waiters: Vec::new(),
                });
            }
        }
        resumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::CacheNode;

    #[test]
    fn second_miss_piggybacks_on_the_first() {
        let mut cache = CacheManager::new();
        cache.sync(1);
        let k = 1u64 << 62;
        assert!(matches!(
            cache.request_node(1, k, (0, 0)),
            Lookup::Miss {
                already_requested: false
            }
        ));
        assert!(matches!(
            cache.request_node(1, k, (0, 1)),
            Lookup::Miss {
                already_requested: true
            }
        ));
        let resumed = cache.recv_nodes(1, vec![(k, CacheNode::empty(k))]);
        assert_eq!(resumed.len(), 2);
        assert!(matches!(cache.request_node(1, k, (0, 2)), Lookup::Hit(_)));
        assert_eq!(cache.stats.node_inserts, 1);
        assert_eq!(cache.stats.node_misses, 2);
        assert_eq!(cache.stats.node_hits, 1);
    }

    #[test]
    fn prefetched_records_hit_without_a_request() {
        let mut cache = CacheManager::new();
        cache.sync(1);
        let k = 1u64 << 61;
        cache.recv_nodes(2, vec![(k, CacheNode::empty(k))]);
        assert!(matches!(cache.request_node(2, k, (0, 0)), Lookup::Hit(_)));
        assert_eq!(cache.stats.node_inserts, 1);
    }

    #[test]
    fn sync_drops_the_previous_iteration() {
        let mut cache = CacheManager::new();
        cache.sync(1);
        let k = 1u64 << 62;
        cache.recv_nodes(1, vec![(k, CacheNode::empty(k))]);
        cache.sync(2);
        assert!(matches!(
            cache.request_node(1, k, (0, 0)),
            Lookup::Miss { .. }
        ));
        // Same iteration number again must not clear pending state.
        cache.sync(2);
        assert!(matches!(
            cache.request_node(1, k, (0, 1)),
            Lookup::Miss {
                already_requested: true
            }
        ));
    }
}
