//! Inter-piece messages and the wire forms of remotely shipped objects.
//!
//! The runtime guarantees FIFO delivery per sender and nothing across
//! senders; every handler runs on the single thread that owns the target
//! piece, so none of these types carry any synchronization.

use std::sync::Arc;

use crate::moments::MultipoleMoments;
use crate::sfc::Key;
use crate::tree::{lookup_key, NodeKind, TreeNode};

/// Flat copy of a tree node as shipped between pieces and held in the
/// remote cache. Child links are not copied; a consumer reaches children
/// through their computed lookup keys.
#[derive(Clone, Copy, Debug)]
pub struct CacheNode {
    pub kind: NodeKind,
    pub key: Key,
    pub level: u8,
    pub moments: MultipoleMoments,
    /// Owner-local particle range for Bucket nodes.
    pub begin_particle: u32,
    pub end_particle: u32,
    /// Piece holding this subtree: the sender itself for local kinds, the
    /// designated owner for NonLocal ones.
    pub remote_index: u64,
}

impl CacheNode {
    pub fn empty(key: Key) -> Self {
        CacheNode {
            kind: NodeKind::Empty,
            key,
            level: 0,
            moments: MultipoleMoments::zero(),
            begin_particle: 0,
            end_particle: 0,
            remote_index: 0,
        }
    }

    /// Copy a node for shipping from `sender`.
    pub fn from_node(node: &TreeNode, sender: usize) -> Self {
        let remote_index = match node.kind {
            NodeKind::Boundary | NodeKind::Internal | NodeKind::Bucket => sender as u64,
            _ => node.remote_index,
        };
        CacheNode {
            kind: node.kind,
            key: node.key,
            level: node.level,
            moments: node.moments,
            begin_particle: node.begin_particle as u32,
            end_particle: node.end_particle as u32,
            remote_index,
        }
    }

    #[inline]
    pub fn lookup_key(&self) -> Key {
        lookup_key(self.key, self.level)
    }

    #[inline]
    pub fn left_child_lookup_key(&self) -> Key {
        lookup_key(self.key, self.level + 1)
    }

    #[inline]
    pub fn right_child_lookup_key(&self) -> Key {
        lookup_key(self.key | (1u64 << (62 - self.level)), self.level + 1)
    }
}

/// Particle fields needed to evaluate a remote pairwise interaction.
#[derive(Clone, Copy, Debug)]
pub struct RemoteParticle {
    pub position: [f32; 3],
    pub mass: f32,
    pub soft: f32,
}

/// Messages addressed to a single piece.
#[derive(Debug)]
pub enum PieceMsg {
    /// Sort local particles and report key bounds for the all-gather.
    StartSort,
    /// Splitters are final; install sentinels and build the local tree.
    BuildLocalTree { splitters: Arc<Vec<Key>> },
    /// Co-owner partial state for a boundary node, sent to the designated
    /// owner. `retries` counts self-reposts for not-yet-built keys.
    AcceptBoundaryContribution {
        lookup_key: Key,
        count: u64,
        moments: MultipoleMoments,
        retries: u32,
    },
    /// Reconciled totals, broadcast by the designated owner to all
    /// co-owners including itself.
    AcceptBoundaryNode {
        lookup_key: Key,
        count: u64,
        moments: MultipoleMoments,
    },
    /// Begin the bucket walks for this iteration.
    StartGravity { iteration: u64 },
    /// Cooperative-scheduling self-message: run the next batch of buckets.
    NextBucket,
    /// A remote piece asks for a subtree rooted at `lookup_key`.
    FillRequestNode {
        requester: usize,
        lookup_key: Key,
        /// Requester's bucket, echoed on the point-to-point reply path;
        /// unused when the reply goes through the cache.
        bucket: usize,
    },
    /// Point-to-point subtree reply (cache disabled).
    ReceiveNode { node: CacheNode, bucket: usize },
    /// A remote piece asks for the particles of one of our buckets.
    FillRequestParticles {
        requester: usize,
        bucket_key: Key,
        begin: u32,
        end: u32,
        bucket: usize,
    },
    /// Point-to-point particle reply (cache disabled).
    ReceiveParticles {
        particles: Arc<[RemoteParticle]>,
        bucket: usize,
    },
}

/// Everything routed between worker groups.
#[derive(Debug)]
pub enum Envelope {
    Piece(usize, PieceMsg),
    /// Prefix subtree chunk for the cache co-located with `requester`.
    CacheNodes {
        requester: usize,
        owner: usize,
        entries: Vec<(Key, CacheNode)>,
    },
    /// Bucket particle array for the cache co-located with `requester`.
    CacheParticles {
        requester: usize,
        owner: usize,
        bucket_key: Key,
        particles: Arc<[RemoteParticle]>,
    },
    Shutdown,
}

/// Progress reports from pieces to the driver, which runs the barriers.
#[derive(Debug)]
pub enum Report {
    SplitterBounds { piece: usize, min: Key, max: Key },
    TreeReady { piece: usize },
    GravityDone { piece: usize },
    Fatal(crate::error::GravityError),
}

/// Buffer a handler fills with everything it wants sent; the owning group
/// loop drains it through the router after the handler returns.
#[derive(Debug, Default)]
pub struct Outbox {
    pub envelopes: Vec<Envelope>,
    pub reports: Vec<Report>,
}

impl Outbox {
    pub fn send(&mut self, piece: usize, msg: PieceMsg) {
        self.envelopes.push(Envelope::Piece(piece, msg));
    }

    pub fn report(&mut self, report: Report) {
        self.reports.push(report);
    }
}
