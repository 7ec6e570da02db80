//! A tree piece: one worker's contiguous SFC range of particles, its
//! local tree, and the walks over it.
//!
//! A piece is single-threaded; every method here runs on the thread of
//! the worker group that owns the piece, and all outgoing traffic goes
//! through the [`Outbox`] filled by the handler. The piece's life cycle
//! per iteration is sort → splitter gather → local build → boundary
//! reconciliation → bucket walks → completion.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheManager, Lookup};
use crate::config::SimConfig;
use crate::error::{GravityError, Result};
use crate::kernel::{node_force, particle_force, OPENING_GEOMETRY_FACTOR};
use crate::moments::MultipoleMoments;
use crate::msg::{CacheNode, Outbox, PieceMsg, RemoteParticle, Report};
use crate::partition::node_ownership;
use crate::particle::{GravityParticle, WalkCounts};
use crate::sfc::{Key, FIRST_POSSIBLE_KEY, LAST_POSSIBLE_KEY};
use crate::space::{OrientedBox, Sphere};
use crate::tree::{NodeKind, NodeTable, TreeNode, NIL};

/// Self-reposts allowed for a boundary contribution whose node has not
/// been built yet. A partition that still misses the node after this many
/// cycles through the queue would never create it.
const BOUNDARY_RETRY_LIMIT: u32 = 1024;

/// One in-flight bucket walk: the accumulation target for every force the
/// walk picks up, held open by a pending-request count.
#[derive(Debug, Default)]
pub struct BucketRequest {
    /// Baseline of 1 for the walk itself, plus one per outstanding remote
    /// node fetch and one per outstanding remote particle.
    pub num_additional_requests: u32,
    pub begin_particle: usize,
    pub end_particle: usize,
    pub bounding_box: OrientedBox,
    pub accelerations: Vec<[f64; 3]>,
    pub potentials: Vec<f64>,
    pub counts: WalkCounts,
    pub done: bool,
}

/// Per-piece walk totals, kept for the statistics outputs and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct PieceStats {
    pub macs: u64,
    pub cell_interactions: u64,
    pub particle_interactions: u64,
    /// NonLocal branches taken across all walks, cached or not.
    pub nonlocal_traversals: u64,
    pub proxy_calls: u64,
}

pub struct TreePiece {
    pub index: usize,
    num_pieces: usize,
    config: SimConfig,
    /// Global bounding box all keys were generated in.
    bounding_box: OrientedBox,
    /// Owned particles at `1..=n`; slots 0 and n+1 are sentinels carrying
    /// the neighbouring splitter keys.
    pub(crate) particles: Vec<GravityParticle>,
    splitters: Arc<Vec<Key>>,
    pub(crate) nodes: Vec<TreeNode>,
    pub(crate) node_lookup: NodeTable,
    pub(crate) root: usize,
    pub(crate) bucket_list: Vec<usize>,
    bucket_reqs: Vec<BucketRequest>,
    boundary_nodes_pending: usize,
    current_bucket: usize,
    my_num_particles_pending: usize,
    started: bool,
    pub stats: PieceStats,
}

impl TreePiece {
    pub fn new(
        index: usize,
        num_pieces: usize,
        config: SimConfig,
        bounding_box: OrientedBox,
        owned: Vec<GravityParticle>,
    ) -> Self {
        let mut particles = Vec::with_capacity(owned.len() + 2);
        particles.push(GravityParticle::sentinel(FIRST_POSSIBLE_KEY));
        particles.extend(owned);
        particles.push(GravityParticle::sentinel(LAST_POSSIBLE_KEY));
        TreePiece {
            index,
            num_pieces,
            config,
            bounding_box,
            particles,
            splitters: Arc::new(Vec::new()),
            nodes: Vec::new(),
            node_lookup: NodeTable::new(),
            root: NIL,
            bucket_list: Vec::new(),
            bucket_reqs: Vec::new(),
            boundary_nodes_pending: 0,
            current_bucket: 0,
            my_num_particles_pending: 0,
            started: false,
            stats: PieceStats::default(),
        }
    }

    #[inline]
    pub fn num_particles(&self) -> usize {
        self.particles.len() - 2
    }

    pub fn num_buckets(&self) -> usize {
        self.bucket_list.len()
    }

    /// Owned particles without the sentinel slots.
    pub fn owned_particles(&self) -> &[GravityParticle] {
        &self.particles[1..self.particles.len() - 1]
    }

    /// The local arena, pruned husks included.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn root_node(&self) -> &TreeNode {
        &self.nodes[self.root]
    }

    /// Resolve a node by its lookup key, as remote requests do.
    pub fn node(&self, lookup_key: Key) -> Option<&TreeNode> {
        self.node_lookup.get(&lookup_key).map(|&idx| &self.nodes[idx])
    }

    // ----- sort and partition ---------------------------------------------

    /// Sort local particles by key and publish the bounds pair for the
    /// splitter all-gather.
    pub fn start_sort(&mut self, out: &mut Outbox) {
        let n = self.num_particles();
        self.particles[1..=n].sort_by_key(|p| p.key);
        out.report(Report::SplitterBounds {
            piece: self.index,
            min: self.particles[1].key,
            max: self.particles[n].key,
        });
    }

    // ----- local tree construction ----------------------------------------

    /// Install the final splitters and build the local tree. Boundary
    /// contributions stream out while the recursion runs; if none are
    /// pending afterwards the tree is immediately ready.
    pub fn build_local_tree(&mut self, splitters: Arc<Vec<Key>>, out: &mut Outbox) -> Result<()> {
        let n = self.num_particles();
        self.splitters = splitters;

        self.particles[0].key = if self.index == 0 {
            FIRST_POSSIBLE_KEY
        } else {
            self.splitters[2 * self.index - 1]
        };
        self.particles[n + 1].key = if self.index == self.num_pieces - 1 {
            LAST_POSSIBLE_KEY
        } else {
            self.splitters[2 * self.index + 2]
        };

        self.nodes.clear();
        self.node_lookup.clear();
        self.bucket_list.clear();
        self.boundary_nodes_pending = 0;

        let mut root = TreeNode::new(FIRST_POSSIBLE_KEY, 0, self.bounding_box);
        root.kind = NodeKind::Top;
        self.root = 0;
        self.node_lookup.insert(root.lookup_key(), 0);
        self.nodes.push(root);

        self.build_tree(0, 0, n + 1, out)?;

        debug!(
            piece = self.index,
            buckets = self.bucket_list.len(),
            pending = self.boundary_nodes_pending,
            "local tree built"
        );

        if self.boundary_nodes_pending == 0 {
            self.finish_tree(out);
        }
        Ok(())
    }

    fn create_child(&mut self, parent_idx: usize, right: bool) -> usize {
        let parent = &self.nodes[parent_idx];
        let (lower, upper) = parent.child_boxes();
        let (key, bbox) = if right {
            (parent.right_child_key(), upper)
        } else {
            (parent.key, lower)
        };
        let mut child = TreeNode::new(key, parent.level + 1, bbox);
        child.parent = parent_idx;
        let idx = self.nodes.len();
        self.node_lookup.insert(child.lookup_key(), idx);
        self.nodes.push(child);
        if right {
            self.nodes[parent_idx].right_child = idx;
        } else {
            self.nodes[parent_idx].left_child = idx;
        }
        idx
    }

    /// Create an edge child that lives entirely on a neighbouring piece
    /// and resolve its designated owner. A child whose range falls in the
    /// gap between pieces is owned by nobody and is pruned on the spot.
    fn create_nonlocal_child(&mut self, parent_idx: usize, right: bool) {
        let idx = self.create_child(parent_idx, right);
        self.nodes[idx].kind = NodeKind::NonLocal;
        let left_b = self.nodes[idx].left_boundary();
        let right_b = self.nodes[idx].right_boundary();
        match node_ownership(&self.splitters, left_b, right_b) {
            Some(own) => {
                self.nodes[idx].remote_index = own.designated as u64;
                self.nodes[idx].num_owners = own.num_owners as u32;
            }
            None => {
                warn!(
                    piece = self.index,
                    key = format_args!("{:#018x}", self.nodes[idx].lookup_key()),
                    "remote child falls between pieces; pruning"
                );
                self.node_lookup.remove(&self.nodes[idx].lookup_key());
                self.nodes[idx].kind = NodeKind::Invalid;
                if right {
                    self.nodes[parent_idx].right_child = NIL;
                } else {
                    self.nodes[parent_idx].left_child = NIL;
                }
            }
        }
    }

    /// Recursive SFC build over `particles[left..=right]`, where the
    /// endpoints may be the sentinel slots. Examines one key bit per
    /// level; a range short enough to bucket is only cut once both ends
    /// are strictly interior to the piece.
    fn build_tree(
        &mut self,
        node_idx: usize,
        left: usize,
        right: usize,
        out: &mut Outbox,
    ) -> Result<()> {
        let n = self.num_particles();
        let last_piece = self.index == self.num_pieces - 1;

        self.nodes[node_idx].begin_particle = if left == 0 { 1 } else { left };
        self.nodes[node_idx].end_particle = if right == n + 1 { right } else { right + 1 };

        if right - left < self.config.bucket_size && left != 0 && right != n + 1 {
            let mut moments = MultipoleMoments::zero();
            for p in &self.particles[left..=right] {
                moments.add_particle(p.position_f64(), p.mass as f64, p.soft as f64);
            }
            moments
                .set_radius_farthest_particle(self.particles[left..=right].iter().map(|p| p.position_f64()));
            let node = &mut self.nodes[node_idx];
            node.kind = NodeKind::Bucket;
            node.num_owners = 1;
            node.moments = moments;
            self.bucket_list.push(node_idx);
            return Ok(());
        } else if self.nodes[node_idx].level == 63 {
            return Err(GravityError::KeyBitsExhausted {
                piece: self.index,
                left,
                right,
            });
        }

        let level = self.nodes[node_idx].level;
        let mask: Key = 1u64 << (62 - level);
        let left_bit = self.particles[left].key & mask;
        let right_bit = self.particles[right].key & mask;

        if left_bit < right_bit {
            // A split at this level: first particle whose key has the bit
            // set.
            let split_key = self.nodes[node_idx].key | mask;
            let split = left
                + self.particles[left..=right].partition_point(|p| p.key < split_key);
            if split == 1 {
                // Left half holds only the left sentinel: that subtree is
                // remote.
                if self.index != 0 {
                    self.create_nonlocal_child(node_idx, false);
                }
                let child = self.create_child(node_idx, true);
                self.build_tree(child, split, right, out)?;
            } else if split == n + 1 {
                let child = self.create_child(node_idx, false);
                self.build_tree(child, left, split - 1, out)?;
                if !last_piece {
                    self.create_nonlocal_child(node_idx, true);
                }
            } else {
                let child = self.create_child(node_idx, false);
                self.build_tree(child, left, split - 1, out)?;
                let child = self.create_child(node_idx, true);
                self.build_tree(child, split, right, out)?;
            }
        } else if left_bit & right_bit != 0 {
            // Both ones: everything here lives in the right half.
            if left == 0 && self.index != 0 {
                self.create_nonlocal_child(node_idx, false);
            }
            let child = self.create_child(node_idx, true);
            self.build_tree(child, left, right, out)?;
        } else if left_bit > right_bit {
            return Err(GravityError::KeysNotOrdered { piece: self.index });
        } else {
            // Both zeros: everything here lives in the left half.
            let child = self.create_child(node_idx, false);
            self.build_tree(child, left, right, out)?;
            if right == n + 1 && !last_piece {
                self.create_nonlocal_child(node_idx, true);
            }
        }

        // Children are complete; collect their moments bottom-up.
        let (lc, rc) = (self.nodes[node_idx].left_child, self.nodes[node_idx].right_child);
        if lc != NIL {
            let m = self.nodes[lc].moments;
            self.nodes[node_idx].moments.add_moments(&m);
        }
        if rc != NIL {
            let m = self.nodes[rc].moments;
            self.nodes[node_idx].moments.add_moments(&m);
        }

        let touches_left = left == 0 && self.index != 0;
        let touches_right = right == n + 1 && !last_piece;
        if touches_left || touches_right {
            let node = &self.nodes[node_idx];
            let own = node_ownership(&self.splitters, node.left_boundary(), node.right_boundary())
                .ok_or(GravityError::NodeBetweenPieces {
                    left: node.left_boundary(),
                    right: node.right_boundary(),
                })?;
            let lookup_key = node.lookup_key();
            let local_count = node.local_count() as u64;
            let moments = node.moments;
            let node = &mut self.nodes[node_idx];
            node.num_owners = own.num_owners as u32;
            node.remote_index = local_count;
            node.kind = NodeKind::Boundary;
            self.boundary_nodes_pending += 1;
            if own.designated != self.index {
                out.send(
                    own.designated,
                    PieceMsg::AcceptBoundaryContribution {
                        lookup_key,
                        count: local_count,
                        moments,
                        retries: 0,
                    },
                );
            }
        } else {
            let node = &mut self.nodes[node_idx];
            node.num_owners = 1;
            node.kind = NodeKind::Internal;
            let bbox = node.bounding_box;
            node.moments.set_radius_farthest_corner(&bbox);
        }
        Ok(())
    }

    // ----- boundary reconciliation ----------------------------------------

    /// Co-owner contribution arriving at the designated owner. An unknown
    /// key means our own build has not reached that node yet; the message
    /// loops through the queue a bounded number of times before the run
    /// is declared broken.
    pub fn accept_boundary_contribution(
        &mut self,
        lookup_key: Key,
        count: u64,
        moments: MultipoleMoments,
        retries: u32,
        out: &mut Outbox,
    ) -> Result<()> {
        let Some(&idx) = self.node_lookup.get(&lookup_key) else {
            if retries >= BOUNDARY_RETRY_LIMIT {
                return Err(GravityError::BoundaryRetryExceeded {
                    piece: self.index,
                    lookup_key,
                });
            }
            out.send(
                self.index,
                PieceMsg::AcceptBoundaryContribution {
                    lookup_key,
                    count,
                    moments,
                    retries: retries + 1,
                },
            );
            return Ok(());
        };

        let node = &mut self.nodes[idx];
        node.remote_index += count;
        node.moments.add_moments(&moments);
        node.num_owners -= 1;
        if node.num_owners == 1 {
            // All co-owner contributions are in; finalize and broadcast.
            let bbox = node.bounding_box;
            node.moments.set_radius_farthest_corner(&bbox);
            let (left_b, right_b) = (node.left_boundary(), node.right_boundary());
            let own = node_ownership(&self.splitters, left_b, right_b).ok_or(
                GravityError::NodeBetweenPieces {
                    left: left_b,
                    right: right_b,
                },
            )?;
            let node = &mut self.nodes[idx];
            node.num_owners = own.num_owners as u32;
            let total = node.remote_index;
            let moments = node.moments;
            for owner in own.first_owner..=own.last_owner {
                out.send(
                    owner,
                    PieceMsg::AcceptBoundaryNode {
                        lookup_key,
                        count: total,
                        moments,
                    },
                );
            }
        }
        Ok(())
    }

    /// Reconciled totals from the designated owner.
    pub fn accept_boundary_node(
        &mut self,
        lookup_key: Key,
        count: u64,
        moments: MultipoleMoments,
        out: &mut Outbox,
    ) {
        let Some(&idx) = self.node_lookup.get(&lookup_key) else {
            warn!(
                piece = self.index,
                key = format_args!("{lookup_key:#018x}"),
                "boundary finalization for unknown node; dropping"
            );
            return;
        };
        let node = &mut self.nodes[idx];
        if node.kind != NodeKind::Boundary {
            warn!(
                piece = self.index,
                key = format_args!("{lookup_key:#018x}"),
                kind = ?node.kind,
                "boundary finalization for a non-boundary node"
            );
        }
        node.remote_index = count;
        node.moments = moments;
        self.boundary_nodes_pending -= 1;
        if self.boundary_nodes_pending == 0 {
            self.finish_tree(out);
        }
    }

    fn finish_tree(&mut self, out: &mut Outbox) {
        self.calculate_remote_moments(self.root);
        debug!(piece = self.index, "tree ready");
        out.report(Report::TreeReady { piece: self.index });
    }

    /// Fill in NonLocal moments as parent minus sibling, pruning any
    /// NonLocal subtree the reconciled counts prove empty. Only Boundary
    /// nodes can have NonLocal descendants, so the traversal follows them
    /// alone.
    fn calculate_remote_moments(&mut self, node_idx: usize) {
        match self.nodes[node_idx].kind {
            NodeKind::NonLocal => {
                let parent_idx = self.nodes[node_idx].parent;
                let parent = &self.nodes[parent_idx];
                let is_left = parent.left_child == node_idx;
                let sibling_idx = if is_left {
                    parent.right_child
                } else {
                    parent.left_child
                };
                let parent_total = parent.remote_index;
                let sibling = &self.nodes[sibling_idx];
                let sibling_count = if sibling.kind == NodeKind::Boundary {
                    sibling.remote_index
                } else {
                    sibling.local_count() as u64
                };
                let count = parent_total - sibling_count;
                self.nodes[node_idx].begin_particle = 0;
                self.nodes[node_idx].end_particle = count as usize;
                if count != 0 {
                    let mut moments = self.nodes[parent_idx].moments;
                    moments.sub_moments(&self.nodes[sibling_idx].moments);
                    let bbox = self.nodes[node_idx].bounding_box;
                    moments.set_radius_farthest_corner(&bbox);
                    self.nodes[node_idx].moments = moments;
                } else {
                    let key = self.nodes[node_idx].lookup_key();
                    self.node_lookup.remove(&key);
                    self.nodes[node_idx].kind = NodeKind::Invalid;
                    if is_left {
                        self.nodes[parent_idx].left_child = NIL;
                    } else {
                        self.nodes[parent_idx].right_child = NIL;
                    }
                }
            }
            NodeKind::Boundary => {
                let (lc, rc) = (self.nodes[node_idx].left_child, self.nodes[node_idx].right_child);
                if lc != NIL {
                    self.calculate_remote_moments(lc);
                }
                if rc != NIL {
                    self.calculate_remote_moments(rc);
                }
            }
            _ => {}
        }
    }

    // ----- gravity walk ----------------------------------------------------

    /// Start an iteration's bucket walks. Resets accumulators, syncs the
    /// shared cache and queues the first cooperative batch.
    pub fn start_gravity(&mut self, iteration: u64, cache: &mut CacheManager, out: &mut Outbox) {
        cache.sync(iteration);
        let n = self.num_particles();
        for p in &mut self.particles[1..=n] {
            p.tree_acceleration = [0.0; 3];
            p.potential = 0.0;
            p.counts.clear();
        }
        self.stats = PieceStats::default();
        self.bucket_reqs = Vec::new();
        self.bucket_reqs.resize_with(self.bucket_list.len(), BucketRequest::default);
        self.current_bucket = 0;
        self.my_num_particles_pending = n;
        self.started = true;
        if self.config.verbosity > 0 {
            debug!(
                piece = self.index,
                buckets = self.bucket_list.len(),
                iteration,
                "starting gravity"
            );
        }
        if self.bucket_list.is_empty() {
            self.started = false;
            out.report(Report::GravityDone { piece: self.index });
        } else {
            out.send(self.index, PieceMsg::NextBucket);
        }
    }

    /// Cooperative batch: walk up to `yield_period` buckets, then hand
    /// control back to the queue so cache replies and fill requests are
    /// serviced between batches.
    pub fn next_bucket(&mut self, cache: &mut CacheManager, out: &mut Outbox) {
        let mut walked = 0;
        while walked < self.config.yield_period && self.current_bucket < self.bucket_list.len() {
            self.start_next_bucket(cache, out);
            self.current_bucket += 1;
            walked += 1;
        }
        if self.current_bucket < self.bucket_list.len() {
            out.send(self.index, PieceMsg::NextBucket);
        }
    }

    fn start_next_bucket(&mut self, cache: &mut CacheManager, out: &mut Outbox) {
        let bucket = self.current_bucket;
        let node = &self.nodes[self.bucket_list[bucket]];
        let (begin, end) = (node.begin_particle, node.end_particle);
        let mut bbox = OrientedBox::empty();
        for p in &self.particles[begin..end] {
            bbox.grow(p.position_f64());
        }
        self.bucket_reqs[bucket] = BucketRequest {
            num_additional_requests: 1,
            begin_particle: begin,
            end_particle: end,
            bounding_box: bbox,
            accelerations: vec![[0.0; 3]; end - begin],
            potentials: vec![0.0; end - begin],
            counts: WalkCounts::default(),
            done: false,
        };
        self.walk_bucket_tree(self.root, bucket, cache, out);
        self.bucket_reqs[bucket].num_additional_requests -= 1;
        self.finish_bucket(bucket, out);
    }

    /// A node is accepted as a multipole iff its opening sphere misses the
    /// bucket's bounding box.
    #[inline]
    fn opened(&self, moments: &MultipoleMoments, bucket: usize) -> bool {
        let s = Sphere::new(
            moments.cm,
            OPENING_GEOMETRY_FACTOR * moments.radius / self.config.theta,
        );
        s.intersects(&self.bucket_reqs[bucket].bounding_box)
    }

    fn apply_cell(&mut self, moments: &MultipoleMoments, bucket: usize) {
        let req = &mut self.bucket_reqs[bucket];
        req.counts.cell_inter += 1;
        self.stats.cell_interactions += (req.end_particle - req.begin_particle) as u64;
        for (j, p) in self.particles[req.begin_particle..req.end_particle]
            .iter()
            .enumerate()
        {
            let (acc, pot) = node_force(moments, p.position_f64(), p.soft as f64);
            for k in 0..3 {
                req.accelerations[j][k] += acc[k];
            }
            req.potentials[j] += pot;
        }
    }

    /// Pairwise forces from local source particles `[src_begin, src_end)`
    /// onto the bucket. Self-interaction is excluded by index identity.
    fn apply_local_particles(&mut self, src_begin: usize, src_end: usize, bucket: usize) {
        let req = &mut self.bucket_reqs[bucket];
        req.counts.part_inter += (src_end - src_begin) as u32;
        self.stats.particle_interactions +=
            ((src_end - src_begin) * (req.end_particle - req.begin_particle)) as u64;
        for i in src_begin..src_end {
            let src = &self.particles[i];
            let (src_pos, src_mass, src_soft) =
                (src.position_f64(), src.mass as f64, src.soft as f64);
            for j in req.begin_particle..req.end_particle {
                if i == j {
                    continue;
                }
                let tgt = &self.particles[j];
                let (acc, pot) =
                    particle_force(src_pos, src_mass, src_soft, tgt.position_f64(), tgt.soft as f64);
                let slot = j - req.begin_particle;
                for k in 0..3 {
                    req.accelerations[slot][k] += acc[k];
                }
                req.potentials[slot] += pot;
            }
        }
    }

    fn apply_remote_particles(&mut self, parts: &[RemoteParticle], bucket: usize) {
        let req = &mut self.bucket_reqs[bucket];
        req.counts.part_inter += parts.len() as u32;
        self.stats.particle_interactions +=
            (parts.len() * (req.end_particle - req.begin_particle)) as u64;
        for src in parts {
            let src_pos = [
                src.position[0] as f64,
                src.position[1] as f64,
                src.position[2] as f64,
            ];
            for (j, tgt) in self.particles[req.begin_particle..req.end_particle]
                .iter()
                .enumerate()
            {
                let (acc, pot) = particle_force(
                    src_pos,
                    src.mass as f64,
                    src.soft as f64,
                    tgt.position_f64(),
                    tgt.soft as f64,
                );
                for k in 0..3 {
                    req.accelerations[j][k] += acc[k];
                }
                req.potentials[j] += pot;
            }
        }
    }

    /// Fetch a remote subtree, inline on a cache hit or by registering a
    /// pending request. Returns the node when the walk can continue now.
    fn request_node(
        &mut self,
        owner: usize,
        lookup_key: Key,
        bucket: usize,
        cache: &mut CacheManager,
        out: &mut Outbox,
    ) -> Option<CacheNode> {
        self.stats.nonlocal_traversals += 1;
        if self.config.cache_enabled {
            match cache.request_node(owner, lookup_key, (self.index, bucket)) {
                Lookup::Hit(node) => Some(node),
                Lookup::Miss { already_requested } => {
                    self.bucket_reqs[bucket].num_additional_requests += 1;
                    self.bucket_reqs[bucket].counts.entry_calls += 1;
                    if !already_requested {
                        self.stats.proxy_calls += 1;
                        out.send(
                            owner,
                            PieceMsg::FillRequestNode {
                                requester: self.index,
                                lookup_key,
                                bucket,
                            },
                        );
                    }
                    None
                }
            }
        } else {
            self.bucket_reqs[bucket].num_additional_requests += 1;
            self.bucket_reqs[bucket].counts.entry_calls += 1;
            self.stats.proxy_calls += 1;
            out.send(
                owner,
                PieceMsg::FillRequestNode {
                    requester: self.index,
                    lookup_key,
                    bucket,
                },
            );
            None
        }
    }

    /// Walk the local tree for one bucket, descending wherever the
    /// opening criterion rejects the multipole.
    fn walk_bucket_tree(
        &mut self,
        node_idx: usize,
        bucket: usize,
        cache: &mut CacheManager,
        out: &mut Outbox,
    ) {
        self.bucket_reqs[bucket].counts.macs += 1;
        self.stats.macs += 1;
        let node = &self.nodes[node_idx];
        let kind = node.kind;
        let moments = node.moments;
        let (src_begin, src_end) = (node.begin_particle, node.end_particle);
        let (lc, rc) = (node.left_child, node.right_child);
        let remote = node.remote_index as usize;
        let lookup_key = node.lookup_key();

        if !self.opened(&moments, bucket) {
            self.apply_cell(&moments, bucket);
        } else if kind == NodeKind::Bucket {
            self.apply_local_particles(src_begin, src_end, bucket);
        } else if kind == NodeKind::NonLocal {
            if let Some(node) = self.request_node(remote, lookup_key, bucket, cache, out) {
                self.cached_walk_bucket_tree(&node, bucket, cache, out);
            }
        } else {
            if lc != NIL {
                self.walk_bucket_tree(lc, bucket, cache, out);
            }
            if rc != NIL {
                self.walk_bucket_tree(rc, bucket, cache, out);
            }
        }
    }

    /// Continuation of a walk inside another piece's subtree. Differs from
    /// the on-tree walk in that Empty placeholders are skipped, children
    /// of a cached interior node are reached through fresh cache fetches
    /// by lookup key, and remote bucket particles are fetched in bulk.
    fn cached_walk_bucket_tree(
        &mut self,
        node: &CacheNode,
        bucket: usize,
        cache: &mut CacheManager,
        out: &mut Outbox,
    ) {
        if node.kind == NodeKind::Empty {
            return;
        }
        debug_assert!(node.kind != NodeKind::Invalid);
        self.bucket_reqs[bucket].counts.macs += 1;
        self.stats.macs += 1;

        if !self.opened(&node.moments, bucket) {
            self.apply_cell(&node.moments, bucket);
            return;
        }
        match node.kind {
            NodeKind::Bucket => {
                let owner = node.remote_index as usize;
                let bucket_key = node.lookup_key();
                let count = node.end_particle - node.begin_particle;
                if self.config.cache_enabled {
                    match cache.request_particles(owner, bucket_key, (self.index, bucket)) {
                        Lookup::Hit(parts) => self.apply_remote_particles(&parts, bucket),
                        Lookup::Miss { already_requested } => {
                            self.bucket_reqs[bucket].num_additional_requests += count;
                            self.bucket_reqs[bucket].counts.entry_calls += 1;
                            if !already_requested {
                                self.stats.proxy_calls += 1;
                                out.send(
                                    owner,
                                    PieceMsg::FillRequestParticles {
                                        requester: self.index,
                                        bucket_key,
                                        begin: node.begin_particle,
                                        end: node.end_particle,
                                        bucket,
                                    },
                                );
                            }
                        }
                    }
                } else {
                    self.bucket_reqs[bucket].num_additional_requests += count;
                    self.bucket_reqs[bucket].counts.entry_calls += 1;
                    self.stats.proxy_calls += 1;
                    out.send(
                        owner,
                        PieceMsg::FillRequestParticles {
                            requester: self.index,
                            bucket_key,
                            begin: node.begin_particle,
                            end: node.end_particle,
                            bucket,
                        },
                    );
                }
            }
            NodeKind::NonLocal => {
                let owner = node.remote_index as usize;
                let key = node.lookup_key();
                if let Some(next) = self.request_node(owner, key, bucket, cache, out) {
                    self.cached_walk_bucket_tree(&next, bucket, cache, out);
                }
            }
            _ => {
                // Cached interior node: children are not linked in the
                // copy, fetch them by their computed lookup keys.
                let owner = node.remote_index as usize;
                for key in [node.left_child_lookup_key(), node.right_child_lookup_key()] {
                    if let Some(child) = self.request_node(owner, key, bucket, cache, out) {
                        self.cached_walk_bucket_tree(&child, bucket, cache, out);
                    }
                }
            }
        }
    }

    // ----- remote deliveries ----------------------------------------------

    /// A fetched subtree root arrives; resume the parked walk.
    pub fn receive_node(
        &mut self,
        node: CacheNode,
        bucket: usize,
        cache: &mut CacheManager,
        out: &mut Outbox,
    ) {
        if bucket >= self.bucket_reqs.len() || self.bucket_reqs[bucket].done {
            warn!(piece = self.index, bucket, "node delivery for unknown bucket; dropping");
            return;
        }
        self.bucket_reqs[bucket].num_additional_requests -= 1;
        if node.kind != NodeKind::Empty {
            self.cached_walk_bucket_tree(&node, bucket, cache, out);
        }
        self.finish_bucket(bucket, out);
    }

    /// A fetched bucket particle array arrives; apply it and settle the
    /// per-particle accounting.
    pub fn receive_particles(
        &mut self,
        parts: &[RemoteParticle],
        bucket: usize,
        out: &mut Outbox,
    ) {
        if bucket >= self.bucket_reqs.len() || self.bucket_reqs[bucket].done {
            warn!(piece = self.index, bucket, "particle delivery for unknown bucket; dropping");
            return;
        }
        self.bucket_reqs[bucket].num_additional_requests -= parts.len() as u32;
        self.apply_remote_particles(parts, bucket);
        self.finish_bucket(bucket, out);
    }

    /// Serve a remote subtree request: a prefix chunk through the cache
    /// path, a single node copy point-to-point.
    pub fn fill_request_node(
        &mut self,
        requester: usize,
        lookup_key: Key,
        bucket: usize,
        out: &mut Outbox,
    ) {
        if self.config.cache_enabled {
            let mut entries = Vec::new();
            let node_idx = self.node_lookup.get(&lookup_key).copied();
            self.prefix_copy_node(lookup_key, node_idx, 0, &mut entries);
            out.envelopes.push(crate::msg::Envelope::CacheNodes {
                requester,
                owner: self.index,
                entries,
            });
        } else {
            let node = match self.node_lookup.get(&lookup_key) {
                Some(&idx) => CacheNode::from_node(&self.nodes[idx], self.index),
                None => CacheNode::empty(lookup_key),
            };
            out.send(requester, PieceMsg::ReceiveNode { node, bucket });
        }
    }

    /// Pre-order copy of the subtree under `lookup_key`, cut at the cache
    /// line depth; missing children are encoded as Empty placeholders.
    fn prefix_copy_node(
        &self,
        lookup_key: Key,
        node_idx: Option<usize>,
        depth: u32,
        out: &mut Vec<(Key, CacheNode)>,
    ) {
        if depth >= self.config.cache_line_depth {
            return;
        }
        let Some(idx) = node_idx else {
            out.push((lookup_key, CacheNode::empty(lookup_key)));
            return;
        };
        let node = &self.nodes[idx];
        debug_assert_eq!(lookup_key, node.lookup_key());
        out.push((lookup_key, CacheNode::from_node(node, self.index)));
        let left_key = node.left_child_lookup_key();
        let right_key = node.right_child_lookup_key();
        self.prefix_copy_node(left_key, self.node_lookup.get(&left_key).copied(), depth + 1, out);
        self.prefix_copy_node(right_key, self.node_lookup.get(&right_key).copied(), depth + 1, out);
    }

    /// Serve a remote bucket-particle request.
    pub fn fill_request_particles(
        &mut self,
        requester: usize,
        bucket_key: Key,
        begin: u32,
        end: u32,
        bucket: usize,
        out: &mut Outbox,
    ) {
        let parts: Arc<[RemoteParticle]> = self.particles[begin as usize..end as usize]
            .iter()
            .map(|p| RemoteParticle {
                position: p.position,
                mass: p.mass,
                soft: p.soft,
            })
            .collect();
        if self.config.cache_enabled {
            out.envelopes.push(crate::msg::Envelope::CacheParticles {
                requester,
                owner: self.index,
                bucket_key,
                particles: parts,
            });
        } else {
            out.send(requester, PieceMsg::ReceiveParticles { particles: parts, bucket });
        }
    }

    // ----- completion ------------------------------------------------------

    /// Fold a finished bucket's accumulators into its particles; the last
    /// bucket to finish reports the piece done.
    fn finish_bucket(&mut self, bucket: usize, out: &mut Outbox) {
        let req = &mut self.bucket_reqs[bucket];
        if req.done || req.num_additional_requests != 0 {
            return;
        }
        req.done = true;
        let counts = req.counts;
        for (j, i) in (req.begin_particle..req.end_particle).enumerate() {
            let p = &mut self.particles[i];
            for k in 0..3 {
                p.tree_acceleration[k] += req.accelerations[j][k];
            }
            p.potential += req.potentials[j];
            p.counts.add(&counts);
        }
        self.my_num_particles_pending -= req.end_particle - req.begin_particle;
        if self.started && self.my_num_particles_pending == 0 {
            self.started = false;
            debug!(
                piece = self.index,
                proxy_calls = self.stats.proxy_calls,
                "all buckets finished"
            );
            out.report(Report::GravityDone { piece: self.index });
        }
    }
}
