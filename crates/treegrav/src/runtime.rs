//! The worker runtime: pieces spread over worker-group threads, a router
//! of FIFO channels between them, and the driver that runs the barriers.
//!
//! Each group thread owns a contiguous block of pieces and one shared
//! [`CacheManager`], and drains a single message queue; handlers never
//! block mid-message, so a piece only suspends at message boundaries.
//! The driver performs the splitter all-gather and waits on the
//! tree-ready and gravity barriers, mirroring the reduction flow of the
//! message-driven original.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::cache::{CacheManager, CacheStats};
use crate::config::SimConfig;
use crate::error::{GravityError, Result};
use crate::msg::{Envelope, Outbox, PieceMsg, Report};
use crate::partition::assemble_splitters;
use crate::particle::GravityParticle;
use crate::piece::TreePiece;
use crate::sfc::{generate_key, Key};
use crate::space::OrientedBox;

/// Group that runs piece `piece`; pieces are dealt to groups in
/// contiguous blocks.
pub fn group_of(piece: usize, num_pieces: usize, num_groups: usize) -> usize {
    piece * num_groups / num_pieces
}

/// Cloneable handle for addressing envelopes to the owning group.
#[derive(Clone)]
pub struct Router {
    senders: Vec<Sender<Envelope>>,
    group_of: Arc<Vec<usize>>,
}

impl Router {
    /// Deliver an envelope to the group that must process it. Sends to a
    /// group that already exited are dropped; the driver learns about
    /// failures through the report channel.
    pub fn route(&self, env: Envelope) {
        let group = match &env {
            Envelope::Piece(piece, _) => self.group_of[*piece],
            Envelope::CacheNodes { requester, .. } => self.group_of[*requester],
            Envelope::CacheParticles { requester, .. } => self.group_of[*requester],
            Envelope::Shutdown => return,
        };
        let _ = self.senders[group].send(env);
    }
}

struct WorkerGroup {
    group: usize,
    pieces: Vec<TreePiece>,
    /// Global piece index -> slot in `pieces`.
    slots: HashMap<usize, usize>,
    cache: CacheManager,
    rx: Receiver<Envelope>,
    router: Router,
    report_tx: Sender<Report>,
}

struct WorkerResult {
    group: usize,
    pieces: Vec<TreePiece>,
    cache_stats: CacheStats,
}

impl WorkerGroup {
    fn run(mut self) -> WorkerResult {
        let mut out = Outbox::default();
        while let Ok(env) = self.rx.recv() {
            if matches!(env, Envelope::Shutdown) {
                break;
            }
            if let Err(e) = self.handle(env, &mut out) {
                let _ = self.report_tx.send(Report::Fatal(e));
                break;
            }
            for env in out.envelopes.drain(..) {
                self.router.route(env);
            }
            for report in out.reports.drain(..) {
                let _ = self.report_tx.send(report);
            }
        }
        debug!(group = self.group, "worker group exiting");
        WorkerResult {
            group: self.group,
            pieces: self.pieces,
            cache_stats: self.cache.stats,
        }
    }

    fn handle(&mut self, env: Envelope, out: &mut Outbox) -> Result<()> {
        match env {
            Envelope::Piece(piece, msg) => {
                let slot = self.slots[&piece];
                self.handle_piece_msg(slot, msg, out)
            }
            Envelope::CacheNodes { owner, entries, .. } => {
                for ((piece, bucket), node) in self.cache.recv_nodes(owner, entries) {
                    let slot = self.slots[&piece];
                    self.pieces[slot].receive_node(node, bucket, &mut self.cache, out);
                }
                Ok(())
            }
            Envelope::CacheParticles {
                owner,
                bucket_key,
                particles,
                ..
            } => {
                for ((piece, bucket), parts) in
                    self.cache.recv_particles(owner, bucket_key, particles)
                {
                    let slot = self.slots[&piece];
                    self.pieces[slot].receive_particles(&parts, bucket, out);
                }
                Ok(())
            }
            Envelope::Shutdown => Ok(()),
        }
    }

    fn handle_piece_msg(&mut self, slot: usize, msg: PieceMsg, out: &mut Outbox) -> Result<()> {
        let piece = &mut self.pieces[slot];
        match msg {
            PieceMsg::StartSort => {
                piece.start_sort(out);
                Ok(())
            }
            PieceMsg::BuildLocalTree { splitters } => piece.build_local_tree(splitters, out),
            PieceMsg::AcceptBoundaryContribution {
                lookup_key,
                count,
                moments,
                retries,
            } => piece.accept_boundary_contribution(lookup_key, count, moments, retries, out),
            PieceMsg::AcceptBoundaryNode {
                lookup_key,
                count,
                moments,
            } => {
                piece.accept_boundary_node(lookup_key, count, moments, out);
                Ok(())
            }
            PieceMsg::StartGravity { iteration } => {
                piece.start_gravity(iteration, &mut self.cache, out);
                Ok(())
            }
            PieceMsg::NextBucket => {
                piece.next_bucket(&mut self.cache, out);
                Ok(())
            }
            PieceMsg::FillRequestNode {
                requester,
                lookup_key,
                bucket,
            } => {
                piece.fill_request_node(requester, lookup_key, bucket, out);
                Ok(())
            }
            PieceMsg::ReceiveNode { node, bucket } => {
                piece.receive_node(node, bucket, &mut self.cache, out);
                Ok(())
            }
            PieceMsg::FillRequestParticles {
                requester,
                bucket_key,
                begin,
                end,
                bucket,
            } => {
                piece.fill_request_particles(requester, bucket_key, begin, end, bucket, out);
                Ok(())
            }
            PieceMsg::ReceiveParticles { particles, bucket } => {
                piece.receive_particles(&particles, bucket, out);
                Ok(())
            }
        }
    }
}

/// Final state handed back by [`Simulation::finish`].
pub struct SimulationOutput {
    /// All pieces in index order, with their particles and local trees.
    pub pieces: Vec<TreePiece>,
    /// Cache statistics per worker group.
    pub cache_stats: Vec<CacheStats>,
}

/// Driver for a set of pieces across worker groups.
pub struct Simulation {
    config: SimConfig,
    router: Router,
    report_rx: Receiver<Report>,
    handles: Vec<Option<JoinHandle<WorkerResult>>>,
    iteration: u64,
    built: bool,
}

impl Simulation {
    /// Create the worker groups and hand each piece its particle block.
    /// Keys are generated here from the global bounding box, so callers
    /// provide positions only.
    pub fn new(
        mut config: SimConfig,
        bounding_box: OrientedBox,
        mut per_piece: Vec<Vec<GravityParticle>>,
    ) -> Result<Self> {
        // A fetch reply must carry at least the requested node.
        config.cache_line_depth = config.cache_line_depth.max(1);
        let num_pieces = config.num_pieces;
        assert_eq!(per_piece.len(), num_pieces, "one particle block per piece");
        assert!(
            per_piece.iter().all(|b| !b.is_empty()),
            "every piece needs at least one particle"
        );
        let num_groups = config.num_groups.clamp(1, num_pieces);

        for block in &mut per_piece {
            for p in block.iter_mut() {
                p.key = generate_key(p.position, &bounding_box);
            }
        }

        let mut senders = Vec::with_capacity(num_groups);
        let mut receivers = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let group_map: Vec<usize> = (0..num_pieces)
            .map(|p| group_of(p, num_pieces, num_groups))
            .collect();
        let router = Router {
            senders,
            group_of: Arc::new(group_map.clone()),
        };
        let (report_tx, report_rx) = channel();

        let mut blocks: Vec<Vec<TreePiece>> = (0..num_groups).map(|_| Vec::new()).collect();
        for (index, particles) in per_piece.into_iter().enumerate() {
            blocks[group_map[index]].push(TreePiece::new(
                index,
                num_pieces,
                config.clone(),
                bounding_box,
                particles,
            ));
        }

        info!(
            pieces = num_pieces,
            groups = num_groups,
            "starting worker groups"
        );

        let mut handles = Vec::with_capacity(num_groups);
        for (group, (pieces, rx)) in blocks.into_iter().zip(receivers).enumerate() {
            let slots = pieces
                .iter()
                .enumerate()
                .map(|(slot, piece)| (piece.index, slot))
                .collect();
            let worker = WorkerGroup {
                group,
                pieces,
                slots,
                cache: CacheManager::new(),
                rx,
                router: router.clone(),
                report_tx: report_tx.clone(),
            };
            handles.push(Some(
                thread::Builder::new()
                    .name(format!("treegrav-group-{group}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker group"),
            ));
        }

        Ok(Simulation {
            config,
            router,
            report_rx,
            handles,
            iteration: 0,
            built: false,
        })
    }

    fn num_pieces(&self) -> usize {
        self.config.num_pieces
    }

    fn broadcast(&self, make: impl Fn() -> PieceMsg) {
        for piece in 0..self.num_pieces() {
            self.router.route(Envelope::Piece(piece, make()));
        }
    }

    /// Sort, gather splitters, build local trees and reconcile boundary
    /// moments; returns once every piece has signalled tree readiness.
    pub fn build(&mut self) -> Result<()> {
        self.broadcast(|| PieceMsg::StartSort);

        let mut bounds: Vec<(Key, Key)> = vec![(0, 0); self.num_pieces()];
        let mut remaining = self.num_pieces();
        while remaining > 0 {
            match self.recv_report()? {
                Report::SplitterBounds { piece, min, max } => {
                    bounds[piece] = (min, max);
                    remaining -= 1;
                }
                other => debug!(?other, "report out of phase; ignoring"),
            }
        }

        let splitters = match assemble_splitters(&bounds) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        debug!(splitters = splitters.len(), "splitters collected");

        self.broadcast(|| PieceMsg::BuildLocalTree {
            splitters: Arc::clone(&splitters),
        });
        self.barrier(|r| matches!(r, Report::TreeReady { .. }))?;
        self.built = true;
        info!("global tree ready");
        Ok(())
    }

    /// Run one gravity iteration over the built tree.
    pub fn compute_gravity(&mut self) -> Result<()> {
        assert!(self.built, "compute_gravity before build");
        self.iteration += 1;
        let iteration = self.iteration;
        self.broadcast(|| PieceMsg::StartGravity { iteration });
        self.barrier(|r| matches!(r, Report::GravityDone { .. }))?;
        info!(iteration, "gravity iteration complete");
        Ok(())
    }

    fn recv_report(&mut self) -> Result<Report> {
        match self.report_rx.recv() {
            Ok(Report::Fatal(e)) => {
                self.abort();
                Err(e)
            }
            Ok(r) => Ok(r),
            Err(_) => {
                self.abort();
                Err(GravityError::WorkerDisconnected)
            }
        }
    }

    fn barrier(&mut self, done: impl Fn(&Report) -> bool) -> Result<()> {
        let mut remaining = self.num_pieces();
        while remaining > 0 {
            let report = self.recv_report()?;
            if done(&report) {
                remaining -= 1;
            } else {
                debug!(?report, "report out of phase; ignoring");
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        for sender in &self.router.senders {
            let _ = sender.send(Envelope::Shutdown);
        }
        for handle in &mut self.handles {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }

    /// Stop the workers and collect every piece's final state.
    pub fn finish(mut self) -> Result<SimulationOutput> {
        for sender in &self.router.senders {
            let _ = sender.send(Envelope::Shutdown);
        }
        let mut pieces = Vec::with_capacity(self.num_pieces());
        let mut cache_stats = vec![CacheStats::default(); self.handles.len()];
        for handle in &mut self.handles {
            let h = handle.take().expect("finish called once");
            let result = h.join().map_err(|_| GravityError::WorkerDisconnected)?;
            cache_stats[result.group] = result.cache_stats;
            pieces.extend(result.pieces);
        }
        pieces.sort_by_key(|p| p.index);
        Ok(SimulationOutput {
            pieces,
            cache_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pieces_deal_to_groups_in_contiguous_blocks() {
        let groups: Vec<usize> = (0..6).map(|p| group_of(p, 6, 3)).collect();
        assert_eq!(groups, vec![0, 0, 1, 1, 2, 2]);
        let lop: Vec<usize> = (0..5).map(|p| group_of(p, 5, 2)).collect();
        assert_eq!(lop, vec![0, 0, 0, 1, 1]);
        assert!((0..17).all(|p| group_of(p, 17, 4) < 4));
    }
}
