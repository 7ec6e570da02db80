use approx::assert_relative_eq;

use treegrav::sfc::generate_key;
use treegrav::tree::{lookup_key, NodeKind};
use treegrav::{GravityParticle, OrientedBox, SimConfig, Simulation};

fn unit_box() -> OrientedBox {
    OrientedBox::new([0.0; 3], [1.0; 3])
}

#[test]
fn two_pieces_reconcile_the_root() {
    // Eight particles on a line through the middle of the cube, four per
    // piece: the root spans both pieces and must come out Boundary on
    // each, with the full eight-particle totals.
    let particles: Vec<GravityParticle> = (0..8)
        .map(|i| GravityParticle::new([(2 * i + 1) as f32 / 16.0, 0.5, 0.5], 1.0, 0.0))
        .collect();
    let blocks = vec![particles[..4].to_vec(), particles[4..].to_vec()];
    let config = SimConfig {
        num_pieces: 2,
        num_groups: 2,
        bucket_size: 2,
        theta: 0.7,
        ..Default::default()
    };
    let mut sim = Simulation::new(config, unit_box(), blocks).unwrap();
    sim.build().unwrap();
    let output = sim.finish().unwrap();

    let mut mass_sum = 0.0;
    let mut cm = [0.0f64; 3];
    for p in &particles {
        mass_sum += p.mass as f64;
        for k in 0..3 {
            cm[k] += p.mass as f64 * p.position[k] as f64;
        }
    }
    for c in &mut cm {
        *c /= mass_sum;
    }

    let roots: Vec<_> = output.pieces.iter().map(|p| p.root_node()).collect();
    for root in &roots {
        assert_eq!(root.kind, NodeKind::Boundary);
        assert_eq!(root.remote_index, 8, "reconciled total particle count");
        assert_relative_eq!(root.moments.total_mass, mass_sum, max_relative = 1e-12);
        for k in 0..3 {
            assert_relative_eq!(root.moments.cm[k], cm[k], max_relative = 1e-9);
        }
    }
    // The designated owner broadcast one set of totals: both copies are
    // identical to the bit.
    assert_eq!(roots[0].moments, roots[1].moments);
    assert_eq!(
        roots[0].local_count() + roots[1].local_count(),
        8,
        "local counts partition the node"
    );
}

#[test]
fn bucket_ranges_partition_each_piece() {
    let particles: Vec<GravityParticle> = (0..64)
        .map(|i| {
            let t = i as f32 / 64.0;
            GravityParticle::new([t, (t * 7.3).fract(), (t * 3.1).fract()], 1.0, 0.0)
        })
        .collect();
    let bbox = unit_box();
    let mut keyed = particles;
    for p in &mut keyed {
        p.key = generate_key(p.position, &bbox);
    }
    keyed.sort_by_key(|p| p.key);
    let blocks = vec![keyed[..21].to_vec(), keyed[21..40].to_vec(), keyed[40..].to_vec()];
    let config = SimConfig {
        num_pieces: 3,
        num_groups: 1,
        bucket_size: 4,
        ..Default::default()
    };
    let mut sim = Simulation::new(config, bbox, blocks).unwrap();
    sim.build().unwrap();
    let output = sim.finish().unwrap();

    for piece in &output.pieces {
        let n = piece.num_particles();
        // Sorted keys, and sentinels bracketing them.
        let owned = piece.owned_particles();
        for w in owned.windows(2) {
            assert!(w[0].key <= w[1].key);
        }
        let mut covered = vec![false; n + 2];
        let mut buckets = 0;
        for node in piece.nodes() {
            if node.kind == NodeKind::Bucket {
                buckets += 1;
                assert!(node.begin_particle < node.end_particle);
                for i in node.begin_particle..node.end_particle {
                    assert!(!covered[i], "bucket ranges overlap at {i}");
                    covered[i] = true;
                }
            }
        }
        assert_eq!(buckets, piece.num_buckets());
        assert!(
            covered[1..=n].iter().all(|&c| c),
            "buckets must cover every owned particle"
        );
        assert!(!covered[0] && !covered[n + 1], "sentinels are never bucketed");
    }
}

#[test]
fn empty_remote_sibling_is_pruned_from_the_lookup() {
    // Piece 0 holds x = 0.30 and 0.95; piece 1 holds three particles just
    // above 0.95. On piece 1 the walk-in path creates a remote child for
    // the x-upper/y-lower quadrant, a key range inside piece 0's span
    // that contains no particles at all: reconciliation must synthesize a
    // zero count and remove the node.
    let p0 = vec![
        GravityParticle::new([0.30, 0.6, 0.6], 1.0, 0.0),
        GravityParticle::new([0.95, 0.6, 0.6], 1.0, 0.0),
    ];
    let p1 = vec![
        GravityParticle::new([0.96, 0.6, 0.6], 1.0, 0.0),
        GravityParticle::new([0.97, 0.6, 0.6], 1.0, 0.0),
        GravityParticle::new([0.98, 0.6, 0.6], 1.0, 0.0),
    ];
    let config = SimConfig {
        num_pieces: 2,
        num_groups: 2,
        bucket_size: 4,
        ..Default::default()
    };
    let mut sim = Simulation::new(config, unit_box(), vec![p0, p1]).unwrap();
    sim.build().unwrap();
    let output = sim.finish().unwrap();
    let piece1 = &output.pieces[1];

    // x-lower half of the root: remote, holds exactly piece 0's x=0.30.
    let t1 = lookup_key(0, 1);
    let kept = piece1.node(t1).expect("x-lower remote child survives");
    assert_eq!(kept.kind, NodeKind::NonLocal);
    assert_eq!(kept.remote_index, 0, "designated owner is piece 0");
    assert_eq!(
        kept.end_particle - kept.begin_particle,
        1,
        "synthesized count is piece 0's one particle below the boundary"
    );

    // x-upper, y-lower quadrant: lies between piece 0's two particles,
    // owned but empty, so it must be gone from the lookup.
    let ty = lookup_key(1u64 << 62, 2);
    assert!(piece1.node(ty).is_none(), "empty remote sibling still resolvable");
    // Its husk proves the node existed before reconciliation removed it.
    assert!(
        piece1
            .nodes()
            .iter()
            .any(|n| n.kind == NodeKind::Invalid && n.key == 1u64 << 62 && n.level == 2),
        "the pruned node was never created"
    );
}

#[test]
fn misordered_blocks_abort_the_partition() {
    // Blocks handed to pieces out of SFC order produce overlapping
    // splitter ranges, which the partitioner must reject.
    let lo = vec![
        GravityParticle::new([0.1, 0.5, 0.5], 1.0, 0.0),
        GravityParticle::new([0.9, 0.5, 0.5], 1.0, 0.0),
    ];
    let hi = vec![
        GravityParticle::new([0.2, 0.5, 0.5], 1.0, 0.0),
        GravityParticle::new([0.8, 0.5, 0.5], 1.0, 0.0),
    ];
    let config = SimConfig {
        num_pieces: 2,
        num_groups: 1,
        ..Default::default()
    };
    let mut sim = Simulation::new(config, unit_box(), vec![lo, hi]).unwrap();
    assert!(matches!(
        sim.build(),
        Err(treegrav::GravityError::SplittersNotMonotone)
    ));
}
