use rand::{rngs::StdRng, Rng, SeedableRng};

use treegrav::sfc::generate_key;
use treegrav::{direct, GravityParticle, OrientedBox, SimConfig, Simulation};

fn unit_box() -> OrientedBox {
    OrientedBox::new([0.0; 3], [1.0; 3])
}

fn gen_particles(seed: u64, n: usize) -> Vec<GravityParticle> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            GravityParticle::new(
                [rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()],
                0.5 + rng.gen::<f32>(),
                0.0,
            )
        })
        .collect()
}

/// Sort globally by SFC key and deal contiguous ranges to pieces, the
/// order the input field files are expected to be in.
fn split_sorted(mut particles: Vec<GravityParticle>, pieces: usize) -> Vec<Vec<GravityParticle>> {
    let bbox = unit_box();
    for p in &mut particles {
        p.key = generate_key(p.position, &bbox);
    }
    particles.sort_by_key(|p| p.key);
    let n = particles.len();
    let mut blocks = Vec::with_capacity(pieces);
    let mut rest = particles;
    for i in (1..pieces).rev() {
        let at = n * i / pieces;
        blocks.push(rest.split_off(at));
    }
    blocks.push(rest);
    blocks.reverse();
    blocks
}

fn run_gravity(config: SimConfig, blocks: Vec<Vec<GravityParticle>>) -> Vec<GravityParticle> {
    let mut sim = Simulation::new(config, unit_box(), blocks).unwrap();
    sim.build().unwrap();
    sim.compute_gravity().unwrap();
    let output = sim.finish().unwrap();
    let mut all = Vec::new();
    for piece in &output.pieces {
        all.extend_from_slice(piece.owned_particles());
    }
    all
}

#[test]
fn two_particles_single_piece_match_direct_bitwise() {
    // One interaction each way; the tree walk accepts the other bucket as
    // a point multipole, which must reproduce the pairwise force exactly.
    let particles = vec![
        GravityParticle::new([0.1, 0.1, 0.1], 1.0, 0.0),
        GravityParticle::new([0.9, 0.9, 0.9], 1.0, 0.0),
    ];
    let config = SimConfig {
        num_pieces: 1,
        num_groups: 1,
        bucket_size: 1,
        theta: 0.7,
        ..Default::default()
    };
    let out = run_gravity(config, vec![particles.clone()]);
    assert_eq!(out.len(), 2);
    let reference = direct::accelerations(&out);
    for (p, r) in out.iter().zip(reference.iter()) {
        assert_eq!(p.tree_acceleration, *r);
    }
}

#[test]
fn accuracy_regression_4096_uniform() {
    let blocks = split_sorted(gen_particles(1, 4096), 8);
    let config = SimConfig {
        num_pieces: 8,
        num_groups: 2,
        bucket_size: 12,
        theta: 0.7,
        ..Default::default()
    };
    let out = run_gravity(config, blocks);
    assert_eq!(out.len(), 4096);
    let reference = direct::accelerations(&out);
    let tree: Vec<[f64; 3]> = out.iter().map(|p| p.tree_acceleration).collect();
    let errors = direct::relative_errors(&tree, &reference);
    let max = errors.iter().copied().fold(0.0, f64::max);
    let mean = errors.iter().sum::<f64>() / errors.len() as f64;
    assert!(max < 1e-2, "max relative error {max}");
    assert!(mean < 1e-3, "mean relative error {mean}");
}

#[test]
fn smaller_theta_is_more_accurate() {
    let particles = gen_particles(9, 1024);
    let mut errs = Vec::new();
    for theta in [0.9, 0.5] {
        let config = SimConfig {
            num_pieces: 4,
            num_groups: 2,
            theta,
            ..Default::default()
        };
        let out = run_gravity(config, split_sorted(particles.clone(), 4));
        let reference = direct::accelerations(&out);
        let tree: Vec<[f64; 3]> = out.iter().map(|p| p.tree_acceleration).collect();
        let errors = direct::relative_errors(&tree, &reference);
        errs.push(errors.iter().sum::<f64>() / errors.len() as f64);
    }
    assert!(
        errs[1] < errs[0],
        "mean error did not shrink with theta: {errs:?}"
    );
}

#[test]
fn rerunning_an_iteration_is_idempotent() {
    let blocks = split_sorted(gen_particles(4, 512), 3);
    let config = SimConfig {
        num_pieces: 3,
        num_groups: 1,
        ..Default::default()
    };
    let mut sim = Simulation::new(config, unit_box(), blocks).unwrap();
    sim.build().unwrap();
    sim.compute_gravity().unwrap();
    // Second iteration over the unchanged tree; accumulators reset, so it
    // recomputes the same answer.
    sim.compute_gravity().unwrap();
    let output = sim.finish().unwrap();
    let mut first = Vec::new();
    for piece in &output.pieces {
        first.extend_from_slice(piece.owned_particles());
    }

    let blocks = split_sorted(gen_particles(4, 512), 3);
    let config = SimConfig {
        num_pieces: 3,
        num_groups: 1,
        ..Default::default()
    };
    let second = run_gravity(config, blocks);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.key, b.key);
        assert_eq!(a.tree_acceleration, b.tree_acceleration);
        assert_eq!(a.potential, b.potential);
    }
}

#[test]
fn point_to_point_mode_matches_cached_mode() {
    let particles = gen_particles(7, 600);
    let cached = run_gravity(
        SimConfig {
            num_pieces: 4,
            num_groups: 2,
            cache_enabled: true,
            ..Default::default()
        },
        split_sorted(particles.clone(), 4),
    );
    let p2p = run_gravity(
        SimConfig {
            num_pieces: 4,
            num_groups: 2,
            cache_enabled: false,
            ..Default::default()
        },
        split_sorted(particles, 4),
    );
    for (a, b) in cached.iter().zip(p2p.iter()) {
        let da = (a.tree_acceleration[0] - b.tree_acceleration[0]).abs()
            + (a.tree_acceleration[1] - b.tree_acceleration[1]).abs()
            + (a.tree_acceleration[2] - b.tree_acceleration[2]).abs();
        assert!(da < 1e-12, "walk modes disagree by {da}");
    }
}
