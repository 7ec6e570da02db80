//! O(N^2) direct-sum gravity, the reference the tree walk is checked
//! against. Uses the same softening spline as the tree kernel so the two
//! agree exactly wherever the walk degenerates to pure pairwise sums.

use rayon::prelude::*;

use crate::kernel::particle_force;
use crate::particle::GravityParticle;

/// Accelerations on every particle from all others, skipping the self
/// pair by index.
pub fn accelerations(particles: &[GravityParticle]) -> Vec<[f64; 3]> {
    particles
        .par_iter()
        .enumerate()
        .map(|(i, tgt)| {
            let tgt_pos = tgt.position_f64();
            let tgt_soft = tgt.soft as f64;
            let mut acc = [0.0f64; 3];
            for (j, src) in particles.iter().enumerate() {
                if i == j {
                    continue;
                }
                let (a, _) = particle_force(
                    src.position_f64(),
                    src.mass as f64,
                    src.soft as f64,
                    tgt_pos,
                    tgt_soft,
                );
                acc[0] += a[0];
                acc[1] += a[1];
                acc[2] += a[2];
            }
            acc
        })
        .collect()
}

/// Potentials on every particle from all others.
pub fn potentials(particles: &[GravityParticle]) -> Vec<f64> {
    particles
        .par_iter()
        .enumerate()
        .map(|(i, tgt)| {
            let tgt_pos = tgt.position_f64();
            let tgt_soft = tgt.soft as f64;
            let mut pot = 0.0f64;
            for (j, src) in particles.iter().enumerate() {
                if i == j {
                    continue;
                }
                let (_, p) = particle_force(
                    src.position_f64(),
                    src.mass as f64,
                    src.soft as f64,
                    tgt_pos,
                    tgt_soft,
                );
                pot += p;
            }
            pot
        })
        .collect()
}

/// Per-particle relative error of the tree accelerations against the
/// direct reference.
pub fn relative_errors(tree: &[[f64; 3]], reference: &[[f64; 3]]) -> Vec<f64> {
    tree.iter()
        .zip(reference.iter())
        .map(|(t, r)| {
            let num = dist(t, r);
            let den = norm(r);
            if den == 0.0 {
                num
            } else {
                num / den
            }
        })
        .collect()
}

#[inline]
fn norm(v: &[f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

#[inline]
fn dist(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    norm(&[a[0] - b[0], a[1] - b[1], a[2] - b[2]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn two_bodies_pull_on_each_other() {
        let particles = vec![
            GravityParticle::new([0.0, 0.0, 0.0], 1.0, 0.0),
            GravityParticle::new([2.0, 0.0, 0.0], 3.0, 0.0),
        ];
        let acc = accelerations(&particles);
        assert_relative_eq!(acc[0][0], 0.75, max_relative = 1e-12);
        assert_relative_eq!(acc[1][0], -0.25, max_relative = 1e-12);
        let pot = potentials(&particles);
        assert_relative_eq!(pot[0], -1.5, max_relative = 1e-12);
        assert_relative_eq!(pot[1], -0.5, max_relative = 1e-12);
    }

    #[test]
    fn momentum_is_conserved() {
        let particles: Vec<GravityParticle> = (0..16)
            .map(|i| {
                let t = i as f32 * 0.37;
                GravityParticle::new([t.sin(), t.cos(), 0.1 * t], 1.0 + 0.1 * t, 0.0)
            })
            .collect();
        let acc = accelerations(&particles);
        let mut net = [0.0f64; 3];
        for (p, a) in particles.iter().zip(acc.iter()) {
            for k in 0..3 {
                net[k] += p.mass as f64 * a[k];
            }
        }
        for k in 0..3 {
            assert!(net[k].abs() < 1e-10, "net force component {k} = {}", net[k]);
        }
    }
}
