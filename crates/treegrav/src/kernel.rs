//! The gravitational force kernel: cubic-spline softening and the
//! particle- and multipole-level interaction formulas built on it.
//!
//! `spline` returns `(a, b)` with `a = -phi/m` per unit mass and
//! `b = |grad phi| / (m r)`, so an interaction contributes `m * r_vec * b`
//! to the acceleration and `-m * a` to the potential. `spline_q`
//! additionally returns the third and fourth radial derivatives `(c, d)`
//! needed by the quadrupole term.

use crate::moments::MultipoleMoments;

/// Geometry factor applied to a node's opening radius; the opening sphere
/// has radius `factor * moments.radius / theta`. Equals 2/sqrt(3), the
/// ratio of a cube's space diagonal to its side.
pub const OPENING_GEOMETRY_FACTOR: f64 = 1.154_700_538_379_251_5;

/// Softened `(a, b)` for separation `r2` and combined softening `twoh`.
/// Outside the softening ball this is plain Newtonian `1/r`, `1/r^3`.
#[inline]
pub fn spline(r2: f64, twoh: f64) -> (f64, f64) {
    let r = r2.sqrt();
    if r < twoh {
        let dih = 2.0 / twoh;
        let u = r * dih;
        if u < 1.0 {
            let u2 = u * u;
            let a = dih * (7.0 / 5.0 - 2.0 / 3.0 * u2 + 3.0 / 10.0 * u2 * u2
                - 1.0 / 10.0 * u2 * u2 * u);
            let b = dih * dih * dih * (4.0 / 3.0 - 6.0 / 5.0 * u2 + 1.0 / 2.0 * u2 * u);
            (a, b)
        } else {
            let dir = 1.0 / r;
            let u2 = u * u;
            let a = -1.0 / 15.0 * dir
                + dih * (8.0 / 5.0 - 4.0 / 3.0 * u2 + u2 * u - 3.0 / 10.0 * u2 * u2
                    + 1.0 / 30.0 * u2 * u2 * u);
            let b = -1.0 / 15.0 * dir * dir * dir
                + dih * dih * dih * (8.0 / 3.0 - 3.0 * u + 6.0 / 5.0 * u2 - 1.0 / 6.0 * u2 * u);
            (a, b)
        }
    } else {
        let a = 1.0 / r;
        (a, a * a * a)
    }
}

/// Softened `(a, b, c, d)` including the higher radial derivatives used by
/// the quadrupole interaction. `inv_r` must be `1/sqrt(r2)`.
#[inline]
pub fn spline_q(inv_r: f64, r2: f64, twoh: f64) -> (f64, f64, f64, f64) {
    let dir = inv_r;
    if r2 < twoh * twoh {
        let dih = 2.0 / twoh;
        let u = dih / dir;
        if u < 1.0 {
            let u2 = u * u;
            let dih3 = dih * dih * dih;
            let dih5 = dih3 * dih * dih;
            let a = dih * (7.0 / 5.0 - 2.0 / 3.0 * u2 + 3.0 / 10.0 * u2 * u2
                - 1.0 / 10.0 * u2 * u2 * u);
            let b = dih3 * (4.0 / 3.0 - 6.0 / 5.0 * u2 + 1.0 / 2.0 * u2 * u);
            let c = dih5 * (12.0 / 5.0 - 3.0 / 2.0 * u);
            let d = 3.0 / 2.0 * dih5 * dih * dir;
            (a, b, c, d)
        } else {
            let u2 = u * u;
            let dir3 = dir * dir * dir;
            let dih3 = dih * dih * dih;
            let dih4 = dih3 * dih;
            let dih5 = dih4 * dih;
            let a = -1.0 / 15.0 * dir
                + dih * (8.0 / 5.0 - 4.0 / 3.0 * u2 + u2 * u - 3.0 / 10.0 * u2 * u2
                    + 1.0 / 30.0 * u2 * u2 * u);
            let b = -1.0 / 15.0 * dir3
                + dih3 * (8.0 / 3.0 - 3.0 * u + 6.0 / 5.0 * u2 - 1.0 / 6.0 * u2 * u);
            let c = -1.0 / 5.0 * dir3 * dir * dir + 3.0 * dih4 * dir
                + dih5 * (-12.0 / 5.0 + 1.0 / 2.0 * u);
            let d = -dir3 * dir3 * dir + 3.0 * dih4 * dir3 - 1.0 / 2.0 * dih5 * dih * dir;
            (a, b, c, d)
        }
    } else {
        let a = dir;
        let b = a * a * a;
        let c = 3.0 * b * a * a;
        let d = 5.0 * c * a * a;
        (a, b, c, d)
    }
}

/// Acceleration and potential a source particle contributes at a target.
///
/// Self-interactions are excluded by identity at the call sites, never by
/// separation; a coincident pair with zero combined softening has no
/// finite contribution and yields zero.
#[inline]
pub fn particle_force(
    src_pos: [f64; 3],
    src_mass: f64,
    src_soft: f64,
    tgt_pos: [f64; 3],
    tgt_soft: f64,
) -> ([f64; 3], f64) {
    let r = [
        src_pos[0] - tgt_pos[0],
        src_pos[1] - tgt_pos[1],
        src_pos[2] - tgt_pos[2],
    ];
    let rsq = r[0] * r[0] + r[1] * r[1] + r[2] * r[2];
    let twoh = src_soft + tgt_soft;
    if rsq == 0.0 && twoh == 0.0 {
        return ([0.0; 3], 0.0);
    }
    let (a, b) = spline(rsq, twoh);
    let mb = src_mass * b;
    (
        [mb * r[0], mb * r[1], mb * r[2]],
        -(src_mass * a),
    )
}

/// Acceleration and potential a node's multipole contributes at a target,
/// monopole plus trace-corrected quadrupole.
#[inline]
pub fn node_force(m: &MultipoleMoments, tgt_pos: [f64; 3], tgt_soft: f64) -> ([f64; 3], f64) {
    let r = [
        tgt_pos[0] - m.cm[0],
        tgt_pos[1] - m.cm[1],
        tgt_pos[2] - m.cm[2],
    ];
    let rsq = r[0] * r[0] + r[1] * r[1] + r[2] * r[2];
    if rsq == 0.0 {
        return ([0.0; 3], 0.0);
    }
    let twoh = m.soft + tgt_soft;
    let dir = 1.0 / rsq.sqrt();
    let (a, b, c, d) = spline_q(dir, rsq, twoh);
    let qirx = m.xx * r[0] + m.xy * r[1] + m.xz * r[2];
    let qiry = m.xy * r[0] + m.yy * r[1] + m.yz * r[2];
    let qirz = m.xz * r[0] + m.yz * r[1] + m.zz * r[2];
    let qir = 0.5 * (qirx * r[0] + qiry * r[1] + qirz * r[2]);
    let tr = 0.5 * (m.xx + m.yy + m.zz);
    let qir3 = b * m.total_mass + d * qir - c * tr;
    let pot = -(m.total_mass * a + c * qir - b * tr);
    (
        [
            -(qir3 * r[0] - c * qirx),
            -(qir3 * r[1] - c * qiry),
            -(qir3 * r[2] - c * qirz),
        ],
        pot,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn spline_is_newtonian_outside_softening() {
        let (a, b) = spline(4.0, 1.0);
        assert_relative_eq!(a, 0.5, max_relative = 1e-15);
        assert_relative_eq!(b, 0.125, max_relative = 1e-15);
    }

    #[test]
    fn spline_is_continuous_at_the_edges() {
        let twoh = 1.0;
        for r in [0.5, 1.0] {
            let below = spline((r - 1e-9) * (r - 1e-9), twoh);
            let above = spline((r + 1e-9) * (r + 1e-9), twoh);
            assert_relative_eq!(below.0, above.0, max_relative = 1e-6);
            assert_relative_eq!(below.1, above.1, max_relative = 1e-6);
        }
    }

    #[test]
    fn spline_is_finite_at_zero_separation() {
        let (a, b) = spline(0.0, 0.5);
        assert_relative_eq!(a, 4.0 * 7.0 / 5.0, max_relative = 1e-12);
        assert_relative_eq!(b, 64.0 * 4.0 / 3.0, max_relative = 1e-12);
    }

    #[test]
    fn spline_q_matches_spline_in_newtonian_regime() {
        let r2 = 9.0;
        let (a, b) = spline(r2, 1.0);
        let (aq, bq, c, d) = spline_q(1.0 / 3.0, r2, 1.0);
        assert_relative_eq!(a, aq, max_relative = 1e-14);
        assert_relative_eq!(b, bq, max_relative = 1e-14);
        assert_relative_eq!(c, 3.0 / 243.0, max_relative = 1e-12);
        assert_relative_eq!(d, 5.0 * c / 9.0, max_relative = 1e-12);
    }

    #[test]
    fn particle_force_points_at_the_source() {
        let (acc, pot) = particle_force([1.0, 0.0, 0.0], 2.0, 0.0, [0.0; 3], 0.0);
        assert_relative_eq!(acc[0], 2.0, max_relative = 1e-14);
        assert_eq!(acc[1], 0.0);
        assert_relative_eq!(pot, -2.0, max_relative = 1e-14);
    }

    #[test]
    fn coincident_unsoftened_pair_contributes_nothing() {
        let (acc, pot) = particle_force([0.5; 3], 1.0, 0.0, [0.5; 3], 0.0);
        assert_eq!(acc, [0.0; 3]);
        assert_eq!(pot, 0.0);
    }

    #[test]
    fn point_node_matches_particle_force() {
        // A node holding a single particle has a vanishing quadrupole, so
        // the multipole interaction must reduce to the pairwise one.
        let mut m = MultipoleMoments::zero();
        m.add_particle([1.0, 2.0, 3.0], 1.5, 0.0);
        let tgt = [4.0, 5.0, 7.0];
        let (na, np) = node_force(&m, tgt, 0.0);
        let (pa, pp) = particle_force([1.0, 2.0, 3.0], 1.5, 0.0, tgt, 0.0);
        for i in 0..3 {
            assert_relative_eq!(na[i], pa[i], max_relative = 1e-12);
        }
        assert_relative_eq!(np, pp, max_relative = 1e-12);
    }
}
