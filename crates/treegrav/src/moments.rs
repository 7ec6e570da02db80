//! Multipole moments of tree nodes.
//!
//! A node's moments carry its total mass, mass-weighted softening, center
//! of mass and the raw (non-traceless) central second moments
//! `Q_ij = sum m dx_i dx_j`. The set is closed under three operations the
//! distributed tree needs:
//!
//! - accumulating a particle,
//! - merging another node's moments (translating both quadrupoles to the
//!   combined center of mass),
//! - subtracting a known child from a parent, which synthesizes the other
//!   child's moments without ever seeing its particles.
//!
//! The opening radius is not part of this algebra: it is recomputed from
//! geometry (farthest box corner) or from the farthest member particle.

use crate::space::OrientedBox;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MultipoleMoments {
    pub total_mass: f64,
    /// Mass-weighted mean softening length of the node's particles.
    pub soft: f64,
    pub cm: [f64; 3],
    pub xx: f64,
    pub xy: f64,
    pub xz: f64,
    pub yy: f64,
    pub yz: f64,
    pub zz: f64,
    pub radius: f64,
}

impl MultipoleMoments {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Accumulate one particle.
    pub fn add_particle(&mut self, pos: [f64; 3], mass: f64, soft: f64) {
        self.merge(mass, pos, soft, [0.0; 6]);
    }

    /// Merge another node's moments (same tree, disjoint particles).
    pub fn add_moments(&mut self, other: &MultipoleMoments) {
        if other.total_mass == 0.0 {
            return;
        }
        self.merge(
            other.total_mass,
            other.cm,
            other.soft,
            [other.xx, other.xy, other.xz, other.yy, other.yz, other.zz],
        );
    }

    fn merge(&mut self, m2: f64, cm2: [f64; 3], soft2: f64, q2: [f64; 6]) {
        let m1 = self.total_mass;
        if m1 == 0.0 {
            self.total_mass = m2;
            self.soft = soft2;
            self.cm = cm2;
            [self.xx, self.xy, self.xz, self.yy, self.yz, self.zz] = q2;
            return;
        }
        let m = m1 + m2;
        let cm = [
            (m1 * self.cm[0] + m2 * cm2[0]) / m,
            (m1 * self.cm[1] + m2 * cm2[1]) / m,
            (m1 * self.cm[2] + m2 * cm2[2]) / m,
        ];
        // Parallel-axis shift of both central quadrupoles onto the new cm.
        let d1 = sub3(self.cm, cm);
        let d2 = sub3(cm2, cm);
        self.xx += q2[0] + m1 * d1[0] * d1[0] + m2 * d2[0] * d2[0];
        self.xy += q2[1] + m1 * d1[0] * d1[1] + m2 * d2[0] * d2[1];
        self.xz += q2[2] + m1 * d1[0] * d1[2] + m2 * d2[0] * d2[2];
        self.yy += q2[3] + m1 * d1[1] * d1[1] + m2 * d2[1] * d2[1];
        self.yz += q2[4] + m1 * d1[1] * d1[2] + m2 * d2[1] * d2[2];
        self.zz += q2[5] + m1 * d1[2] * d1[2] + m2 * d2[2] * d2[2];
        self.soft = (m1 * self.soft + m2 * soft2) / m;
        self.total_mass = m;
        self.cm = cm;
    }

    /// Remove `other` from this node, leaving the moments of the remaining
    /// particles. Used to synthesize a NonLocal sibling as parent minus the
    /// known child. A result with no mass left collapses to zero.
    pub fn sub_moments(&mut self, other: &MultipoleMoments) {
        let mp = self.total_mass;
        let m2 = mp - other.total_mass;
        if m2 <= 0.0 {
            *self = MultipoleMoments::zero();
            return;
        }
        let cm2 = [
            (mp * self.cm[0] - other.total_mass * other.cm[0]) / m2,
            (mp * self.cm[1] - other.total_mass * other.cm[1]) / m2,
            (mp * self.cm[2] - other.total_mass * other.cm[2]) / m2,
        ];
        let do_ = sub3(other.cm, self.cm);
        let d2 = sub3(cm2, self.cm);
        self.xx -= other.xx + other.total_mass * do_[0] * do_[0] + m2 * d2[0] * d2[0];
        self.xy -= other.xy + other.total_mass * do_[0] * do_[1] + m2 * d2[0] * d2[1];
        self.xz -= other.xz + other.total_mass * do_[0] * do_[2] + m2 * d2[0] * d2[2];
        self.yy -= other.yy + other.total_mass * do_[1] * do_[1] + m2 * d2[1] * d2[1];
        self.yz -= other.yz + other.total_mass * do_[1] * do_[2] + m2 * d2[1] * d2[2];
        self.zz -= other.zz + other.total_mass * do_[2] * do_[2] + m2 * d2[2] * d2[2];
        self.soft = (mp * self.soft - other.total_mass * other.soft) / m2;
        self.total_mass = m2;
        self.cm = cm2;
    }

    /// Opening radius from the farthest corner of the node's box.
    pub fn set_radius_farthest_corner(&mut self, bbox: &OrientedBox) {
        self.radius = bbox.farthest_corner_dist2(self.cm).sqrt();
    }

    /// Opening radius from the farthest of the node's own particles.
    pub fn set_radius_farthest_particle<I>(&mut self, positions: I)
    where
        I: IntoIterator<Item = [f64; 3]>,
    {
        let mut r2: f64 = 0.0;
        for p in positions {
            let d = sub3(p, self.cm);
            r2 = r2.max(d[0] * d[0] + d[1] * d[1] + d[2] * d[2]);
        }
        self.radius = r2.sqrt();
    }
}

#[inline]
fn sub3(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}
