//! The on-manifold filter state and its retraction operators.
//!
//! `State` lives on M = R^3 x SO(3) x SO(3) x R^3 x R^3 x R^3 x R^3 x S^2.
//! `boxplus`/`boxminus` move between the manifold and its 23-dimensional
//! tangent space; `skew` builds the cross-product matrix used throughout
//! the propagation and measurement Jacobians.

use nalgebra::{Matrix3, SVector, UnitQuaternion, Vector3};

/// Dimension of the tangent space (pos 3, rot 3, offset_R 3, offset_T 3,
/// vel 3, bg 3, ba 3, gravity 2).
pub const TANGENT_DIM: usize = 23;

/// A point in the tangent space around some `State`.
pub type Tangent = SVector<f64, TANGENT_DIM>;

/// Index ranges of each block within a `Tangent`, in declaration order.
pub mod block {
    pub const POS: std::ops::Range<usize> = 0..3;
    pub const ROT: std::ops::Range<usize> = 3..6;
    pub const OFFSET_R: std::ops::Range<usize> = 6..9;
    pub const OFFSET_T: std::ops::Range<usize> = 9..12;
    pub const VEL: std::ops::Range<usize> = 12..15;
    pub const BG: std::ops::Range<usize> = 15..18;
    pub const BA: std::ops::Range<usize> = 18..21;
    pub const GRAV: std::ops::Range<usize> = 21..23;
}

/// Builds the skew-symmetric cross-product matrix `[v]_x` such that
/// `[v]_x * w == v.cross(&w)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// The full filter state.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Position of the IMU frame in world coordinates.
    pub pos: Vector3<f64>,
    /// Orientation of the IMU frame in world coordinates.
    pub rot: UnitQuaternion<f64>,
    /// LiDAR-to-IMU extrinsic rotation.
    pub offset_r: UnitQuaternion<f64>,
    /// LiDAR-to-IMU extrinsic translation.
    pub offset_t: Vector3<f64>,
    /// Linear velocity of the IMU frame in world coordinates.
    pub vel: Vector3<f64>,
    /// Gyroscope bias.
    pub bg: Vector3<f64>,
    /// Accelerometer bias.
    pub ba: Vector3<f64>,
    /// Gravity vector in world coordinates; magnitude is held fixed, only
    /// its direction (2 degrees of freedom) is estimated.
    pub grav: Vector3<f64>,
}

impl State {
    /// A state with identity rotations, zero vectors, and standard gravity
    /// pointing down the world -z axis.
    pub fn identity() -> Self {
        State {
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            offset_r: UnitQuaternion::identity(),
            offset_t: Vector3::zeros(),
            vel: Vector3::zeros(),
            bg: Vector3::zeros(),
            ba: Vector3::zeros(),
            grav: Vector3::new(0.0, 0.0, -9.81),
        }
    }

    /// Local orthonormal basis of the tangent plane at `grav`'s direction,
    /// used to parameterize its 2-DoF update.
    pub(crate) fn gravity_basis(&self) -> (Vector3<f64>, Vector3<f64>) {
        let g = self.grav;
        let norm = g.norm().max(1e-9);
        let dir = g / norm;
        let tmp = if dir.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let b1 = dir.cross(&tmp).normalize();
        let b2 = dir.cross(&b1).normalize();
        (b1 * norm, b2 * norm)
    }

    /// Right-retraction: moves the state by a tangent-space increment.
    pub fn boxplus(&self, d: &Tangent) -> State {
        let (b1, b2) = self.gravity_basis();
        let new_grav = self.grav + b1 * d[block::GRAV.start] + b2 * d[block::GRAV.start + 1];
        State {
            pos: self.pos + d.fixed_rows::<3>(block::POS.start).into_owned(),
            rot: self.rot * UnitQuaternion::new(d.fixed_rows::<3>(block::ROT.start).into_owned()),
            offset_r: self.offset_r
                * UnitQuaternion::new(d.fixed_rows::<3>(block::OFFSET_R.start).into_owned()),
            offset_t: self.offset_t + d.fixed_rows::<3>(block::OFFSET_T.start).into_owned(),
            vel: self.vel + d.fixed_rows::<3>(block::VEL.start).into_owned(),
            bg: self.bg + d.fixed_rows::<3>(block::BG.start).into_owned(),
            ba: self.ba + d.fixed_rows::<3>(block::BA.start).into_owned(),
            grav: new_grav,
        }
    }

    /// Inverse retraction: the tangent-space difference `self - other`
    /// such that `other.boxplus(&(self.boxminus(other))) ~= self`.
    pub fn boxminus(&self, other: &State) -> Tangent {
        let mut d = Tangent::zeros();
        d.fixed_rows_mut::<3>(block::POS.start)
            .copy_from(&(self.pos - other.pos));
        d.fixed_rows_mut::<3>(block::ROT.start)
            .copy_from(&(other.rot.inverse() * self.rot).scaled_axis());
        d.fixed_rows_mut::<3>(block::OFFSET_R.start)
            .copy_from(&(other.offset_r.inverse() * self.offset_r).scaled_axis());
        d.fixed_rows_mut::<3>(block::OFFSET_T.start)
            .copy_from(&(self.offset_t - other.offset_t));
        d.fixed_rows_mut::<3>(block::VEL.start)
            .copy_from(&(self.vel - other.vel));
        d.fixed_rows_mut::<3>(block::BG.start)
            .copy_from(&(self.bg - other.bg));
        d.fixed_rows_mut::<3>(block::BA.start)
            .copy_from(&(self.ba - other.ba));
        let (b1, b2) = other.gravity_basis();
        let dg = self.grav - other.grav;
        d[block::GRAV.start] = b1.dot(&dg) / b1.norm_squared().max(1e-18);
        d[block::GRAV.start + 1] = b2.dot(&dg) / b2.norm_squared().max(1e-18);
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn skew_matches_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let w = Vector3::new(-2.0, 0.5, 4.0);
        assert!((skew(&v) * w - v.cross(&w)).norm() < 1e-12);
    }

    #[rstest]
    #[case(Tangent::zeros())]
    #[case(Tangent::from_element(1e-4))]
    fn boxplus_boxminus_round_trip(#[case] d: Tangent) {
        let x = State::identity();
        let moved = x.boxplus(&d);
        let back = moved.boxminus(&x);
        assert!((back - d).norm() < 1e-6, "round trip error too large");
    }

    #[test]
    fn boxminus_of_self_is_zero() {
        let x = State::identity();
        let d = x.boxminus(&x);
        assert!(d.norm() < 1e-12);
    }
}
