//! Primitive internal coordinates and their analytic Cartesian derivatives.
//!
//! Each primitive is a scalar function of two to four particle positions:
//!
//! - [`InternalCoordinate::Bond`]: distance `|x_b - x_a|`
//! - [`InternalCoordinate::Angle`]: angle a-b-c with `b` at the vertex, in radians
//! - [`InternalCoordinate::Dihedral`]: torsion a-b-c-d in radians, range (-π, π]
//!
//! Gradients are returned sparsely as one `Vector3` per participating particle
//! and assembled into rows of the Wilson B-matrix by
//! [`CoordinateSystem`](crate::coordinates::CoordinateSystem).

use crate::geometry::position;
use crate::linalg::wrap_angle;
use nalgebra::{DMatrix, DVector, Vector3};

/// Denominator floor for degenerate configurations (coincident particles,
/// linear angles, collinear torsions).
const DEGENERATE: f64 = 1e-10;

/// Displacement used for finite-difference second derivatives.
const FD_STEP: f64 = 1e-5;

/// Curvature class of a primitive, used to pick initial Hessian guesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateType {
    /// Bond length
    Stretch,
    /// Valence angle
    Bend,
    /// Dihedral angle
    Torsion,
    /// Cartesian-like coordinate (position, center of mass, rotation)
    Cartesian,
}

/// A primitive internal coordinate over zero-based particle indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InternalCoordinate {
    /// Distance between two particles
    Bond(usize, usize),
    /// Angle a-b-c with the vertex at the middle index
    Angle(usize, usize, usize),
    /// Torsion a-b-c-d about the b-c axis
    Dihedral(usize, usize, usize, usize),
}

impl InternalCoordinate {
    /// Particle indices in definition order.
    pub fn atoms(&self) -> Vec<usize> {
        match *self {
            Self::Bond(a, b) => vec![a, b],
            Self::Angle(a, b, c) => vec![a, b, c],
            Self::Dihedral(a, b, c, d) => vec![a, b, c, d],
        }
    }

    /// Curvature class.
    pub fn coordinate_type(&self) -> CoordinateType {
        match self {
            Self::Bond(..) => CoordinateType::Stretch,
            Self::Angle(..) => CoordinateType::Bend,
            Self::Dihedral(..) => CoordinateType::Torsion,
        }
    }

    /// Whether differences of this coordinate must be wrapped into (-π, π].
    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::Dihedral(..))
    }

    /// Value of the coordinate for a flat Cartesian vector.
    pub fn value(&self, coords: &DVector<f64>) -> f64 {
        match *self {
            Self::Bond(a, b) => bond_length(&position(coords, a), &position(coords, b)),
            Self::Angle(a, b, c) => bond_angle(
                &position(coords, a),
                &position(coords, b),
                &position(coords, c),
            ),
            Self::Dihedral(a, b, c, d) => dihedral_angle(
                &position(coords, a),
                &position(coords, b),
                &position(coords, c),
                &position(coords, d),
            ),
        }
    }

    /// Cartesian gradient as `(particle, ∂q/∂x_particle)` pairs.
    pub fn gradient(&self, coords: &DVector<f64>) -> Vec<(usize, Vector3<f64>)> {
        match *self {
            Self::Bond(a, b) => {
                let [ga, gb] = bond_gradient(&position(coords, a), &position(coords, b));
                vec![(a, ga), (b, gb)]
            }
            Self::Angle(a, b, c) => {
                let [ga, gb, gc] = angle_gradient(
                    &position(coords, a),
                    &position(coords, b),
                    &position(coords, c),
                );
                vec![(a, ga), (b, gb), (c, gc)]
            }
            Self::Dihedral(a, b, c, d) => {
                let [ga, gb, gc, gd] = dihedral_gradient(
                    &position(coords, a),
                    &position(coords, b),
                    &position(coords, c),
                    &position(coords, d),
                );
                vec![(a, ga), (b, gb), (c, gc), (d, gd)]
            }
        }
    }

    /// Second derivative with respect to the participating particles.
    ///
    /// Rows and columns follow [`InternalCoordinate::atoms`], three per
    /// particle. Obtained by central differences of the analytic gradient and
    /// symmetrized.
    pub fn second_derivative(&self, coords: &DVector<f64>) -> DMatrix<f64> {
        let atoms = self.atoms();
        let n = 3 * atoms.len();
        let mut hessian = DMatrix::zeros(n, n);

        let flatten = |grad: Vec<(usize, Vector3<f64>)>| {
            let mut out = DVector::zeros(n);
            for (k, (_, g)) in grad.into_iter().enumerate() {
                out.fixed_rows_mut::<3>(3 * k).copy_from(&g);
            }
            out
        };

        for (k, &atom) in atoms.iter().enumerate() {
            for axis in 0..3 {
                let mut plus = coords.clone();
                let mut minus = coords.clone();
                plus[3 * atom + axis] += FD_STEP;
                minus[3 * atom + axis] -= FD_STEP;
                let column = (flatten(self.gradient(&plus)) - flatten(self.gradient(&minus)))
                    / (2.0 * FD_STEP);
                hessian.set_column(3 * k + axis, &column);
            }
        }
        (&hessian + hessian.transpose()) * 0.5
    }

    /// Difference `new - old`, wrapped for periodic coordinates.
    pub fn difference(&self, new: f64, old: f64) -> f64 {
        if self.is_periodic() {
            wrap_angle(new - old)
        } else {
            new - old
        }
    }
}

/// Distance between two points.
pub fn bond_length(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    (b - a).norm()
}

/// Gradient of the distance with respect to both points.
pub fn bond_gradient(a: &Vector3<f64>, b: &Vector3<f64>) -> [Vector3<f64>; 2] {
    let d = b - a;
    let r = d.norm();
    if r < DEGENERATE {
        return [Vector3::zeros(); 2];
    }
    let u = d / r;
    [-u, u]
}

/// Angle a-b-c in radians.
pub fn bond_angle(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> f64 {
    let u = a - b;
    let v = c - b;
    let denom = u.norm() * v.norm();
    if denom < DEGENERATE {
        return 0.0;
    }
    (u.dot(&v) / denom).clamp(-1.0, 1.0).acos()
}

/// Gradient of the angle a-b-c (Wilson's formulas).
pub fn angle_gradient(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> [Vector3<f64>; 3] {
    let u = a - b;
    let v = c - b;
    let lu = u.norm();
    let lv = v.norm();
    if lu < DEGENERATE || lv < DEGENERATE {
        return [Vector3::zeros(); 3];
    }
    let eu = u / lu;
    let ev = v / lv;
    let cos = eu.dot(&ev).clamp(-1.0, 1.0);
    let sin = (1.0 - cos * cos).sqrt().max(DEGENERATE);

    let ga = (eu * cos - ev) / (lu * sin);
    let gc = (ev * cos - eu) / (lv * sin);
    let gb = -(ga + gc);
    [ga, gb, gc]
}

/// Torsion a-b-c-d in radians, range (-π, π].
pub fn dihedral_angle(
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    c: &Vector3<f64>,
    d: &Vector3<f64>,
) -> f64 {
    let r_ij = a - b;
    let r_kj = c - b;
    let r_kl = c - d;
    let m = r_ij.cross(&r_kj);
    let n = r_kj.cross(&r_kl);
    let y = r_kj.norm() * r_ij.dot(&n);
    let x = m.dot(&n);
    if x.abs() < DEGENERATE && y.abs() < DEGENERATE {
        return 0.0;
    }
    y.atan2(x)
}

/// Gradient of the torsion a-b-c-d.
pub fn dihedral_gradient(
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    c: &Vector3<f64>,
    d: &Vector3<f64>,
) -> [Vector3<f64>; 4] {
    let r_ij = a - b;
    let r_kj = c - b;
    let r_kl = c - d;
    let m = r_ij.cross(&r_kj);
    let n = r_kj.cross(&r_kl);
    let m2 = m.norm_squared();
    let n2 = n.norm_squared();
    let kj2 = r_kj.norm_squared();
    if m2 < DEGENERATE || n2 < DEGENERATE || kj2 < DEGENERATE {
        return [Vector3::zeros(); 4];
    }
    let kj = kj2.sqrt();

    let gi = m * (kj / m2);
    let gl = n * (-kj / n2);
    let p = r_ij.dot(&r_kj) / kj2;
    let q = r_kl.dot(&r_kj) / kj2;
    let gj = gi * (p - 1.0) - gl * q;
    let gk = gl * (q - 1.0) - gi * p;
    [gi, gj, gk, gl]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn skewed_chain() -> DVector<f64> {
        DVector::from_vec(vec![
            0.1, 1.2, -0.3, // 0
            0.0, 0.0, 0.0, // 1
            1.4, 0.1, 0.2, // 2
            1.7, -0.4, 1.3, // 3
        ])
    }

    /// Central finite differences of `value` compared with the analytic gradient.
    fn check_gradient(coordinate: InternalCoordinate, coords: &DVector<f64>) {
        let h = 1e-6;
        let analytic = coordinate.gradient(coords);
        for (atom, g) in analytic {
            for k in 0..3 {
                let mut plus = coords.clone();
                let mut minus = coords.clone();
                plus[3 * atom + k] += h;
                minus[3 * atom + k] -= h;
                let numeric = coordinate.difference(coordinate.value(&plus), coordinate.value(&minus))
                    / (2.0 * h);
                assert_abs_diff_eq!(g[k], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_bond_value_and_gradient() {
        let coords = skewed_chain();
        let bond = InternalCoordinate::Bond(1, 2);
        assert_abs_diff_eq!(bond.value(&coords), (1.96f64 + 0.01 + 0.04).sqrt(), epsilon = 1e-12);
        check_gradient(bond, &coords);
    }

    #[test]
    fn test_angle_gradient_matches_finite_differences() {
        let coords = skewed_chain();
        check_gradient(InternalCoordinate::Angle(0, 1, 2), &coords);
        check_gradient(InternalCoordinate::Angle(1, 2, 3), &coords);
    }

    #[test]
    fn test_right_angle() {
        let coords = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let angle = InternalCoordinate::Angle(0, 1, 2);
        assert_abs_diff_eq!(angle.value(&coords), PI / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dihedral_perpendicular() {
        let coords = DVector::from_vec(vec![
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0,
        ]);
        let dihedral = InternalCoordinate::Dihedral(0, 1, 2, 3);
        assert_abs_diff_eq!(dihedral.value(&coords).abs(), PI / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dihedral_cis_and_trans() {
        let cis = DVector::from_vec(vec![
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0,
        ]);
        let trans = DVector::from_vec(vec![
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, -1.0, 0.0,
        ]);
        let dihedral = InternalCoordinate::Dihedral(0, 1, 2, 3);
        assert_abs_diff_eq!(dihedral.value(&cis), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dihedral.value(&trans).abs(), PI, epsilon = 1e-12);
    }

    #[test]
    fn test_dihedral_gradient_matches_finite_differences() {
        check_gradient(InternalCoordinate::Dihedral(0, 1, 2, 3), &skewed_chain());
    }

    #[test]
    fn test_dihedral_gradient_translational_invariance() {
        let coords = skewed_chain();
        let grads = InternalCoordinate::Dihedral(0, 1, 2, 3).gradient(&coords);
        let sum = grads.iter().fold(Vector3::zeros(), |acc, (_, g)| acc + g);
        assert_abs_diff_eq!(sum.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bond_second_derivative() {
        // d²r/dx_a² along the bond vanishes, perpendicular components are 1/r.
        let coords = DVector::from_vec(vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        let hessian = InternalCoordinate::Bond(0, 1).second_derivative(&coords);
        assert_eq!(hessian.shape(), (6, 6));
        assert_abs_diff_eq!(hessian[(0, 0)], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(hessian[(1, 1)], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(hessian[(1, 4)], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_periodic_difference_wraps() {
        let dihedral = InternalCoordinate::Dihedral(0, 1, 2, 3);
        assert_abs_diff_eq!(dihedral.difference(-3.1, 3.1), 2.0 * PI - 6.2, epsilon = 1e-12);
        let bond = InternalCoordinate::Bond(0, 1);
        assert_abs_diff_eq!(bond.difference(-3.1, 3.1), -6.2, epsilon = 1e-12);
    }
}
