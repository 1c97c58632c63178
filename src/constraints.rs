//! Geometric constraints expressed as coordinate functions with targets.
//!
//! Every constraint is a scalar function `c(x)` of the Cartesian coordinates
//! together with a target value and a tolerance. The search keeps
//! `r(x) = c(x) - target` at zero by two mechanisms:
//!
//! 1. the constraint gradients are projected out of the working space (see
//!    [`projection`](crate::projection)), so steps never move along them;
//! 2. any drift left by the nonlinear step realization is removed by a Newton
//!    correction `Δx = -C⁺ r` (see [`ConstraintSet::correct`]).
//!
//! # Supported constraints
//!
//! | Kind | Function | Target unit |
//! |------|----------|-------------|
//! | `Position` | one Cartesian component of one particle | length |
//! | `Bond` | distance between two particles | length |
//! | `Angle` | valence angle a-b-c | radians |
//! | `Dihedral` | torsion a-b-c-d | radians |
//! | `CenterOfMass` | one component of the center of mass | length |
//! | `Rotation` | linearized rotation about the reference geometry | dimensionless |
//!
//! The rotation coordinates are the Eckart conditions
//! `Σ m_i a_i × (x_i - x_i⁰) / √(Σ m_i |a_i|²)` with `a_i` the reference
//! position relative to the reference center of mass; they are linear in `x`
//! and their target is zero.

use crate::geometry::{position, Geometry};
use crate::internal::{
    angle_gradient, bond_angle, bond_gradient, bond_length, dihedral_angle, dihedral_gradient,
};
use crate::linalg::{pseudo_inverse, wrap_angle, RANGE_TOLERANCE};
use nalgebra::{DMatrix, DVector, Vector3};
use std::fmt;
use thiserror::Error;

/// Default absolute tolerance on a constraint residual.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Fraction of the tolerance the Newton correction aims for.
const CORRECTION_FRACTION: f64 = 1e-2;

/// Errors detected while validating or enforcing constraints.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    /// A particle index does not exist in the configuration.
    #[error("constraint {constraint} references particle {index}, but the system has {num_atoms} particles")]
    AtomOutOfRange {
        /// Position of the offending constraint in the declared list
        constraint: usize,
        /// Offending particle index
        index: usize,
        /// Number of particles in the configuration
        num_atoms: usize,
    },
    /// The same particle appears twice in one constraint.
    #[error("constraint {constraint} uses particle {index} more than once")]
    RepeatedAtom {
        /// Position of the offending constraint in the declared list
        constraint: usize,
        /// Repeated particle index
        index: usize,
    },
    /// Tolerance is zero, negative or not finite.
    #[error("constraint {constraint} has invalid tolerance {tolerance}")]
    InvalidTolerance {
        /// Position of the offending constraint in the declared list
        constraint: usize,
        /// Declared tolerance
        tolerance: f64,
    },
    /// Target value is not finite.
    #[error("constraint {constraint} has non-finite target {target}")]
    NonFiniteTarget {
        /// Position of the offending constraint in the declared list
        constraint: usize,
        /// Declared target
        target: f64,
    },
    /// Constraints and rigid-body removal leave nothing to optimize.
    #[error("system is over-constrained: {constraints} constraints leave no free degrees of freedom")]
    NoFreeDegreesOfFreedom {
        /// Number of declared constraints
        constraints: usize,
    },
    /// Newton correction did not bring every residual within tolerance.
    #[error("constraint correction did not converge (max violation {residual:.3e})")]
    CorrectionFailed {
        /// Largest remaining violation relative to its tolerance
        residual: f64,
    },
}

/// Cartesian axis selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// x component
    X,
    /// y component
    Y,
    /// z component
    Z,
}

impl Axis {
    /// All three axes in order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Component index (0, 1 or 2).
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    fn unit(self) -> Vector3<f64> {
        let mut e = Vector3::zeros();
        e[self.index()] = 1.0;
        e
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        write!(f, "{}", name)
    }
}

/// The constrained function and the particles it involves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstraintKind {
    /// One Cartesian component of one particle
    Position {
        /// Particle index
        atom: usize,
        /// Component
        axis: Axis,
    },
    /// Distance between two particles
    Bond {
        /// Particle indices
        atoms: (usize, usize),
    },
    /// Valence angle with the vertex at the middle particle
    Angle {
        /// Particle indices
        atoms: (usize, usize, usize),
    },
    /// Torsion about the middle two particles
    Dihedral {
        /// Particle indices
        atoms: (usize, usize, usize, usize),
    },
    /// One component of the center of mass
    CenterOfMass {
        /// Component
        axis: Axis,
    },
    /// One component of the overall (linearized) rotation
    Rotation {
        /// Rotation axis
        axis: Axis,
    },
}

impl ConstraintKind {
    /// Particle indices named by the constraint (empty for collective ones).
    pub fn atoms(&self) -> Vec<usize> {
        match *self {
            Self::Position { atom, .. } => vec![atom],
            Self::Bond { atoms: (a, b) } => vec![a, b],
            Self::Angle { atoms: (a, b, c) } => vec![a, b, c],
            Self::Dihedral { atoms: (a, b, c, d) } => vec![a, b, c, d],
            Self::CenterOfMass { .. } | Self::Rotation { .. } => Vec::new(),
        }
    }

    fn is_periodic(&self) -> bool {
        matches!(self, Self::Dihedral { .. })
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position { atom, axis } => write!(f, "position {}({})", axis, atom),
            Self::Bond { atoms: (a, b) } => write!(f, "bond {}-{}", a, b),
            Self::Angle { atoms: (a, b, c) } => write!(f, "angle {}-{}-{}", a, b, c),
            Self::Dihedral { atoms: (a, b, c, d) } => {
                write!(f, "dihedral {}-{}-{}-{}", a, b, c, d)
            }
            Self::CenterOfMass { axis } => write!(f, "center of mass {}", axis),
            Self::Rotation { axis } => write!(f, "rotation {}", axis),
        }
    }
}

/// A constraint: function, target value and tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constraint {
    /// Constrained function
    pub kind: ConstraintKind,
    /// Target value (length, radians, or 0 for rotations)
    pub target: f64,
    /// Largest acceptable absolute residual
    pub tolerance: f64,
}

impl Constraint {
    /// Constraint with an explicit target and the default tolerance.
    pub fn new(kind: ConstraintKind, target: f64) -> Self {
        Self {
            kind,
            target,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Replace the tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Fixed bond length.
    pub fn bond(a: usize, b: usize, target: f64) -> Self {
        Self::new(ConstraintKind::Bond { atoms: (a, b) }, target)
    }

    /// Fixed angle a-b-c (radians).
    pub fn angle(a: usize, b: usize, c: usize, target: f64) -> Self {
        Self::new(ConstraintKind::Angle { atoms: (a, b, c) }, target)
    }

    /// Fixed dihedral a-b-c-d (radians).
    pub fn dihedral(a: usize, b: usize, c: usize, d: usize, target: f64) -> Self {
        Self::new(ConstraintKind::Dihedral { atoms: (a, b, c, d) }, target)
    }

    /// Constraint whose target is its value in `geometry`.
    ///
    /// Rotation constraints always target zero (the reference orientation).
    /// Particle indices are checked before anything is evaluated; errors
    /// report the constraint as number 0.
    pub fn at_current(kind: ConstraintKind, geometry: &Geometry) -> Result<Self, ConstraintError> {
        validate(0, &Self::new(kind, 0.0), geometry.num_atoms)?;
        let target = match kind {
            ConstraintKind::Rotation { .. } => 0.0,
            _ => evaluate_fixed(&kind, &geometry.coords, &geometry.masses),
        };
        Ok(Self::new(kind, target))
    }

    /// Three position constraints freezing one particle where it is.
    pub fn fix_atom(geometry: &Geometry, atom: usize) -> Result<Vec<Self>, ConstraintError> {
        Axis::ALL
            .iter()
            .map(|&axis| Self::at_current(ConstraintKind::Position { atom, axis }, geometry))
            .collect()
    }

    /// Three constraints freezing the center of mass where it is.
    pub fn fix_center_of_mass(geometry: &Geometry) -> Vec<Self> {
        let com = geometry.center_of_mass();
        Axis::ALL
            .iter()
            .map(|&axis| Self::new(ConstraintKind::CenterOfMass { axis }, com[axis.index()]))
            .collect()
    }

    /// Three constraints freezing the overall orientation.
    pub fn fix_rotation() -> Vec<Self> {
        Axis::ALL
            .iter()
            .map(|&axis| Self::new(ConstraintKind::Rotation { axis }, 0.0))
            .collect()
    }
}

/// Value of every constraint kind that does not need a reference geometry.
fn evaluate_fixed(kind: &ConstraintKind, coords: &DVector<f64>, masses: &[f64]) -> f64 {
    match *kind {
        ConstraintKind::Position { atom, axis } => coords[3 * atom + axis.index()],
        ConstraintKind::Bond { atoms: (a, b) } => {
            bond_length(&position(coords, a), &position(coords, b))
        }
        ConstraintKind::Angle { atoms: (a, b, c) } => bond_angle(
            &position(coords, a),
            &position(coords, b),
            &position(coords, c),
        ),
        ConstraintKind::Dihedral { atoms: (a, b, c, d) } => dihedral_angle(
            &position(coords, a),
            &position(coords, b),
            &position(coords, c),
            &position(coords, d),
        ),
        ConstraintKind::CenterOfMass { axis } => {
            crate::geometry::center_of_mass(coords, masses)[axis.index()]
        }
        ConstraintKind::Rotation { .. } => 0.0,
    }
}

/// A validated, immutable set of constraints bound to one configuration.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    constraints: Vec<Constraint>,
    masses: Vec<f64>,
    reference: DVector<f64>,
    reference_com: Vector3<f64>,
    rotation_norm: f64,
}

impl ConstraintSet {
    /// Validate `constraints` against `geometry` and freeze them.
    ///
    /// The geometry also serves as the reference orientation for rotation
    /// constraints.
    pub fn new(constraints: Vec<Constraint>, geometry: &Geometry) -> Result<Self, ConstraintError> {
        for (i, constraint) in constraints.iter().enumerate() {
            validate(i, constraint, geometry.num_atoms)?;
        }

        let reference = geometry.coords.clone();
        let reference_com = geometry.center_of_mass();
        let moment: f64 = geometry
            .masses
            .iter()
            .enumerate()
            .map(|(i, m)| m * (position(&reference, i) - reference_com).norm_squared())
            .sum();
        let rotation_norm = if moment > f64::EPSILON { moment.sqrt() } else { 1.0 };

        Ok(Self {
            constraints,
            masses: geometry.masses.clone(),
            reference,
            reference_com,
            rotation_norm,
        })
    }

    /// An empty set for a configuration.
    pub fn unconstrained(geometry: &Geometry) -> Self {
        Self {
            constraints: Vec::new(),
            masses: geometry.masses.clone(),
            reference: geometry.coords.clone(),
            reference_com: geometry.center_of_mass(),
            rotation_norm: 1.0,
        }
    }

    /// Number of constraints.
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Iterate over the constraints in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    /// Whether any constraint pins the frame (position, center of mass or rotation).
    pub fn fixes_frame(&self) -> bool {
        self.constraints.iter().any(|c| {
            matches!(
                c.kind,
                ConstraintKind::Position { .. }
                    | ConstraintKind::CenterOfMass { .. }
                    | ConstraintKind::Rotation { .. }
            )
        })
    }

    /// Current value of each constraint function.
    pub fn values(&self, coords: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.constraints.len(),
            self.constraints.iter().map(|c| self.value(&c.kind, coords)),
        )
    }

    /// Value of one constraint function.
    pub fn value(&self, kind: &ConstraintKind, coords: &DVector<f64>) -> f64 {
        match *kind {
            ConstraintKind::Rotation { axis } => {
                let e = axis.unit();
                let mut total = 0.0;
                for (i, m) in self.masses.iter().enumerate() {
                    let a = position(&self.reference, i) - self.reference_com;
                    let d = position(coords, i) - position(&self.reference, i);
                    total += m * d.dot(&e.cross(&a));
                }
                total / self.rotation_norm
            }
            _ => evaluate_fixed(kind, coords, &self.masses),
        }
    }

    /// Residuals `c(x) - target`, wrapped into (-π, π] for dihedrals.
    pub fn residuals(&self, coords: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.constraints.len(),
            self.constraints.iter().map(|c| {
                let r = self.value(&c.kind, coords) - c.target;
                if c.kind.is_periodic() {
                    wrap_angle(r)
                } else {
                    r
                }
            }),
        )
    }

    /// Largest residual measured in units of its tolerance.
    pub fn max_violation(&self, coords: &DVector<f64>) -> f64 {
        self.residuals(coords)
            .iter()
            .zip(self.constraints.iter())
            .fold(0.0, |acc, (r, c)| acc.max(r.abs() / c.tolerance))
    }

    /// Whether every residual is within its tolerance.
    pub fn satisfied(&self, coords: &DVector<f64>) -> bool {
        self.max_violation(coords) <= 1.0
    }

    /// Gradient of one constraint function with respect to all coordinates.
    pub fn gradient(&self, kind: &ConstraintKind, coords: &DVector<f64>) -> DVector<f64> {
        let mut grad = DVector::zeros(coords.len());
        let mut scatter = |atom: usize, g: &Vector3<f64>| {
            for k in 0..3 {
                grad[3 * atom + k] += g[k];
            }
        };

        match *kind {
            ConstraintKind::Position { atom, axis } => scatter(atom, &axis.unit()),
            ConstraintKind::Bond { atoms: (a, b) } => {
                let [ga, gb] = bond_gradient(&position(coords, a), &position(coords, b));
                scatter(a, &ga);
                scatter(b, &gb);
            }
            ConstraintKind::Angle { atoms: (a, b, c) } => {
                let [ga, gb, gc] = angle_gradient(
                    &position(coords, a),
                    &position(coords, b),
                    &position(coords, c),
                );
                scatter(a, &ga);
                scatter(b, &gb);
                scatter(c, &gc);
            }
            ConstraintKind::Dihedral { atoms: (a, b, c, d) } => {
                let [ga, gb, gc, gd] = dihedral_gradient(
                    &position(coords, a),
                    &position(coords, b),
                    &position(coords, c),
                    &position(coords, d),
                );
                scatter(a, &ga);
                scatter(b, &gb);
                scatter(c, &gc);
                scatter(d, &gd);
            }
            ConstraintKind::CenterOfMass { axis } => {
                let total: f64 = self.masses.iter().sum();
                for (i, m) in self.masses.iter().enumerate() {
                    scatter(i, &(axis.unit() * (m / total)));
                }
            }
            ConstraintKind::Rotation { axis } => {
                let e = axis.unit();
                for (i, m) in self.masses.iter().enumerate() {
                    let a = position(&self.reference, i) - self.reference_com;
                    scatter(i, &(e.cross(&a) * (m / self.rotation_norm)));
                }
            }
        }
        grad
    }

    /// Cartesian Jacobian `C[i, j] = ∂c_i/∂x_j`.
    pub fn jacobian(&self, coords: &DVector<f64>) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(self.constraints.len(), coords.len());
        for (i, constraint) in self.constraints.iter().enumerate() {
            let grad = self.gradient(&constraint.kind, coords);
            jacobian.set_row(i, &grad.transpose());
        }
        jacobian
    }

    /// Newton correction of constraint drift in Cartesian space.
    ///
    /// Repeats the minimum-norm update `Δx = -C⁺ r` until every residual is a
    /// small fraction of its tolerance. Returns the number of iterations used.
    pub fn correct(&self, coords: &mut DVector<f64>, max_iterations: usize) -> Result<usize, ConstraintError> {
        if self.constraints.is_empty() {
            return Ok(0);
        }

        for iteration in 0..max_iterations {
            if self.max_violation(coords) <= CORRECTION_FRACTION {
                return Ok(iteration);
            }
            let residuals = self.residuals(coords);
            let jacobian = self.jacobian(coords);
            let delta = pseudo_inverse(&jacobian, RANGE_TOLERANCE) * residuals;
            if !delta.iter().all(|v| v.is_finite()) {
                break;
            }
            *coords -= delta;
        }

        let violation = self.max_violation(coords);
        if violation <= CORRECTION_FRACTION {
            Ok(max_iterations)
        } else {
            Err(ConstraintError::CorrectionFailed {
                residual: violation,
            })
        }
    }
}

fn validate(index: usize, constraint: &Constraint, num_atoms: usize) -> Result<(), ConstraintError> {
    if !(constraint.tolerance.is_finite() && constraint.tolerance > 0.0) {
        return Err(ConstraintError::InvalidTolerance {
            constraint: index,
            tolerance: constraint.tolerance,
        });
    }
    if !constraint.target.is_finite() {
        return Err(ConstraintError::NonFiniteTarget {
            constraint: index,
            target: constraint.target,
        });
    }

    let atoms = constraint.kind.atoms();
    for (k, &atom) in atoms.iter().enumerate() {
        if atom >= num_atoms {
            return Err(ConstraintError::AtomOutOfRange {
                constraint: index,
                index: atom,
                num_atoms,
            });
        }
        if atoms[..k].contains(&atom) {
            return Err(ConstraintError::RepeatedAtom {
                constraint: index,
                index: atom,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn butane_like() -> Geometry {
        Geometry::new(
            vec!["C".into(), "C".into(), "C".into(), "C".into()],
            vec![
                0.1, 1.2, -0.3, 0.0, 0.0, 0.0, 1.4, 0.1, 0.2, 1.7, -0.4, 1.3,
            ],
        )
    }

    #[test]
    fn test_at_current_has_zero_residual() {
        let geometry = butane_like();
        let constraints = vec![
            Constraint::at_current(ConstraintKind::Bond { atoms: (0, 1) }, &geometry).unwrap(),
            Constraint::at_current(ConstraintKind::Angle { atoms: (0, 1, 2) }, &geometry).unwrap(),
            Constraint::at_current(ConstraintKind::Dihedral { atoms: (0, 1, 2, 3) }, &geometry).unwrap(),
            Constraint::at_current(ConstraintKind::CenterOfMass { axis: Axis::Y }, &geometry).unwrap(),
        ];
        let set = ConstraintSet::new(constraints, &geometry).unwrap();
        assert_abs_diff_eq!(set.residuals(&geometry.coords).norm(), 0.0, epsilon = 1e-12);
        assert!(set.satisfied(&geometry.coords));
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let geometry = butane_like();
        let mut constraints = Constraint::fix_rotation();
        constraints.push(Constraint::dihedral(0, 1, 2, 3, 0.5));
        constraints.push(Constraint::angle(1, 2, 3, 1.9));
        constraints.extend(Constraint::fix_center_of_mass(&geometry));
        let set = ConstraintSet::new(constraints, &geometry).unwrap();

        let mut coords = geometry.coords.clone();
        coords[4] += 0.05;
        coords[9] -= 0.07;
        let jacobian = set.jacobian(&coords);
        let h = 1e-6;
        for j in 0..coords.len() {
            let mut plus = coords.clone();
            let mut minus = coords.clone();
            plus[j] += h;
            minus[j] -= h;
            let numeric = (set.residuals(&plus) - set.residuals(&minus)) / (2.0 * h);
            for i in 0..set.len() {
                assert_abs_diff_eq!(jacobian[(i, j)], numeric[i], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_rotation_value_vanishes_for_translation() {
        let geometry = butane_like();
        let set = ConstraintSet::new(Constraint::fix_rotation(), &geometry).unwrap();
        let moved = geometry.translated(&Vector3::new(0.3, -0.2, 0.9));
        assert_abs_diff_eq!(set.residuals(&moved.coords).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_correct_restores_targets() {
        let geometry = butane_like();
        let constraints = vec![
            Constraint::bond(0, 1, 1.30),
            Constraint::angle(0, 1, 2, 1.70),
        ];
        let set = ConstraintSet::new(constraints, &geometry).unwrap();
        let mut coords = geometry.coords.clone();
        set.correct(&mut coords, 50).unwrap();
        let residuals = set.residuals(&coords);
        assert!(residuals.iter().all(|r| r.abs() < 1e-8));
    }

    #[test]
    fn test_invalid_constraints_rejected() {
        let geometry = butane_like();
        let out_of_range = ConstraintSet::new(vec![Constraint::bond(0, 7, 1.0)], &geometry);
        assert!(matches!(
            out_of_range,
            Err(ConstraintError::AtomOutOfRange { index: 7, .. })
        ));

        let repeated = ConstraintSet::new(vec![Constraint::angle(0, 1, 0, 1.0)], &geometry);
        assert!(matches!(repeated, Err(ConstraintError::RepeatedAtom { index: 0, .. })));

        let tolerance =
            ConstraintSet::new(vec![Constraint::bond(0, 1, 1.0).with_tolerance(0.0)], &geometry);
        assert!(matches!(tolerance, Err(ConstraintError::InvalidTolerance { .. })));

        let target = ConstraintSet::new(vec![Constraint::bond(0, 1, f64::NAN)], &geometry);
        assert!(matches!(target, Err(ConstraintError::NonFiniteTarget { .. })));
    }

    #[test]
    fn test_fix_atom_expands_to_three_components() {
        let geometry = butane_like();
        let fixed = Constraint::fix_atom(&geometry, 2).unwrap();
        assert_eq!(fixed.len(), 3);
        assert_abs_diff_eq!(fixed[0].target, 1.4);
        assert_abs_diff_eq!(fixed[2].target, 0.2);
        let set = ConstraintSet::new(fixed, &geometry).unwrap();
        assert!(set.fixes_frame());
    }

    #[test]
    fn test_current_value_constructors_check_indices() {
        let geometry = butane_like();
        let bond = Constraint::at_current(ConstraintKind::Bond { atoms: (0, 5) }, &geometry);
        assert_eq!(
            bond.unwrap_err(),
            ConstraintError::AtomOutOfRange {
                constraint: 0,
                index: 5,
                num_atoms: 4
            }
        );

        let repeated = Constraint::at_current(ConstraintKind::Angle { atoms: (1, 2, 1) }, &geometry);
        assert!(matches!(repeated, Err(ConstraintError::RepeatedAtom { index: 1, .. })));

        assert!(matches!(
            Constraint::fix_atom(&geometry, 4),
            Err(ConstraintError::AtomOutOfRange { index: 4, .. })
        ));
    }
}
