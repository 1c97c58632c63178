//! Working coordinate system of the search.
//!
//! A [`CoordinateSystem`] owns the redundant set of primitive internal
//! coordinates generated from the connectivity of a configuration and maps
//! between Cartesian space and the working space of the optimizer:
//!
//! - values `q(x)` and the Wilson B-matrix `B = ∂q/∂x`
//! - gradients `g_q = B⁺ᵀ g_x` and Hessians `H_x = Bᵀ H_q B + Σ g_i ∂²q_i/∂x²`
//! - steps `Δq ↦ Δx` by the iterative back-transformation
//!   `x ← x + B⁺ (q_target - q(x))`
//!
//! In the [`Internal`](CoordinateKind::Internal) representation the working
//! coordinates are the primitives followed by the defining functions of every
//! constraint. In the [`Cartesian`](CoordinateKind::Cartesian) representation
//! they are the raw positions and the primitives are only used for the
//! initial Hessian guess.
//!
//! # Connectivity
//!
//! Two particles are bonded when `d_ij < bond_scale · (r_i + r_j)` with
//! tabulated covalent radii. Disconnected fragments are joined through their
//! closest pair so the primitives always span every internal degree of
//! freedom. Angles are generated for bond pairs sharing a particle unless
//! near-linear; dihedrals for each bond whose flanking angles are not
//! near-linear.

use crate::config::{CoordinateKind, CoordinateSettings};
use crate::constraints::{ConstraintError, ConstraintKind, ConstraintSet};
use crate::elements;
use crate::geometry::{position, Geometry};
use crate::internal::{CoordinateType, InternalCoordinate};
use crate::linalg::{orthogonal_complement, orthonormal_range, pseudo_inverse, wrap_angle, RANGE_TOLERANCE};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Vector3};
use std::collections::BTreeSet;
use thiserror::Error;

/// A back-transformation whose update grows past this multiple of the first
/// update is considered divergent.
const DIVERGENCE_FACTOR: f64 = 10.0;

/// Errors raised while building coordinates or realizing a step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinateError {
    /// The configuration has no particles.
    #[error("configuration contains no particles")]
    EmptyGeometry,
    /// Back-transformation reached its iteration cap.
    #[error("back-transformation did not converge in {iterations} iterations (last update {last_update:.3e})")]
    NotConverged {
        /// Iterations performed
        iterations: usize,
        /// Norm of the last Cartesian update
        last_update: f64,
    },
    /// Back-transformation updates grew instead of shrinking.
    #[error("back-transformation diverged at iteration {iteration} (update {update:.3e})")]
    Diverged {
        /// Iteration at which divergence was detected
        iteration: usize,
        /// Norm of the offending update
        update: f64,
    },
    /// A NaN or infinity appeared during the back-transformation.
    #[error("back-transformation produced non-finite coordinates")]
    NonFinite,
    /// Constraint polish after the back-transformation failed.
    #[error("constraint correction failed: {0}")]
    Constraint(#[from] ConstraintError),
}

/// Values and first derivatives of the working coordinates at one configuration.
#[derive(Debug, Clone)]
pub struct Linearization {
    /// Working coordinate values `q(x)`
    pub values: DVector<f64>,
    /// Wilson B-matrix `∂q/∂x` (working dimension × 3N)
    pub b_matrix: DMatrix<f64>,
    /// Pseudo-inverse of the B-matrix (3N × working dimension)
    pub b_inverse: DMatrix<f64>,
}

impl Linearization {
    /// Working-space gradient `g_q = B⁺ᵀ g_x`.
    pub fn working_gradient(&self, cartesian_gradient: &DVector<f64>) -> DVector<f64> {
        self.b_inverse.transpose() * cartesian_gradient
    }

    /// Cartesian gradient `g_x = Bᵀ g_q`.
    pub fn cartesian_gradient(&self, working_gradient: &DVector<f64>) -> DVector<f64> {
        self.b_matrix.transpose() * working_gradient
    }
}

/// Redundant working coordinates bound to one configuration and constraint set.
#[derive(Debug, Clone)]
pub struct CoordinateSystem {
    kind: CoordinateKind,
    settings: CoordinateSettings,
    num_atoms: usize,
    radii: Vec<f64>,
    constraints: ConstraintSet,
    primitives: Vec<InternalCoordinate>,
}

impl CoordinateSystem {
    /// Builds the primitive set for `geometry`.
    pub fn new(
        geometry: &Geometry,
        constraints: ConstraintSet,
        settings: &CoordinateSettings,
    ) -> Result<Self, CoordinateError> {
        if geometry.num_atoms == 0 {
            return Err(CoordinateError::EmptyGeometry);
        }

        let radii = geometry
            .elements
            .iter()
            .map(|symbol| {
                elements::covalent_radius(symbol).unwrap_or_else(|| {
                    warn!(
                        "No covalent radius for element '{}', using {}",
                        symbol,
                        elements::DEFAULT_COVALENT_RADIUS
                    );
                    elements::DEFAULT_COVALENT_RADIUS
                })
            })
            .collect();

        let mut system = Self {
            kind: settings.kind,
            settings: settings.clone(),
            num_atoms: geometry.num_atoms,
            radii,
            constraints,
            primitives: Vec::new(),
        };
        system.primitives = system.generate_primitives(&geometry.coords);
        debug!(
            "Built {} primitive internal coordinates ({} representation)",
            system.primitives.len(),
            system.kind
        );
        Ok(system)
    }

    /// Working representation.
    pub fn kind(&self) -> CoordinateKind {
        self.kind
    }

    /// Number of particles.
    pub fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    /// Primitive internal coordinates of the current set.
    pub fn primitives(&self) -> &[InternalCoordinate] {
        &self.primitives
    }

    /// Constraint set carried by the working coordinates.
    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    /// Dimension of the working space.
    pub fn dimension(&self) -> usize {
        match self.kind {
            CoordinateKind::Internal => self.primitives.len() + self.constraints.len(),
            CoordinateKind::Cartesian => 3 * self.num_atoms,
        }
    }

    /// Curvature class of every working coordinate, in order.
    pub fn coordinate_types(&self) -> Vec<CoordinateType> {
        match self.kind {
            CoordinateKind::Internal => self
                .primitives
                .iter()
                .map(InternalCoordinate::coordinate_type)
                .chain(self.constraints.iter().map(|c| match c.kind {
                    ConstraintKind::Bond { .. } => CoordinateType::Stretch,
                    ConstraintKind::Angle { .. } => CoordinateType::Bend,
                    ConstraintKind::Dihedral { .. } => CoordinateType::Torsion,
                    _ => CoordinateType::Cartesian,
                }))
                .collect(),
            CoordinateKind::Cartesian => vec![CoordinateType::Cartesian; 3 * self.num_atoms],
        }
    }

    /// Working coordinate values.
    pub fn values(&self, coords: &DVector<f64>) -> DVector<f64> {
        match self.kind {
            CoordinateKind::Internal => {
                let constraint_values = self.constraints.values(coords);
                DVector::from_iterator(
                    self.dimension(),
                    self.primitives
                        .iter()
                        .map(|p| p.value(coords))
                        .chain(constraint_values.iter().copied()),
                )
            }
            CoordinateKind::Cartesian => coords.clone(),
        }
    }

    /// Componentwise `new - old`, wrapping dihedral components into (-π, π].
    pub fn difference(&self, new: &DVector<f64>, old: &DVector<f64>) -> DVector<f64> {
        let mut diff = new - old;
        if self.kind == CoordinateKind::Internal {
            for (i, p) in self.primitives.iter().enumerate() {
                if p.is_periodic() {
                    diff[i] = wrap_angle(diff[i]);
                }
            }
            let offset = self.primitives.len();
            for (j, c) in self.constraints.iter().enumerate() {
                if matches!(c.kind, ConstraintKind::Dihedral { .. }) {
                    diff[offset + j] = wrap_angle(diff[offset + j]);
                }
            }
        }
        diff
    }

    /// B-matrix rows of the primitives only.
    pub fn primitive_b_matrix(&self, coords: &DVector<f64>) -> DMatrix<f64> {
        let mut b = DMatrix::zeros(self.primitives.len(), coords.len());
        for (row, primitive) in self.primitives.iter().enumerate() {
            for (atom, g) in primitive.gradient(coords) {
                for k in 0..3 {
                    b[(row, 3 * atom + k)] += g[k];
                }
            }
        }
        b
    }

    /// Wilson B-matrix of the working coordinates.
    pub fn b_matrix(&self, coords: &DVector<f64>) -> DMatrix<f64> {
        match self.kind {
            CoordinateKind::Internal => {
                let primitive = self.primitive_b_matrix(coords);
                let constraint = self.constraints.jacobian(coords);
                let np = primitive.nrows();
                let mut b = DMatrix::zeros(self.dimension(), coords.len());
                b.rows_mut(0, np).copy_from(&primitive);
                b.rows_mut(np, constraint.nrows()).copy_from(&constraint);
                b
            }
            CoordinateKind::Cartesian => DMatrix::identity(coords.len(), coords.len()),
        }
    }

    /// Values, B-matrix and its pseudo-inverse at `coords`.
    pub fn linearize(&self, coords: &DVector<f64>) -> Linearization {
        let b_matrix = self.b_matrix(coords);
        let b_inverse = match self.kind {
            CoordinateKind::Internal => pseudo_inverse(&b_matrix, RANGE_TOLERANCE),
            CoordinateKind::Cartesian => b_matrix.clone(),
        };
        Linearization {
            values: self.values(coords),
            b_matrix,
            b_inverse,
        }
    }

    /// Constraint Jacobian with respect to the working coordinates, `∂r/∂q = C B⁺`.
    pub fn constraint_jacobian(&self, coords: &DVector<f64>, linear: &Linearization) -> DMatrix<f64> {
        let c = self.constraints.jacobian(coords);
        match self.kind {
            CoordinateKind::Internal => c * &linear.b_inverse,
            CoordinateKind::Cartesian => c,
        }
    }

    /// Orthonormal basis of the non-redundant working space.
    ///
    /// For internal coordinates this is the range of `B`, which excludes rigid
    /// motion automatically. For Cartesian coordinates it is the complement of
    /// the rigid-body motions that leave every constraint unchanged.
    pub fn nonredundant_basis(&self, coords: &DVector<f64>, linear: &Linearization) -> DMatrix<f64> {
        match self.kind {
            CoordinateKind::Internal => orthonormal_range(&linear.b_matrix, RANGE_TOLERANCE),
            CoordinateKind::Cartesian => {
                let n = coords.len();
                let rigid = rigid_body_basis(
                    coords,
                    self.settings.project_translation,
                    self.settings.project_rotation,
                );
                let removed = if self.constraints.is_empty() || rigid.ncols() == 0 {
                    rigid
                } else {
                    // Rigid motions that move a constrained quantity are
                    // constrained directions, not redundancies.
                    let coupling = self.constraints.jacobian(coords) * &rigid;
                    let k = rigid.ncols();
                    let free = orthogonal_complement(
                        &DMatrix::identity(k, k),
                        &coupling.transpose(),
                        RANGE_TOLERANCE,
                    );
                    &rigid * free
                };
                orthogonal_complement(&DMatrix::identity(n, n), &removed, RANGE_TOLERANCE)
            }
        }
    }

    /// Realizes a working-space step as a new Cartesian configuration.
    ///
    /// Runs the iterative back-transformation towards `q(coords) + step` and
    /// then polishes constraint residuals with Cartesian Newton corrections.
    /// `coords` itself is never modified.
    pub fn realize(&self, coords: &DVector<f64>, step: &DVector<f64>) -> Result<DVector<f64>, CoordinateError> {
        let mut x = match self.kind {
            CoordinateKind::Internal => self.back_transform(coords, step)?,
            CoordinateKind::Cartesian => coords + step,
        };
        if !x.iter().all(|v| v.is_finite()) {
            return Err(CoordinateError::NonFinite);
        }

        let corrections = self
            .constraints
            .correct(&mut x, self.settings.max_correction_iterations)?;
        if corrections > 0 {
            debug!("Constraint polish converged in {} iterations", corrections);
        }
        Ok(x)
    }

    fn back_transform(&self, coords: &DVector<f64>, step: &DVector<f64>) -> Result<DVector<f64>, CoordinateError> {
        let target = self.values(coords) + step;
        let mut x = coords.clone();
        let mut first_update: Option<f64> = None;
        let mut last_update = f64::INFINITY;

        for iteration in 0..self.settings.max_backtransform_iterations {
            let residual = self.difference(&target, &self.values(&x));
            let b_inverse = pseudo_inverse(&self.b_matrix(&x), RANGE_TOLERANCE);
            let dx = b_inverse * residual;
            let update = dx.norm();

            if !update.is_finite() {
                return Err(CoordinateError::NonFinite);
            }
            match first_update {
                None => first_update = Some(update),
                Some(first) if update > DIVERGENCE_FACTOR * first.max(self.settings.backtransform_tolerance) => {
                    return Err(CoordinateError::Diverged { iteration, update });
                }
                Some(_) => {}
            }

            x += dx;
            last_update = update;
            if update < self.settings.backtransform_tolerance {
                debug!("Back-transformation converged in {} iterations", iteration + 1);
                return Ok(x);
            }
        }

        Err(CoordinateError::NotConverged {
            iterations: self.settings.max_backtransform_iterations,
            last_update,
        })
    }

    /// Whether the primitive set no longer matches the connectivity of `coords`.
    ///
    /// True when a bond formed or broke, an angle in the set became
    /// near-linear, or an excluded angle stopped being near-linear.
    pub fn needs_rebuild(&self, coords: &DVector<f64>) -> bool {
        let current: BTreeSet<_> = self.primitives.iter().copied().collect();
        let fresh: BTreeSet<_> = self.generate_primitives(coords).into_iter().collect();
        current != fresh
    }

    /// Regenerates the primitive set for `coords`.
    pub fn rebuild(&mut self, coords: &DVector<f64>) {
        let old = self.primitives.len();
        self.primitives = self.generate_primitives(coords);
        warn!(
            "Rebuilt internal coordinates: {} -> {} primitives",
            old,
            self.primitives.len()
        );
    }

    /// Cartesian Hessian from a working-space Hessian and gradient.
    ///
    /// Includes the curvature of the primitives, `Σ g_i ∂²q_i/∂x²`, so the
    /// result is exact for the given working-space data.
    pub fn cartesian_hessian(
        &self,
        coords: &DVector<f64>,
        working_hessian: &DMatrix<f64>,
        working_gradient: &DVector<f64>,
    ) -> DMatrix<f64> {
        let b = self.b_matrix(coords);
        let mut hessian = b.transpose() * working_hessian * &b;
        if self.kind == CoordinateKind::Internal {
            for (i, primitive) in self.primitives.iter().enumerate() {
                let atoms = primitive.atoms();
                let local = primitive.second_derivative(coords);
                for (a, &atom_a) in atoms.iter().enumerate() {
                    for (b_idx, &atom_b) in atoms.iter().enumerate() {
                        for k in 0..3 {
                            for l in 0..3 {
                                hessian[(3 * atom_a + k, 3 * atom_b + l)] +=
                                    working_gradient[i] * local[(3 * a + k, 3 * b_idx + l)];
                            }
                        }
                    }
                }
            }
        }
        hessian
    }

    fn generate_primitives(&self, coords: &DVector<f64>) -> Vec<InternalCoordinate> {
        let n = self.num_atoms;
        let linear = self.settings.linear_angle_radians();

        let mut bonds: BTreeSet<(usize, usize)> = perceive_bonds(coords, &self.radii, self.settings.bond_scale);
        for (i, j) in connect_fragments(coords, n, &bonds) {
            debug!("Joining fragments through {}-{}", i, j);
            bonds.insert((i, j));
        }

        let mut neighbors = vec![Vec::new(); n];
        for &(i, j) in &bonds {
            neighbors[i].push(j);
            neighbors[j].push(i);
        }

        let is_linear = |a: usize, b: usize, c: usize| {
            crate::internal::bond_angle(&position(coords, a), &position(coords, b), &position(coords, c))
                > linear
        };

        let mut primitives: Vec<InternalCoordinate> =
            bonds.iter().map(|&(i, j)| InternalCoordinate::Bond(i, j)).collect();

        for (b, adjacent) in neighbors.iter().enumerate() {
            for (x, &a) in adjacent.iter().enumerate() {
                for &c in &adjacent[x + 1..] {
                    let (a, c) = (a.min(c), a.max(c));
                    if is_linear(a, b, c) {
                        debug!("Skipping near-linear angle {}-{}-{}", a, b, c);
                    } else {
                        primitives.push(InternalCoordinate::Angle(a, b, c));
                    }
                }
            }
        }

        for &(b, c) in &bonds {
            for &a in &neighbors[b] {
                if a == c || is_linear(a, b, c) {
                    continue;
                }
                for &d in &neighbors[c] {
                    if d == b || d == a || is_linear(b, c, d) {
                        continue;
                    }
                    primitives.push(InternalCoordinate::Dihedral(a, b, c, d));
                }
            }
        }

        primitives
    }
}

/// Covalent bonds `(i, j)` with `i < j`.
pub fn perceive_bonds(coords: &DVector<f64>, radii: &[f64], bond_scale: f64) -> BTreeSet<(usize, usize)> {
    let n = radii.len();
    let mut bonds = BTreeSet::new();
    for i in 0..n {
        for j in (i + 1)..n {
            let d = (position(coords, j) - position(coords, i)).norm();
            if d < bond_scale * (radii[i] + radii[j]) {
                bonds.insert((i, j));
            }
        }
    }
    bonds
}

/// Extra bonds joining disconnected fragments through their closest pairs.
pub fn connect_fragments(
    coords: &DVector<f64>,
    num_atoms: usize,
    bonds: &BTreeSet<(usize, usize)>,
) -> Vec<(usize, usize)> {
    let mut fragments = DisjointSet::new(num_atoms);
    for &(i, j) in bonds {
        fragments.union(i, j);
    }

    let mut extra = Vec::new();
    while fragments.count() > 1 {
        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..num_atoms {
            for j in (i + 1)..num_atoms {
                if fragments.find(i) == fragments.find(j) {
                    continue;
                }
                let d = (position(coords, j) - position(coords, i)).norm();
                if best.map_or(true, |(b, _, _)| d < b) {
                    best = Some((d, i, j));
                }
            }
        }
        match best {
            Some((_, i, j)) => {
                fragments.union(i, j);
                extra.push((i, j));
            }
            None => break,
        }
    }
    extra
}

/// Orthonormal basis of rigid translations and rotations about the centroid.
///
/// Linear and single-particle configurations yield fewer rotation vectors.
pub fn rigid_body_basis(coords: &DVector<f64>, translation: bool, rotation: bool) -> DMatrix<f64> {
    let n = coords.len() / 3;
    let mut vectors: Vec<DVector<f64>> = Vec::new();

    if translation {
        for axis in 0..3 {
            let mut v = DVector::zeros(3 * n);
            for i in 0..n {
                v[3 * i + axis] = 1.0;
            }
            vectors.push(v);
        }
    }

    if rotation && n > 1 {
        let centroid = (0..n).fold(Vector3::zeros(), |acc, i| acc + position(coords, i)) / n as f64;
        for axis in 0..3 {
            let mut e = Vector3::zeros();
            e[axis] = 1.0;
            let mut v = DVector::zeros(3 * n);
            for i in 0..n {
                let r = e.cross(&(position(coords, i) - centroid));
                v.fixed_rows_mut::<3>(3 * i).copy_from(&r);
            }
            vectors.push(v);
        }
    }

    if vectors.is_empty() {
        return DMatrix::zeros(3 * n, 0);
    }
    orthonormal_range(&DMatrix::from_columns(&vectors), RANGE_TOLERANCE)
}

/// Union-find over particle indices.
struct DisjointSet {
    parent: Vec<usize>,
    components: usize,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            components: n,
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = i;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
            self.components -= 1;
        }
    }

    fn count(&self) -> usize {
        self.components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::Constraint;
    use approx::assert_abs_diff_eq;

    fn water() -> Geometry {
        Geometry::new(
            vec!["O".into(), "H".into(), "H".into()],
            vec![0.0, 0.0, 0.117, 0.0, 0.757, -0.469, 0.0, -0.757, -0.469],
        )
    }

    fn hydrogen_peroxide() -> Geometry {
        Geometry::new(
            vec!["O".into(), "O".into(), "H".into(), "H".into()],
            vec![
                0.0, 0.734, -0.053, 0.0, -0.734, -0.053, 0.839, 0.880, 0.422, -0.839, -0.880, 0.422,
            ],
        )
    }

    fn system(geometry: &Geometry, constraints: Vec<Constraint>, kind: CoordinateKind) -> CoordinateSystem {
        let settings = CoordinateSettings {
            kind,
            ..CoordinateSettings::default()
        };
        let set = ConstraintSet::new(constraints, geometry).unwrap();
        CoordinateSystem::new(geometry, set, &settings).unwrap()
    }

    #[test]
    fn test_water_primitives() {
        let geometry = water();
        let cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        let p = cs.primitives();
        assert!(p.contains(&InternalCoordinate::Bond(0, 1)));
        assert!(p.contains(&InternalCoordinate::Bond(0, 2)));
        assert!(p.contains(&InternalCoordinate::Angle(1, 0, 2)));
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_peroxide_has_one_torsion() {
        let geometry = hydrogen_peroxide();
        let cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        let torsions = cs
            .primitives()
            .iter()
            .filter(|p| matches!(p, InternalCoordinate::Dihedral(..)))
            .count();
        assert_eq!(torsions, 1);
        let lin = cs.linearize(&geometry.coords);
        // 3N - 6 internal degrees of freedom.
        assert_eq!(cs.nonredundant_basis(&geometry.coords, &lin).ncols(), 6);
    }

    #[test]
    fn test_fragments_are_joined() {
        let geometry = Geometry::new(
            vec!["H".into(), "H".into(), "H".into(), "H".into()],
            vec![0.0, 0.0, 0.0, 0.74, 0.0, 0.0, 0.2, 3.0, 0.0, 0.9, 3.1, 0.4],
        );
        let bonds = perceive_bonds(&geometry.coords, &[0.31; 4], 1.25);
        assert_eq!(bonds.len(), 2);
        let extra = connect_fragments(&geometry.coords, 4, &bonds);
        assert_eq!(extra, vec![(0, 2)]);
    }

    #[test]
    fn test_linear_angle_excluded() {
        let geometry = Geometry::new(
            vec!["O".into(), "C".into(), "O".into()],
            vec![-1.16, 0.0, 0.0, 0.0, 0.0, 0.0, 1.16, 0.0, 0.0],
        );
        let cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        assert!(cs
            .primitives()
            .iter()
            .all(|p| !matches!(p, InternalCoordinate::Angle(..))));
    }

    #[test]
    fn test_working_gradient_round_trip() {
        let geometry = water();
        let cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        let lin = cs.linearize(&geometry.coords);
        // A gradient of a function of the internals lies in the row space of B.
        let g_q = DVector::from_vec(vec![0.1, -0.2, 0.05]);
        let g_x = lin.cartesian_gradient(&g_q);
        let back = lin.working_gradient(&g_x);
        assert_abs_diff_eq!((back - g_q).norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_realize_reaches_target_internals() {
        let geometry = water();
        let cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        let step = DVector::from_vec(vec![0.05, -0.03, 0.1]);
        let x = cs.realize(&geometry.coords, &step).unwrap();
        let dq = cs.difference(&cs.values(&x), &cs.values(&geometry.coords));
        assert_abs_diff_eq!((dq - step).norm(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_realize_keeps_constraint() {
        let geometry = hydrogen_peroxide();
        let constraints = vec![Constraint::at_current(
            ConstraintKind::Dihedral { atoms: (2, 0, 1, 3) },
            &geometry,
        )
        .unwrap()];
        let cs = system(&geometry, constraints, CoordinateKind::Internal);
        let lin = cs.linearize(&geometry.coords);
        let basis = cs.nonredundant_basis(&geometry.coords, &lin);
        // Move along an arbitrary direction of the non-redundant space but
        // with the constrained component removed.
        let drdq = cs.constraint_jacobian(&geometry.coords, &lin);
        let ucons = orthonormal_range(&drdq.transpose(), RANGE_TOLERANCE);
        let ufree = orthogonal_complement(&basis, &ucons, RANGE_TOLERANCE);
        let step = &ufree * DVector::from_element(ufree.ncols(), 0.02);
        let x = cs.realize(&geometry.coords, &step).unwrap();
        assert!(cs.constraints().residuals(&x).amax() < 1e-6);
    }

    #[test]
    fn test_cartesian_basis_removes_rigid_motion() {
        let geometry = water();
        let cs = system(&geometry, Vec::new(), CoordinateKind::Cartesian);
        let lin = cs.linearize(&geometry.coords);
        assert_eq!(cs.nonredundant_basis(&geometry.coords, &lin).ncols(), 3);
    }

    #[test]
    fn test_cartesian_basis_with_fixed_atom() {
        let geometry = hydrogen_peroxide();
        let constraints = Constraint::fix_atom(&geometry, 0).unwrap();
        let cs = system(&geometry, constraints, CoordinateKind::Cartesian);
        let lin = cs.linearize(&geometry.coords);
        // Rotations about the fixed atom stay redundant; translations become constrained.
        assert_eq!(cs.nonredundant_basis(&geometry.coords, &lin).ncols(), 9);
    }

    #[test]
    fn test_rigid_basis_of_linear_molecule() {
        let coords = DVector::from_vec(vec![-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_eq!(rigid_body_basis(&coords, true, true).ncols(), 5);
        assert_eq!(rigid_body_basis(&coords, true, false).ncols(), 3);
    }

    #[test]
    fn test_rebuild_detection_on_bond_formation() {
        let geometry = water();
        let mut cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        assert!(!cs.needs_rebuild(&geometry.coords));
        // Bring the hydrogens within bonding distance of each other.
        let mut squeezed = geometry.coords.clone();
        squeezed[7] = 0.5;
        squeezed[4] = 0.2;
        assert!(cs.needs_rebuild(&squeezed));
        cs.rebuild(&squeezed);
        assert!(cs.primitives().contains(&InternalCoordinate::Bond(1, 2)));
        assert!(!cs.needs_rebuild(&squeezed));
    }

    #[test]
    fn test_cartesian_hessian_of_harmonic_bond() {
        let geometry = Geometry::new(vec!["H".into(), "H".into()], vec![0.0, 0.0, 0.0, 0.9, 0.2, -0.1]);
        let cs = system(&geometry, Vec::new(), CoordinateKind::Internal);
        let k = 0.7;
        let r0 = 0.74;
        let r = cs.values(&geometry.coords)[0];
        let h_q = DMatrix::from_element(1, 1, k);
        let g_q = DVector::from_element(1, k * (r - r0));
        let h_x = cs.cartesian_hessian(&geometry.coords, &h_q, &g_q);

        let gradient = |x: &DVector<f64>| {
            let lin = cs.linearize(x);
            let r = lin.values[0];
            lin.cartesian_gradient(&DVector::from_element(1, k * (r - r0)))
        };
        let h = 1e-6;
        for j in 0..6 {
            let mut plus = geometry.coords.clone();
            let mut minus = geometry.coords.clone();
            plus[j] += h;
            minus[j] -= h;
            let column = (gradient(&plus) - gradient(&minus)) / (2.0 * h);
            for i in 0..6 {
                assert_abs_diff_eq!(h_x[(i, j)], column[i], epsilon = 1e-5);
            }
        }
    }
}
