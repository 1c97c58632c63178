//! Approximate Hessian in the working coordinate space.
//!
//! The matrix starts from a diagonal force-constant guess and is refined by
//! secant updates (see [`hessian_update`](crate::hessian_update)) after every
//! accepted step. The step generator only ever sees its restriction to the
//! free subspace, `Uᵀ H U`.

use crate::config::{CoordinateKind, HessianSettings};
use crate::coordinates::CoordinateSystem;
use crate::hessian_update::{update_hessian_with_method, HessianUpdateMethod};
use crate::internal::CoordinateType;
use crate::linalg::{pseudo_inverse, symmetric_eigen_sorted, Eigenpairs, RANGE_TOLERANCE};
use log::debug;
use nalgebra::{DMatrix, DVector};

/// Symmetric approximate Hessian with its update rule.
#[derive(Debug, Clone)]
pub struct ApproximateHessian {
    matrix: DMatrix<f64>,
    method: HessianUpdateMethod,
    updates: usize,
}

impl ApproximateHessian {
    /// Wraps an explicit matrix, symmetrizing it.
    pub fn new(matrix: DMatrix<f64>, method: HessianUpdateMethod) -> Self {
        let matrix = (&matrix + matrix.transpose()) * 0.5;
        Self {
            matrix,
            method,
            updates: 0,
        }
    }

    /// Diagonal force-constant guess for the current coordinate system.
    ///
    /// Internal representation: `P D P` with `D` the per-type guesses and
    /// `P = B B⁺` the projector onto the non-redundant space. Cartesian
    /// representation: `B_intᵀ D B_int` plus the Cartesian diagonal floor.
    pub fn guess(system: &CoordinateSystem, coords: &DVector<f64>, settings: &HessianSettings) -> Self {
        let force_constant = |t: CoordinateType| match t {
            CoordinateType::Stretch => settings.stretch,
            CoordinateType::Bend => settings.bend,
            CoordinateType::Torsion => settings.torsion,
            CoordinateType::Cartesian => settings.cartesian,
        };

        let matrix = match system.kind() {
            CoordinateKind::Internal => {
                let diagonal = DVector::from_iterator(
                    system.dimension(),
                    system.coordinate_types().into_iter().map(force_constant),
                );
                let b = system.b_matrix(coords);
                let projector = &b * pseudo_inverse(&b, RANGE_TOLERANCE);
                &projector * DMatrix::from_diagonal(&diagonal) * &projector
            }
            CoordinateKind::Cartesian => {
                let primitives = system.primitives();
                let diagonal = DVector::from_iterator(
                    primitives.len(),
                    primitives.iter().map(|p| force_constant(p.coordinate_type())),
                );
                let b = system.primitive_b_matrix(coords);
                let n = coords.len();
                b.transpose() * DMatrix::from_diagonal(&diagonal) * &b
                    + DMatrix::identity(n, n) * settings.cartesian
            }
        };

        debug!(
            "Initial Hessian guess of dimension {} ({} update)",
            matrix.nrows(),
            settings.update
        );
        Self::new(matrix, settings.update)
    }

    /// Full working-space matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Update rule in use.
    pub fn method(&self) -> HessianUpdateMethod {
        self.method
    }

    /// Number of updates applied so far (skipped updates excluded).
    pub fn update_count(&self) -> usize {
        self.updates
    }

    /// Secant update with a working-space step and gradient change.
    pub fn update(&mut self, delta_q: &DVector<f64>, delta_g: &DVector<f64>) {
        let updated = update_hessian_with_method(&self.matrix, delta_q, delta_g, self.method);
        if updated != self.matrix {
            self.updates += 1;
        }
        self.matrix = updated;
    }

    /// Replaces the curvature along orthonormal `vectors` with measured
    /// Hessian-vector `products`.
    ///
    /// Symmetric block update `H + E Vᵀ + V Eᵀ - V (Vᵀ E) Vᵀ` with
    /// `E = AV - H V`; afterwards `H V = AV` exactly when `Vᵀ AV` is
    /// symmetric. Counts as one update per vector.
    pub fn block_update(&mut self, vectors: &DMatrix<f64>, products: &DMatrix<f64>) {
        if vectors.ncols() == 0 || products.iter().any(|x| !x.is_finite()) {
            return;
        }
        let error = products - &self.matrix * vectors;
        let projected = vectors.transpose() * &error;
        let matrix = &self.matrix + &error * vectors.transpose() + vectors * error.transpose()
            - vectors * projected * vectors.transpose();
        self.matrix = (&matrix + matrix.transpose()) * 0.5;
        self.updates += vectors.ncols();
    }

    /// Restriction to a free basis, `Uᵀ H U`.
    pub fn free_view(&self, free: &DMatrix<f64>) -> DMatrix<f64> {
        free.transpose() * &self.matrix * free
    }

    /// Eigenpairs of the free restriction, eigenvalues ascending.
    pub fn eigen_decompose(&self, free: &DMatrix<f64>) -> Eigenpairs {
        symmetric_eigen_sorted(&self.free_view(free))
    }

    /// Re-expresses the matrix after a coordinate rebuild.
    ///
    /// `H_new = (B_new⁺)ᵀ B_oldᵀ H B_old B_new⁺`, both B-matrices taken at
    /// the same configuration.
    pub fn reexpress(&mut self, b_old: &DMatrix<f64>, b_new: &DMatrix<f64>) {
        let overlap = b_old * pseudo_inverse(b_new, RANGE_TOLERANCE);
        let matrix = overlap.transpose() * &self.matrix * &overlap;
        self.matrix = (&matrix + matrix.transpose()) * 0.5;
    }
}
