//! Free-DOF basis of the working space.
//!
//! The working space splits into three orthogonal parts:
//!
//! - redundant directions (outside the range of `B`, or rigid-body motion in
//!   the Cartesian representation), which no geometry change can produce
//! - constrained directions, spanned by the working-space constraint
//!   gradients `∂r/∂q = C B⁺`
//! - free directions, the orthogonal complement of the constrained ones
//!   inside the non-redundant space
//!
//! Only the free part is optimized. The constrained part carries the Newton
//! correction that drives residuals back to zero.

use crate::constraints::ConstraintError;
use crate::coordinates::{CoordinateSystem, Linearization};
use crate::linalg::{orthogonal_complement, orthonormal_range, pseudo_inverse, RANGE_TOLERANCE};
use nalgebra::{DMatrix, DVector};

/// Orthonormal bases of the non-redundant, constrained and free subspaces.
#[derive(Debug, Clone)]
pub struct Basis {
    /// Non-redundant working space (working dimension × rank)
    pub nonredundant: DMatrix<f64>,
    /// Constrained directions
    pub constrained: DMatrix<f64>,
    /// Free directions, orthogonal to `constrained` inside `nonredundant`
    pub free: DMatrix<f64>,
    /// Constraint gradients in the working space, one row per constraint
    pub constraint_jacobian: DMatrix<f64>,
}

impl Basis {
    /// Builds all bases at `coords`.
    ///
    /// Fails with [`ConstraintError::NoFreeDegreesOfFreedom`] when nothing is
    /// left to optimize.
    pub fn build(
        system: &CoordinateSystem,
        coords: &DVector<f64>,
        linear: &Linearization,
    ) -> Result<Self, ConstraintError> {
        let nonredundant = system.nonredundant_basis(coords, linear);
        let constraint_jacobian = system.constraint_jacobian(coords, linear);
        let constrained = orthonormal_range(&constraint_jacobian.transpose(), RANGE_TOLERANCE);
        let free = orthogonal_complement(&nonredundant, &constrained, RANGE_TOLERANCE);

        if free.ncols() == 0 {
            return Err(ConstraintError::NoFreeDegreesOfFreedom {
                constraints: system.constraints().len(),
            });
        }

        Ok(Self {
            nonredundant,
            constrained,
            free,
            constraint_jacobian,
        })
    }

    /// Number of free degrees of freedom.
    pub fn free_dimension(&self) -> usize {
        self.free.ncols()
    }

    /// Components of a working-space vector in the free basis, `Uᵀ v`.
    pub fn to_free(&self, working: &DVector<f64>) -> DVector<f64> {
        self.free.transpose() * working
    }

    /// Working-space vector of free-basis components, `U s`.
    pub fn from_free(&self, free: &DVector<f64>) -> DVector<f64> {
        &self.free * free
    }

    /// Orthogonal projection onto the free subspace, `U Uᵀ v`.
    pub fn project(&self, working: &DVector<f64>) -> DVector<f64> {
        self.from_free(&self.to_free(working))
    }

    /// Linear step in the constrained subspace that cancels `residuals`.
    ///
    /// Least-squares solution `-U_c (J U_c)⁺ r`; zero when unconstrained.
    pub fn constraint_correction(&self, residuals: &DVector<f64>) -> DVector<f64> {
        let dim = self.free.nrows();
        if self.constrained.ncols() == 0 || residuals.is_empty() {
            return DVector::zeros(dim);
        }
        let reduced = &self.constraint_jacobian * &self.constrained;
        let components = pseudo_inverse(&reduced, RANGE_TOLERANCE) * residuals;
        -(&self.constrained * components)
    }
}
