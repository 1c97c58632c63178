//! Termination criteria and stationary-point classification.
//!
//! Both checks are pure functions of their inputs, so repeating them on the
//! same iteration state always gives the same answer.

use crate::config::ConvergenceSettings;
use crate::linalg::{max_abs, Eigenpairs};
use nalgebra::DVector;

/// Result of the force and constraint test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceStatus {
    /// Largest absolute component of the projected Cartesian gradient
    pub max_force: f64,
    /// `max_force` is below the threshold
    pub force_converged: bool,
    /// Largest constraint residual relative to its tolerance
    pub max_constraint_violation: f64,
    /// Every residual is within tolerance
    pub constraints_satisfied: bool,
}

impl ConvergenceStatus {
    /// Both criteria are met.
    pub fn is_converged(&self) -> bool {
        self.force_converged && self.constraints_satisfied
    }
}

/// Kind of stationary point reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationaryType {
    /// Exactly one negative free eigenvalue, on the tracked mode
    Saddle,
    /// Minimum, higher-order saddle or tracked mode with non-negative curvature
    Other,
}

/// Force, constraint and curvature checks.
#[derive(Debug, Clone)]
pub struct ConvergenceChecker {
    force_threshold: f64,
    eigenvalue_tolerance: f64,
}

impl ConvergenceChecker {
    /// Checker for a caller-supplied force threshold.
    pub fn new(force_threshold: f64, settings: &ConvergenceSettings) -> Self {
        Self {
            force_threshold,
            eigenvalue_tolerance: settings.eigenvalue_tolerance,
        }
    }

    /// Force threshold in use.
    pub fn force_threshold(&self) -> f64 {
        self.force_threshold
    }

    /// Tests the projected Cartesian gradient and the constraint violation
    /// (in units of each constraint's tolerance).
    pub fn check(&self, projected_gradient: &DVector<f64>, max_constraint_violation: f64) -> ConvergenceStatus {
        let max_force = max_abs(projected_gradient);
        ConvergenceStatus {
            max_force,
            force_converged: max_force < self.force_threshold,
            max_constraint_violation,
            constraints_satisfied: max_constraint_violation <= 1.0,
        }
    }

    /// Classifies a converged point from its free eigenpairs and tracked mode.
    pub fn classify(&self, eigen: &Eigenpairs, mode: usize) -> StationaryType {
        let negative = eigen.count_negative(self.eigenvalue_tolerance);
        let tracked_negative = eigen
            .values
            .get(mode)
            .is_some_and(|&value| value < -self.eigenvalue_tolerance);
        if negative == 1 && tracked_negative {
            StationaryType::Saddle
        } else {
            StationaryType::Other
        }
    }
}
