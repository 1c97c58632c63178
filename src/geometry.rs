//! Core geometry and evaluation data structures.
//!
//! This module provides the two values that flow between the search and the
//! external energy/force evaluator:
//!
//! - [`Geometry`]: particle configuration with element types, masses and flat
//!   Cartesian coordinates
//! - [`State`]: energy and gradient evaluated at a configuration
//!
//! The crate is unit agnostic. Covalent radii used for bond perception are in
//! Angstrom, so positions are expected in Angstrom unless the bond scale is
//! adjusted accordingly; energies and gradients only need to be consistent with
//! each other and with the force threshold given to the search.

use crate::elements;
use log::warn;
use nalgebra::{DVector, Matrix3, Vector3};
use thiserror::Error;

/// Errors raised when a configuration or an evaluated state is inconsistent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// The evaluator returned a non-finite energy.
    #[error("energy is not finite: {0}")]
    NonFiniteEnergy(f64),
    /// The evaluator returned a gradient with NaN or infinite components.
    #[error("gradient contains non-finite components")]
    NonFiniteGradient,
    /// Gradient length does not match the configuration.
    #[error("gradient/geometry mismatch: expected {expected} components, got {found}")]
    GradientLength {
        /// Expected number of components (3 × particles)
        expected: usize,
        /// Number of components actually returned
        found: usize,
    },
}

/// Particle configuration with element types, masses and Cartesian coordinates.
///
/// Coordinates are stored flat as `[x1, y1, z1, x2, y2, z2, ...]` in a
/// `DVector<f64>` so they can be used directly in nalgebra expressions.
///
/// # Examples
///
/// ```
/// use opents::geometry::Geometry;
///
/// let geometry = Geometry::new(
///     vec!["O".to_string(), "H".to_string(), "H".to_string()],
///     vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
/// );
/// assert_eq!(geometry.num_atoms, 3);
/// assert_eq!(geometry.get_atom_coords(1), [0.757, 0.586, 0.0]);
/// ```
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Chemical element symbols for each particle in order
    pub elements: Vec<String>,
    /// Flattened Cartesian coordinates [x1, y1, z1, x2, y2, z2, ...]
    pub coords: DVector<f64>,
    /// Particle masses in amu
    pub masses: Vec<f64>,
    /// Number of particles
    pub num_atoms: usize,
}

impl Geometry {
    /// Create a new `Geometry` from element list and coordinate vector.
    ///
    /// Masses are taken from the element table; unknown symbols fall back to
    /// [`elements::DEFAULT_MASS`] with a warning.
    ///
    /// # Panics
    ///
    /// Panics if `coords.len() != elements.len() * 3`.
    pub fn new(elements: Vec<String>, coords: Vec<f64>) -> Self {
        let num_atoms = elements.len();
        assert_eq!(coords.len(), num_atoms * 3);
        let masses = elements
            .iter()
            .map(|symbol| {
                elements::atomic_mass(symbol).unwrap_or_else(|| {
                    warn!(
                        "No tabulated mass for element '{}', using {}",
                        symbol,
                        elements::DEFAULT_MASS
                    );
                    elements::DEFAULT_MASS
                })
            })
            .collect();
        Self {
            elements,
            coords: DVector::from_vec(coords),
            masses,
            num_atoms,
        }
    }

    /// Replace the tabulated masses, e.g. for isotopic substitution.
    ///
    /// # Panics
    ///
    /// Panics if the number of masses differs from the number of particles.
    pub fn with_masses(mut self, masses: Vec<f64>) -> Self {
        assert_eq!(masses.len(), self.num_atoms);
        self.masses = masses;
        self
    }

    /// Cartesian coordinates of one particle as an array.
    pub fn get_atom_coords(&self, atom_idx: usize) -> [f64; 3] {
        let i = atom_idx * 3;
        [self.coords[i], self.coords[i + 1], self.coords[i + 2]]
    }

    /// Cartesian position of one particle.
    pub fn position(&self, atom_idx: usize) -> Vector3<f64> {
        position(&self.coords, atom_idx)
    }

    /// Mass-weighted center of the configuration.
    pub fn center_of_mass(&self) -> Vector3<f64> {
        center_of_mass(&self.coords, &self.masses)
    }

    /// Return a copy translated by `shift`.
    pub fn translated(&self, shift: &Vector3<f64>) -> Self {
        let mut out = self.clone();
        for i in 0..self.num_atoms {
            for k in 0..3 {
                out.coords[3 * i + k] += shift[k];
            }
        }
        out
    }

    /// Return a copy rotated by `rotation` about the center of mass.
    pub fn rotated(&self, rotation: &Matrix3<f64>) -> Self {
        let com = self.center_of_mass();
        let mut out = self.clone();
        for i in 0..self.num_atoms {
            let p = rotation * (self.position(i) - com) + com;
            out.coords.fixed_rows_mut::<3>(3 * i).copy_from(&p);
        }
        out
    }
}

/// Position of particle `atom` inside a flat coordinate vector.
pub fn position(coords: &DVector<f64>, atom: usize) -> Vector3<f64> {
    let i = 3 * atom;
    Vector3::new(coords[i], coords[i + 1], coords[i + 2])
}

/// Mass-weighted center of a flat coordinate vector.
pub fn center_of_mass(coords: &DVector<f64>, masses: &[f64]) -> Vector3<f64> {
    let total: f64 = masses.iter().sum();
    let mut com = Vector3::zeros();
    for (i, m) in masses.iter().enumerate() {
        com += position(coords, i) * *m;
    }
    if total > 0.0 {
        com / total
    } else {
        com
    }
}

/// Energy and gradient of the potential at one configuration.
///
/// The gradient is `∂E/∂x` (the negative of the forces), stored flat in the
/// same layout as [`Geometry::coords`].
#[derive(Debug, Clone)]
pub struct State {
    /// Potential energy
    pub energy: f64,
    /// Gradient of the energy with respect to the flat coordinates
    pub gradient: DVector<f64>,
}

impl State {
    /// Create a state from an energy and a gradient.
    pub fn new(energy: f64, gradient: DVector<f64>) -> Self {
        Self { energy, gradient }
    }

    /// Checks that the state is usable for a configuration of `num_atoms`.
    ///
    /// # Examples
    ///
    /// ```
    /// use opents::geometry::State;
    /// use nalgebra::DVector;
    ///
    /// let state = State::new(-0.5, DVector::from_vec(vec![0.1, -0.2, 0.0]));
    /// assert!(state.validate(1).is_ok());
    /// assert!(state.validate(2).is_err());
    /// ```
    pub fn validate(&self, num_atoms: usize) -> Result<(), GeometryError> {
        if !self.energy.is_finite() {
            return Err(GeometryError::NonFiniteEnergy(self.energy));
        }

        let expected = num_atoms * 3;
        if self.gradient.len() != expected {
            return Err(GeometryError::GradientLength {
                expected,
                found: self.gradient.len(),
            });
        }

        if !self.gradient.iter().all(|g| g.is_finite()) {
            return Err(GeometryError::NonFiniteGradient);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn water() -> Geometry {
        Geometry::new(
            vec!["O".to_string(), "H".to_string(), "H".to_string()],
            vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
        )
    }

    #[test]
    fn test_masses_from_table() {
        let geometry = water();
        assert_abs_diff_eq!(geometry.masses[0], 15.999);
        assert_abs_diff_eq!(geometry.masses[1], 1.008);
    }

    #[test]
    fn test_isotope_masses_shift_center_of_mass() {
        let geometry = water().with_masses(vec![15.999, 2.014, 1.008]);
        assert_abs_diff_eq!(geometry.masses[1], 2.014);
        assert!(geometry.center_of_mass().x > 0.0);
    }

    #[test]
    fn test_unknown_element_gets_default_mass() {
        let geometry = Geometry::new(vec!["Q".to_string()], vec![0.0, 0.0, 0.0]);
        assert_abs_diff_eq!(geometry.masses[0], elements::DEFAULT_MASS);
    }

    #[test]
    fn test_rotation_preserves_center_of_mass_and_distances() {
        let geometry = water();
        let rotation = *nalgebra::Rotation3::from_euler_angles(0.3, -1.1, 2.0).matrix();
        let rotated = geometry.rotated(&rotation);

        assert_abs_diff_eq!(
            (rotated.center_of_mass() - geometry.center_of_mass()).norm(),
            0.0,
            epsilon = 1e-12
        );
        let d0 = (geometry.position(1) - geometry.position(2)).norm();
        let d1 = (rotated.position(1) - rotated.position(2)).norm();
        assert_abs_diff_eq!(d0, d1, epsilon = 1e-12);
    }

    #[test]
    fn test_translation() {
        let geometry = water();
        let moved = geometry.translated(&Vector3::new(1.0, -2.0, 0.5));
        assert_abs_diff_eq!(moved.coords[3], 1.757, epsilon = 1e-12);
        assert_abs_diff_eq!(moved.coords[4], -1.414, epsilon = 1e-12);
    }

    #[test]
    fn test_state_validation_non_finite_energy() {
        let state = State::new(f64::NAN, DVector::from_vec(vec![0.1, -0.2, 0.0]));
        assert!(matches!(
            state.validate(1),
            Err(GeometryError::NonFiniteEnergy(_))
        ));
    }

    #[test]
    fn test_state_validation_non_finite_gradient() {
        let state = State::new(-0.5, DVector::from_vec(vec![0.1, f64::INFINITY, 0.0]));
        assert_eq!(state.validate(1), Err(GeometryError::NonFiniteGradient));
    }

    #[test]
    fn test_state_validation_force_geometry_mismatch() {
        let state = State::new(-0.5, DVector::from_vec(vec![0.1, -0.2, 0.0]));
        assert_eq!(
            state.validate(2),
            Err(GeometryError::GradientLength {
                expected: 6,
                found: 3
            })
        );
    }

    #[test]
    fn test_zero_energy_is_accepted() {
        let state = State::new(0.0, DVector::zeros(3));
        assert!(state.validate(1).is_ok());
    }
}
