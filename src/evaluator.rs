//! Interface to the external energy and gradient calculator.
//!
//! The search treats the potential as a black box: it hands over a geometry
//! and receives a [`State`] holding the energy and the Cartesian gradient.
//! Calls are synchronous and the search performs exactly one per tried step.
//!
//! Any type implementing [`Evaluator`] can drive a search; plain closures are
//! adapted with [`FnEvaluator`].
//!
//! ```
//! use nalgebra::DVector;
//! use opents::evaluator::{Evaluator, FnEvaluator};
//! use opents::geometry::{Geometry, State};
//!
//! // Harmonic bond between two particles.
//! let mut evaluator = FnEvaluator::new(|geometry: &Geometry| {
//!     let d = geometry.position(1) - geometry.position(0);
//!     let r = d.norm();
//!     let de = 2.0 * (r - 1.0);
//!     let u = d / r;
//!     let gradient = DVector::from_vec(vec![-de * u.x, -de * u.y, -de * u.z, de * u.x, de * u.y, de * u.z]);
//!     Ok(State::new((r - 1.0).powi(2), gradient))
//! });
//!
//! let geometry = Geometry::new(vec!["H".into(), "H".into()], vec![0.0, 0.0, 0.0, 1.2, 0.0, 0.0]);
//! let state = evaluator.evaluate(&geometry).unwrap();
//! assert!((state.energy - 0.04).abs() < 1e-12);
//! ```

use crate::geometry::{Geometry, State};
use thiserror::Error;

/// Error type for evaluator failures.
///
/// Evaluations can fail at three stages:
/// 1. **I/O**: talking to an external program or reading its files
/// 2. **Calculation**: the calculator itself failed
/// 3. **Parsing**: the result could not be interpreted
#[derive(Error, Debug)]
pub enum EvaluatorError {
    /// File system or I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The energy/gradient calculation failed
    #[error("Calculation failed: {0}")]
    Calculation(String),
    /// Failed to parse calculator output
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Type alias for evaluator results
pub type Result<T> = std::result::Result<T, EvaluatorError>;

/// Energy and gradient provider consumed by the search.
///
/// Implementations should be deterministic for a fixed geometry. Returning
/// non-finite values is not an error: the search rejects the step instead.
pub trait Evaluator {
    /// Computes energy and Cartesian gradient at `geometry`.
    fn evaluate(&mut self, geometry: &Geometry) -> Result<State>;
}

impl<E: Evaluator + ?Sized> Evaluator for &mut E {
    fn evaluate(&mut self, geometry: &Geometry) -> Result<State> {
        (**self).evaluate(geometry)
    }
}

/// Adapts a closure into an [`Evaluator`].
pub struct FnEvaluator<F> {
    function: F,
}

impl<F> FnEvaluator<F>
where
    F: FnMut(&Geometry) -> Result<State>,
{
    /// Wraps `function`.
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F> Evaluator for FnEvaluator<F>
where
    F: FnMut(&Geometry) -> Result<State>,
{
    fn evaluate(&mut self, geometry: &Geometry) -> Result<State> {
        (self.function)(geometry)
    }
}

/// Counts calls made through an inner evaluator.
pub struct CountingEvaluator<E> {
    inner: E,
    calls: usize,
}

impl<E: Evaluator> CountingEvaluator<E> {
    /// Wraps `inner` with a zeroed counter.
    pub fn new(inner: E) -> Self {
        Self { inner, calls: 0 }
    }

    /// Number of `evaluate` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl<E: Evaluator> Evaluator for CountingEvaluator<E> {
    fn evaluate(&mut self, geometry: &Geometry) -> Result<State> {
        self.calls += 1;
        self.inner.evaluate(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn point() -> Geometry {
        Geometry::new(vec!["He".into()], vec![0.5, 0.0, 0.0])
    }

    #[test]
    fn test_closure_evaluator() {
        let mut evaluator = FnEvaluator::new(|g: &Geometry| {
            let x = g.coords[0];
            Ok(State::new(x * x, DVector::from_vec(vec![2.0 * x, 0.0, 0.0])))
        });
        let state = evaluator.evaluate(&point()).unwrap();
        assert_eq!(state.energy, 0.25);
        assert_eq!(state.gradient[0], 1.0);
    }

    #[test]
    fn test_counting_includes_failures() {
        let failing = FnEvaluator::new(|_: &Geometry| -> Result<State> {
            Err(EvaluatorError::Calculation("SCF did not converge".into()))
        });
        let mut counting = CountingEvaluator::new(failing);
        assert!(counting.evaluate(&point()).is_err());
        assert!(counting.evaluate(&point()).is_err());
        assert_eq!(counting.calls(), 2);
    }

    #[test]
    fn test_error_messages() {
        let err = EvaluatorError::Parse("missing gradient block".into());
        assert_eq!(err.to_string(), "Parse error: missing gradient block");
    }
}
