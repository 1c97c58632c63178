//! Constrained saddle-point search loop.
//!
//! [`SaddleSearch`] drives one search from a starting configuration to a
//! terminal [`TerminalOutcome`]:
//!
//! ```text
//! INIT → ITERATING → ConvergedSaddle
//!                  → ConvergedWrongStationaryType
//!                  → MaxStepsExceeded
//!                  → StepRealizationFailed
//! ```
//!
//! Every iteration:
//!
//! 1. projects the working gradient onto the free subspace and tests
//!    convergence
//! 2. builds a P-RFO step inside the trust radius, adds the linear
//!    constraint correction and realizes it in Cartesian space
//! 3. evaluates the trial configuration once and rates the step
//! 4. on acceptance, moves the configuration, updates the Hessian and
//!    rebuilds coordinates and bases; on rejection, keeps the configuration
//!    and shrinks the radius
//!
//! A Hessian that has never been updated carries no information about the
//! saddle mode. Before such a Hessian is used to classify a stationary point
//! (and, with [`CurvatureSettings::refine_initial`](crate::config::CurvatureSettings::refine_initial),
//! before the first step) the lowest free curvature is measured by finite
//! differences, see [`curvature`](crate::curvature).
//!
//! The caller's [`Geometry`] is borrowed for the whole search and holds the
//! final configuration afterwards. Trial configurations never touch it.

use crate::config::SearchConfig;
use crate::constraints::{Constraint, ConstraintError, ConstraintSet};
use crate::convergence::{ConvergenceChecker, ConvergenceStatus, StationaryType};
use crate::coordinates::{CoordinateError, CoordinateSystem, Linearization};
use crate::curvature::lowest_curvature;
use crate::evaluator::{Evaluator, EvaluatorError};
use crate::geometry::{Geometry, GeometryError, State};
use crate::hessian::ApproximateHessian;
use crate::linalg::Eigenpairs;
use crate::projection::Basis;
use crate::settings::ConfigError;
use crate::step::StepGenerator;
use crate::trust::TrustRegion;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use std::time::Instant;
use thiserror::Error;

/// Errors that abort a search.
///
/// Poor steps and failed realizations are handled inside the loop and never
/// surface here.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Invalid configuration or force threshold
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Malformed or over-constrained constraint set
    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),
    /// Coordinates could not be built for the configuration
    #[error("coordinate error: {0}")]
    Coordinate(#[from] CoordinateError),
    /// The evaluator failed
    #[error("evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),
    /// The evaluator returned an unusable state at the starting configuration
    /// or at a finite-difference displacement
    #[error("invalid evaluator state: {0}")]
    InvalidState(#[from] GeometryError),
    /// `run` was called again after the search ended
    #[error("search has already ended; start a new search to continue")]
    Finished,
}

/// Terminal state of a search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminalOutcome {
    /// Converged with exactly one negative free eigenvalue on the tracked mode
    ConvergedSaddle,
    /// Converged to a stationary point of the wrong index
    ConvergedWrongStationaryType,
    /// A step, evaluation or time budget ran out
    MaxStepsExceeded {
        /// Norm of the projected Cartesian gradient when the budget ran out
        gradient_norm: f64,
    },
    /// The trust radius collapsed below its floor
    StepRealizationFailed,
}

impl TerminalOutcome {
    /// Whether the search reached a stationary point.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::ConvergedSaddle | Self::ConvergedWrongStationaryType)
    }
}

/// One tried step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Energy after the step (trial energy when rejected)
    pub energy: f64,
    /// Projected force before the step
    pub max_force: f64,
    /// Trust radius the step was generated with
    pub trust_radius: f64,
    /// Actual over predicted energy change; `None` when the step was never evaluated
    pub ratio: Option<f64>,
    /// Whether the step was kept
    pub accepted: bool,
}

/// Summary of a finished search.
#[derive(Debug, Clone)]
pub struct SearchReport {
    /// How the search ended
    pub outcome: TerminalOutcome,
    /// Accepted steps
    pub steps: usize,
    /// Evaluator calls, the initial one included
    pub evaluations: usize,
    /// Energy at the final configuration
    pub energy: f64,
    /// Projected force at the final configuration
    pub max_force: f64,
    /// Largest constraint violation in units of tolerance
    pub max_constraint_violation: f64,
    /// Curvature along the tracked mode at the final configuration
    pub mode_eigenvalue: f64,
    /// Free Hessian eigenvalues at the final configuration, ascending
    pub eigenvalues: Vec<f64>,
    /// Number of coordinate rebuilds
    pub rebuilds: usize,
    /// Every tried step in order
    pub history: Vec<StepRecord>,
}

/// Per-accepted-step callback.
pub trait TrajectorySink {
    /// Receives the accepted configuration, its energy and projected gradient norm.
    fn record(&mut self, geometry: &Geometry, energy: f64, gradient_norm: f64);
}

impl<F: FnMut(&Geometry, f64, f64)> TrajectorySink for F {
    fn record(&mut self, geometry: &Geometry, energy: f64, gradient_norm: f64) {
        self(geometry, energy, gradient_norm)
    }
}

/// Quantities of the current iteration.
#[derive(Debug, Clone)]
pub struct IterationState {
    /// Energy at the current configuration
    pub energy: f64,
    /// Cartesian gradient
    pub cartesian_gradient: DVector<f64>,
    /// Working-space gradient
    pub working_gradient: DVector<f64>,
    /// Free Hessian eigenpairs
    pub eigen: Eigenpairs,
    /// Index of the tracked saddle mode in `eigen`
    pub mode: usize,
    /// Current trust radius
    pub trust_radius: f64,
    /// Accepted steps so far
    pub steps: usize,
    /// Evaluator calls so far
    pub evaluations: usize,
}

/// A constrained saddle-point search over one configuration.
///
/// # Examples
///
/// ```
/// use nalgebra::DVector;
/// use opents::config::SearchConfig;
/// use opents::evaluator::FnEvaluator;
/// use opents::geometry::{Geometry, State};
/// use opents::optimizer::{SaddleSearch, TerminalOutcome};
///
/// // Double well along the distance of two particles, barrier at r = 1.5.
/// let evaluator = FnEvaluator::new(|g: &Geometry| {
///     let d = g.position(1) - g.position(0);
///     let r = d.norm();
///     let u = r - 1.5;
///     let de = 4.0 * u * (u * u - 0.09);
///     let n = d / r;
///     let gradient = DVector::from_vec(vec![-de * n.x, -de * n.y, -de * n.z, de * n.x, de * n.y, de * n.z]);
///     Ok(State::new((u * u - 0.09).powi(2), gradient))
/// });
///
/// let mut geometry = Geometry::new(vec!["H".into(), "H".into()], vec![0.0, 0.0, 0.0, 1.62, 0.0, 0.0]);
/// let mut search = SaddleSearch::new(&mut geometry, Vec::new(), evaluator, SearchConfig::default()).unwrap();
/// let report = search.run(1e-4, 50).unwrap();
/// assert_eq!(report.outcome, TerminalOutcome::ConvergedSaddle);
/// ```
pub struct SaddleSearch<'a, E> {
    geometry: &'a mut Geometry,
    evaluator: E,
    config: SearchConfig,
    system: CoordinateSystem,
    linear: Linearization,
    basis: Basis,
    hessian: ApproximateHessian,
    generator: StepGenerator,
    trust: TrustRegion,
    sink: Option<Box<dyn TrajectorySink + 'a>>,
    state: Option<IterationState>,
    evaluations: usize,
    rebuilds: usize,
    finished: bool,
}

impl<'a, E: Evaluator> SaddleSearch<'a, E> {
    /// Prepares a search without calling the evaluator.
    ///
    /// Validates the configuration and constraints, builds coordinates, the
    /// free basis and the initial Hessian guess.
    pub fn new(
        geometry: &'a mut Geometry,
        constraints: Vec<Constraint>,
        evaluator: E,
        config: SearchConfig,
    ) -> Result<Self, SearchError> {
        config.validate()?;
        let constraints = ConstraintSet::new(constraints, geometry)?;
        let system = CoordinateSystem::new(geometry, constraints, &config.coordinates)?;
        let linear = system.linearize(&geometry.coords);
        let basis = Basis::build(&system, &geometry.coords, &linear)?;
        let hessian = ApproximateHessian::guess(&system, &geometry.coords, &config.hessian);
        let trust = TrustRegion::new(&config.trust);

        info!(
            "Saddle search: {} particles, {} working coordinates, {} constraints, {} free degrees of freedom",
            geometry.num_atoms,
            system.dimension(),
            system.constraints().len(),
            basis.free_dimension()
        );

        Ok(Self {
            geometry,
            evaluator,
            config,
            system,
            linear,
            basis,
            hessian,
            generator: StepGenerator::new(),
            trust,
            sink: None,
            state: None,
            evaluations: 0,
            rebuilds: 0,
            finished: false,
        })
    }

    /// Registers a per-accepted-step callback.
    pub fn with_sink(mut self, sink: impl TrajectorySink + 'a) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Coordinate system in use.
    pub fn coordinates(&self) -> &CoordinateSystem {
        &self.system
    }

    /// Current approximate Hessian.
    pub fn hessian(&self) -> &ApproximateHessian {
        &self.hessian
    }

    /// State of the most recent iteration, once the search has started.
    pub fn state(&self) -> Option<&IterationState> {
        self.state.as_ref()
    }

    /// Current Hessian expressed in Cartesian coordinates, for frequency
    /// analysis at the final configuration. `None` before the first
    /// evaluation.
    pub fn cartesian_hessian(&self) -> Option<DMatrix<f64>> {
        let state = self.state.as_ref()?;
        Some(self.system.cartesian_hessian(
            &self.geometry.coords,
            self.hessian.matrix(),
            &state.working_gradient,
        ))
    }

    /// Runs until a terminal outcome.
    ///
    /// `force_threshold` bounds the largest projected Cartesian force
    /// component; `max_steps` caps accepted steps. A search runs once: any
    /// later call fails with [`SearchError::Finished`].
    pub fn run(&mut self, force_threshold: f64, max_steps: usize) -> Result<SearchReport, SearchError> {
        if self.finished {
            return Err(SearchError::Finished);
        }
        if !(force_threshold.is_finite() && force_threshold > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "force threshold must be positive, got {}",
                force_threshold
            ))
            .into());
        }
        self.finished = true;

        let start = Instant::now();
        let checker = ConvergenceChecker::new(force_threshold, &self.config.convergence);
        let mut history = Vec::new();
        let mut steps = 0;
        let mut refined = false;

        let start_geometry = self.geometry.clone();
        let mut current = self.evaluate(&start_geometry)?;
        current.validate(self.geometry.num_atoms)?;
        let mut working_gradient = self.linear.working_gradient(&current.gradient);

        loop {
            let free_gradient = self.basis.to_free(&working_gradient);
            let projected = self
                .linear
                .cartesian_gradient(&self.basis.from_free(&free_gradient));
            let violation = self.system.constraints().max_violation(&self.geometry.coords);
            let status = checker.check(&projected, violation);

            let mut eigen = self.hessian.eigen_decompose(&self.basis.free);
            let cartesian_map = free_cartesian_map(&self.linear, &self.basis);
            let mut mode = self
                .generator
                .select_mode(&eigen, &(&cartesian_map * &eigen.vectors));

            let uncalibrated = !refined && self.hessian.update_count() == 0;
            if uncalibrated && (status.is_converged() || self.config.curvature.refine_initial) {
                let start_vector = eigen.vectors.column(mode).clone_owned();
                self.refine_curvature(&start_vector, &working_gradient)?;
                refined = true;
                eigen = self.hessian.eigen_decompose(&self.basis.free);
                mode = self
                    .generator
                    .select_mode(&eigen, &(&cartesian_map * &eigen.vectors));
            }

            self.state = Some(IterationState {
                energy: current.energy,
                cartesian_gradient: current.gradient.clone(),
                working_gradient: working_gradient.clone(),
                eigen: eigen.clone(),
                mode,
                trust_radius: self.trust.radius(),
                steps,
                evaluations: self.evaluations,
            });

            if status.is_converged() {
                let outcome = match checker.classify(&eigen, mode) {
                    StationaryType::Saddle => TerminalOutcome::ConvergedSaddle,
                    StationaryType::Other => {
                        warn!(
                            "Converged with {} negative free eigenvalues (tracked mode λ = {:.4e})",
                            eigen.count_negative(self.config.convergence.eigenvalue_tolerance),
                            eigen.values[mode]
                        );
                        TerminalOutcome::ConvergedWrongStationaryType
                    }
                };
                return Ok(self.report(outcome, steps, &current, &status, &eigen, mode, history));
            }

            if let Some(reason) = self.budget_exhausted(steps, max_steps, &start) {
                info!("Stopping: {}", reason);
                let outcome = TerminalOutcome::MaxStepsExceeded {
                    gradient_norm: projected.norm(),
                };
                return Ok(self.report(outcome, steps, &current, &status, &eigen, mode, history));
            }

            let radius = self.trust.radius();
            let step = self
                .generator
                .compute(&free_gradient, &eigen, &cartesian_map, radius);
            let residuals = self.system.constraints().residuals(&self.geometry.coords);
            let correcting = !self.system.constraints().satisfied(&self.geometry.coords);
            let dq = self.basis.from_free(&step.displacement) + self.basis.constraint_correction(&residuals);
            let predicted = working_gradient.dot(&dq) + 0.5 * dq.dot(&(self.hessian.matrix() * &dq));

            let mut record = StepRecord {
                energy: current.energy,
                max_force: status.max_force,
                trust_radius: radius,
                ratio: None,
                accepted: false,
            };

            let trial_coords = match self.system.realize(&self.geometry.coords, &dq) {
                Ok(coords) => coords,
                Err(err) => {
                    warn!("Step realization failed: {}; shrinking trust radius", err);
                    self.trust.shrink(step.norm());
                    history.push(record);
                    if self.trust.collapsed() {
                        return Ok(self.report(
                            TerminalOutcome::StepRealizationFailed,
                            steps,
                            &current,
                            &status,
                            &eigen,
                            mode,
                            history,
                        ));
                    }
                    continue;
                }
            };

            let mut trial = self.geometry.clone();
            trial.coords = trial_coords;
            let evaluated = self.evaluate(&trial)?;
            record.energy = evaluated.energy;

            let verdict = match evaluated.validate(trial.num_atoms) {
                Ok(()) => {
                    let actual = evaluated.energy - current.energy;
                    let verdict = self.trust.assess(predicted, actual, step.norm(), correcting);
                    record.ratio = Some(verdict.ratio);
                    Some(verdict)
                }
                Err(err @ GeometryError::GradientLength { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!("Rejecting step: {}", err);
                    self.trust.shrink(step.norm());
                    None
                }
            };

            match verdict {
                Some(verdict) if verdict.accepted => {
                    record.accepted = true;
                    history.push(record);
                    working_gradient = self.accept(trial, &evaluated, &working_gradient)?;
                    current = evaluated;
                    steps += 1;

                    let gradient_norm = self
                        .linear
                        .cartesian_gradient(&self.basis.project(&working_gradient))
                        .norm();
                    info!(
                        "Step {:>4}: E = {:.10} |g| = {:.4e} ratio = {:.3} trust = {:.4e}",
                        steps,
                        current.energy,
                        gradient_norm,
                        verdict.ratio,
                        self.trust.radius()
                    );
                    if let Some(sink) = self.sink.as_mut() {
                        sink.record(&*self.geometry, current.energy, gradient_norm);
                    }
                }
                Some(verdict) => {
                    warn!(
                        "Rejecting step: predicted {:.4e}, actual {:.4e} (ratio {:.3})",
                        predicted,
                        evaluated.energy - current.energy,
                        verdict.ratio
                    );
                    history.push(record);
                }
                None => history.push(record),
            }

            if self.trust.collapsed() {
                warn!(
                    "Trust radius {:.3e} fell below {:.3e}",
                    self.trust.radius(),
                    self.config.trust.min_radius
                );
                let status = checker.check(
                    &self
                        .linear
                        .cartesian_gradient(&self.basis.project(&working_gradient)),
                    self.system.constraints().max_violation(&self.geometry.coords),
                );
                let eigen = self.hessian.eigen_decompose(&self.basis.free);
                let mode = mode.min(eigen.len().saturating_sub(1));
                return Ok(self.report(
                    TerminalOutcome::StepRealizationFailed,
                    steps,
                    &current,
                    &status,
                    &eigen,
                    mode,
                    history,
                ));
            }
        }
    }

    /// Measures the lowest free curvature and writes the explored block into
    /// the Hessian. One evaluation per Davidson vector.
    fn refine_curvature(
        &mut self,
        start: &DVector<f64>,
        working_gradient: &DVector<f64>,
    ) -> Result<(), SearchError> {
        let settings = self.config.curvature.clone();
        let before = self.evaluations;
        let ritz = lowest_curvature(start, &settings, |direction| {
            self.curvature_product(direction, working_gradient)
        })?;

        let vectors = &self.basis.free * &ritz.subspace;
        let products = &self.basis.free * &ritz.products;
        self.hessian.block_update(&vectors, &products);
        info!(
            "Curvature refinement: lowest free curvature {:.4e} (residual {:.2e}) from {} evaluations",
            ritz.value,
            ritz.residual,
            self.evaluations - before
        );
        Ok(())
    }

    /// Free-space Hessian-vector product from a forward difference of
    /// working gradients along the Cartesian image of `direction`.
    fn curvature_product(
        &mut self,
        direction: &DVector<f64>,
        working_gradient: &DVector<f64>,
    ) -> Result<DVector<f64>, SearchError> {
        let cartesian = &self.linear.b_inverse * (&self.basis.free * direction);
        let length = cartesian.norm();
        if length == 0.0 {
            return Ok(DVector::zeros(direction.len()));
        }
        let h = self.config.curvature.displacement / length;

        let mut displaced = self.geometry.clone();
        displaced.coords += cartesian * h;
        let state = self.evaluate(&displaced)?;
        state.validate(displaced.num_atoms)?;
        let gradient = self
            .system
            .linearize(&displaced.coords)
            .working_gradient(&state.gradient);
        Ok(self.basis.free.transpose() * (gradient - working_gradient) / h)
    }

    fn evaluate(&mut self, geometry: &Geometry) -> Result<State, SearchError> {
        self.evaluations += 1;
        Ok(self.evaluator.evaluate(geometry)?)
    }

    /// Moves to an accepted trial configuration and refreshes every derived
    /// quantity. Returns the new working gradient.
    fn accept(
        &mut self,
        trial: Geometry,
        evaluated: &State,
        old_working_gradient: &DVector<f64>,
    ) -> Result<DVector<f64>, SearchError> {
        let mut linear = self.system.linearize(&trial.coords);
        let mut working_gradient = linear.working_gradient(&evaluated.gradient);

        let delta_q = self.system.difference(&linear.values, &self.linear.values);
        let delta_g = &working_gradient - old_working_gradient;
        self.hessian.update(&delta_q, &delta_g);

        self.geometry.coords = trial.coords;

        if self.system.needs_rebuild(&self.geometry.coords) {
            let b_old = self.system.b_matrix(&self.geometry.coords);
            self.system.rebuild(&self.geometry.coords);
            linear = self.system.linearize(&self.geometry.coords);
            self.hessian.reexpress(&b_old, &linear.b_matrix);
            working_gradient = linear.working_gradient(&evaluated.gradient);
            self.rebuilds += 1;
        }

        self.basis = Basis::build(&self.system, &self.geometry.coords, &linear)?;
        self.linear = linear;
        debug!(
            "Accepted step: {} Hessian updates, {} free degrees of freedom",
            self.hessian.update_count(),
            self.basis.free_dimension()
        );
        Ok(working_gradient)
    }

    fn budget_exhausted(&self, steps: usize, max_steps: usize, start: &Instant) -> Option<String> {
        if steps >= max_steps {
            return Some(format!("reached {} accepted steps", max_steps));
        }
        if let Some(limit) = self.config.limits.max_evaluations {
            if self.evaluations >= limit {
                return Some(format!("reached {} evaluations", limit));
            }
        }
        if let Some(limit) = self.config.limits.time_limit_secs {
            if start.elapsed().as_secs_f64() >= limit {
                return Some(format!("exceeded time limit of {} s", limit));
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        outcome: TerminalOutcome,
        steps: usize,
        current: &State,
        status: &ConvergenceStatus,
        eigen: &Eigenpairs,
        mode: usize,
        history: Vec<StepRecord>,
    ) -> SearchReport {
        info!(
            "Search finished: {:?} after {} steps and {} evaluations (E = {:.10}, max force {:.4e})",
            outcome, steps, self.evaluations, current.energy, status.max_force
        );
        SearchReport {
            outcome,
            steps,
            evaluations: self.evaluations,
            energy: current.energy,
            max_force: status.max_force,
            max_constraint_violation: status.max_constraint_violation,
            mode_eigenvalue: eigen.values.get(mode).copied().unwrap_or(f64::NAN),
            eigenvalues: eigen.values.iter().copied().collect(),
            rebuilds: self.rebuilds,
            history,
        }
    }
}

/// Cartesian map of the free basis, `B⁺ U`.
pub fn free_cartesian_map(linear: &Linearization, basis: &Basis) -> DMatrix<f64> {
    &linear.b_inverse * &basis.free
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{CountingEvaluator, FnEvaluator};

    fn double_well(g: &Geometry) -> crate::evaluator::Result<State> {
        let d = g.position(1) - g.position(0);
        let r = d.norm();
        let u = r - 1.5;
        let de = 4.0 * u * (u * u - 0.09);
        let n = d / r;
        let gradient = DVector::from_vec(vec![-de * n.x, -de * n.y, -de * n.z, de * n.x, de * n.y, de * n.z]);
        Ok(State::new((u * u - 0.09).powi(2), gradient))
    }

    fn pair() -> Geometry {
        Geometry::new(vec!["H".into(), "H".into()], vec![0.0, 0.0, 0.0, 1.62, 0.0, 0.0])
    }

    #[test]
    fn test_double_well_barrier() {
        let mut geometry = pair();
        let mut search =
            SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), SearchConfig::default())
                .unwrap();
        let report = search.run(1e-4, 50).unwrap();
        assert_eq!(report.outcome, TerminalOutcome::ConvergedSaddle);
        assert!(report.max_force < 1e-4);
        assert!(report.mode_eigenvalue < 0.0);
        assert_eq!(report.evaluations, report.history.len() + 1);
        drop(search);
        let r = (geometry.position(1) - geometry.position(0)).norm();
        assert!((r - 1.5).abs() < 1e-3);
    }

    #[test]
    fn test_cartesian_hessian_at_barrier() {
        let mut geometry = pair();
        let mut search =
            SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), SearchConfig::default())
                .unwrap();
        assert!(search.cartesian_hessian().is_none());
        search.run(1e-4, 50).unwrap();

        let hessian = search.cartesian_hessian().unwrap();
        assert_eq!(hessian.shape(), (6, 6));
        assert!((&hessian - hessian.transpose()).amax() < 1e-10);
        // One negative curvature along the bond axis.
        let negative = hessian
            .symmetric_eigen()
            .eigenvalues
            .iter()
            .filter(|&&l| l < -1e-2)
            .count();
        assert_eq!(negative, 1);
    }

    #[test]
    fn test_second_run_is_rejected() {
        let mut geometry = pair();
        let mut search =
            SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), SearchConfig::default())
                .unwrap();
        let report = search.run(1e-4, 50).unwrap();
        assert!(report.outcome.is_converged());
        assert!(matches!(search.run(1e-4, 50), Err(SearchError::Finished)));
        assert!(matches!(search.run(1e-6, 50), Err(SearchError::Finished)));
    }

    #[test]
    fn test_max_steps_zero() {
        let mut geometry = pair();
        let mut search =
            SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), SearchConfig::default())
                .unwrap();
        let report = search.run(1e-4, 0).unwrap();
        assert!(matches!(report.outcome, TerminalOutcome::MaxStepsExceeded { gradient_norm } if gradient_norm > 0.0));
        assert_eq!(report.evaluations, 1);
        assert!(report.history.is_empty());
    }

    #[test]
    fn test_evaluation_budget() {
        let mut config = SearchConfig::default();
        config.limits.max_evaluations = Some(3);
        let mut geometry = pair();
        let mut search = SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), config).unwrap();
        let report = search.run(1e-12, 100).unwrap();
        assert!(matches!(report.outcome, TerminalOutcome::MaxStepsExceeded { .. }));
        assert_eq!(report.evaluations, 3);
    }

    #[test]
    fn test_over_constrained_never_evaluates() {
        let mut geometry = pair();
        let mut counting = CountingEvaluator::new(FnEvaluator::new(double_well));
        let result = SaddleSearch::new(
            &mut geometry,
            vec![Constraint::bond(0, 1, 1.62)],
            &mut counting,
            SearchConfig::default(),
        )
        .map(|_| ());
        assert!(matches!(
            result,
            Err(SearchError::Constraint(ConstraintError::NoFreeDegreesOfFreedom { .. }))
        ));
        assert_eq!(counting.calls(), 0);
    }

    #[test]
    fn test_evaluator_error_propagates() {
        let mut geometry = pair();
        let failing = FnEvaluator::new(|_: &Geometry| -> crate::evaluator::Result<State> {
            Err(EvaluatorError::Calculation("no convergence".into()))
        });
        let mut search = SaddleSearch::new(&mut geometry, Vec::new(), failing, SearchConfig::default()).unwrap();
        assert!(matches!(search.run(1e-4, 10), Err(SearchError::Evaluator(_))));
    }

    #[test]
    fn test_invalid_force_threshold() {
        let mut geometry = pair();
        let mut search =
            SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), SearchConfig::default())
                .unwrap();
        assert!(matches!(search.run(0.0, 10), Err(SearchError::Config(_))));
    }

    #[test]
    fn test_sink_sees_every_accepted_step() {
        let mut geometry = pair();
        let mut energies = Vec::new();
        let report = {
            let mut search =
                SaddleSearch::new(&mut geometry, Vec::new(), FnEvaluator::new(double_well), SearchConfig::default())
                    .unwrap()
                    .with_sink(|_: &Geometry, energy: f64, _: f64| energies.push(energy));
            search.run(1e-4, 50).unwrap()
        };
        assert_eq!(energies.len(), report.steps);
        assert_eq!(energies.last().copied(), Some(report.energy));
    }
}
