//! Configuration structures for the saddle-point search.
//!
//! All domain-tuned thresholds live here rather than in the algorithms:
//!
//! - [`SearchConfig`]: top-level configuration passed to
//!   [`SaddleSearch::new`](crate::optimizer::SaddleSearch::new)
//! - [`CoordinateSettings`]: working representation, bond perception and
//!   step realization
//! - [`HessianSettings`]: update rule and initial diagonal guess
//! - [`TrustSettings`]: trust-radius bounds and ratio thresholds
//! - [`CurvatureSettings`]: finite-difference refinement of the saddle mode
//! - [`ConvergenceSettings`]: curvature classification
//! - [`SearchLimits`]: evaluation and wall-clock budgets
//!
//! Every struct implements `Default` and deserializes with
//! `#[serde(default)]`, so partial documents only override what they name.
//! INI overrides are handled by [`settings`](crate::settings).

use crate::hessian_update::HessianUpdateMethod;
use crate::settings::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Working coordinate representation of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateKind {
    /// Redundant internal coordinates plus constraint functions
    #[default]
    Internal,
    /// Raw Cartesian positions; internals only seed the Hessian guess
    Cartesian,
}

impl fmt::Display for CoordinateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Cartesian => write!(f, "cartesian"),
        }
    }
}

impl FromStr for CoordinateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internal" | "internals" | "redundant" => Ok(Self::Internal),
            "cartesian" | "cart" => Ok(Self::Cartesian),
            other => Err(format!("unknown coordinate kind '{}'", other)),
        }
    }
}

/// Coordinate construction and step realization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateSettings {
    /// Working representation
    pub kind: CoordinateKind,
    /// Two particles are bonded when `d < bond_scale · (r_i + r_j)`
    pub bond_scale: f64,
    /// Angles above this value (degrees) count as near-linear
    pub linear_angle_threshold: f64,
    /// Remove rigid translations from the Cartesian working space.
    ///
    /// Only read in Cartesian mode: internal coordinates are invariant under
    /// rigid motion, so the internal working space never contains it.
    pub project_translation: bool,
    /// Remove rigid rotations from the Cartesian working space (disable for
    /// periodic systems). Only read in Cartesian mode; periodic systems that
    /// must keep their rotations need [`CoordinateKind::Cartesian`].
    pub project_rotation: bool,
    /// Iteration cap of the internal-to-Cartesian back-transformation
    pub max_backtransform_iterations: usize,
    /// Cartesian update norm at which the back-transformation has converged
    pub backtransform_tolerance: f64,
    /// Iteration cap of the Cartesian constraint polish
    pub max_correction_iterations: usize,
}

impl Default for CoordinateSettings {
    fn default() -> Self {
        Self {
            kind: CoordinateKind::Internal,
            bond_scale: 1.25,
            linear_angle_threshold: 175.0,
            project_translation: true,
            project_rotation: true,
            max_backtransform_iterations: 50,
            backtransform_tolerance: 1e-8,
            max_correction_iterations: 50,
        }
    }
}

impl CoordinateSettings {
    /// Near-linear angle threshold in radians.
    pub fn linear_angle_radians(&self) -> f64 {
        self.linear_angle_threshold.to_radians()
    }
}

/// Approximate Hessian settings.
///
/// The diagonal guess values are force constants along each coordinate
/// class; stretches are stiffest and torsions softest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HessianSettings {
    /// Secant update rule
    pub update: HessianUpdateMethod,
    /// Guess curvature along bond stretches
    pub stretch: f64,
    /// Guess curvature along bends
    pub bend: f64,
    /// Guess curvature along torsions
    pub torsion: f64,
    /// Guess curvature along Cartesian-like coordinates, and diagonal floor in Cartesian mode
    pub cartesian: f64,
}

impl Default for HessianSettings {
    fn default() -> Self {
        Self {
            update: HessianUpdateMethod::Bofill,
            stretch: 0.5,
            bend: 0.2,
            torsion: 0.1,
            cartesian: 0.05,
        }
    }
}

/// Trust-region settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    /// Radius of the first step
    pub initial_radius: f64,
    /// Upper bound of the radius
    pub max_radius: f64,
    /// The search fails once the radius drops below this floor
    pub min_radius: f64,
    /// Ratios below this shrink the radius
    pub shrink_below: f64,
    /// Ratios above this shrink the radius (model badly underestimates)
    pub shrink_above: f64,
    /// Ratios above this may grow the radius
    pub grow_above: f64,
    /// Shrunk radius is `shrink_factor · min(radius, |step|)`
    pub shrink_factor: f64,
    /// Grown radius is `grow_factor · radius`
    pub grow_factor: f64,
    /// Growth requires `|step| ≥ boundary_fraction · radius`
    pub boundary_fraction: f64,
    /// Predicted energy changes below this count as a perfect ratio
    pub noise_floor: f64,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            initial_radius: 0.1,
            max_radius: 1.0,
            min_radius: 1e-6,
            shrink_below: 0.25,
            shrink_above: 4.0,
            grow_above: 0.75,
            shrink_factor: 0.25,
            grow_factor: 1.5,
            boundary_fraction: 0.9,
            noise_floor: 1e-10,
        }
    }
}

/// Finite-difference refinement of the lowest free curvature.
///
/// A Davidson iteration on the free subspace with forward-difference
/// Hessian-vector products replaces the corresponding block of the
/// approximate Hessian. It always runs before a stationary point is
/// classified with a Hessian that was never updated; `refine_initial`
/// additionally runs it before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurvatureSettings {
    /// Refine the saddle mode before the first step (extra evaluations)
    pub refine_initial: bool,
    /// Cartesian length of each finite-difference displacement
    pub displacement: f64,
    /// Stop once the Ritz residual falls below `tolerance · |θ|`
    pub tolerance: f64,
    /// Largest subspace, and so the most extra evaluations, per refinement
    pub max_vectors: usize,
}

impl Default for CurvatureSettings {
    fn default() -> Self {
        Self {
            refine_initial: false,
            displacement: 1e-4,
            tolerance: 0.1,
            max_vectors: 10,
        }
    }
}

/// Curvature classification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceSettings {
    /// Eigenvalues below `-eigenvalue_tolerance` count as negative
    pub eigenvalue_tolerance: f64,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            eigenvalue_tolerance: 1e-6,
        }
    }
}

/// Budgets checked at every iteration boundary, besides `max_steps`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLimits {
    /// Maximum number of evaluator calls, including the initial one
    pub max_evaluations: Option<usize>,
    /// Wall-clock limit in seconds
    pub time_limit_secs: Option<f64>,
}

/// Complete configuration of a saddle-point search.
///
/// # Examples
///
/// ```
/// use opents::config::{CoordinateKind, SearchConfig};
///
/// let mut config = SearchConfig::default();
/// config.coordinates.kind = CoordinateKind::Cartesian;
/// config.trust.initial_radius = 0.05;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Coordinate construction and step realization
    pub coordinates: CoordinateSettings,
    /// Approximate Hessian
    pub hessian: HessianSettings,
    /// Trust region
    pub trust: TrustSettings,
    /// Saddle-mode refinement
    pub curvature: CurvatureSettings,
    /// Curvature classification
    pub convergence: ConvergenceSettings,
    /// Evaluation and wall-clock budgets
    pub limits: SearchLimits,
}

impl SearchConfig {
    /// Rejects values that would make the search meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.coordinates;
        positive("coordinates.bond_scale", c.bond_scale)?;
        if !(c.linear_angle_threshold > 90.0 && c.linear_angle_threshold < 180.0) {
            return Err(ConfigError::InvalidValue(format!(
                "coordinates.linear_angle_threshold must lie in (90, 180) degrees, got {}",
                c.linear_angle_threshold
            )));
        }
        positive("coordinates.backtransform_tolerance", c.backtransform_tolerance)?;
        nonzero("coordinates.max_backtransform_iterations", c.max_backtransform_iterations)?;
        nonzero("coordinates.max_correction_iterations", c.max_correction_iterations)?;

        let h = &self.hessian;
        positive("hessian.stretch", h.stretch)?;
        positive("hessian.bend", h.bend)?;
        positive("hessian.torsion", h.torsion)?;
        positive("hessian.cartesian", h.cartesian)?;

        let t = &self.trust;
        positive("trust.initial_radius", t.initial_radius)?;
        positive("trust.max_radius", t.max_radius)?;
        positive("trust.min_radius", t.min_radius)?;
        if t.min_radius >= t.initial_radius || t.initial_radius > t.max_radius {
            return Err(ConfigError::InvalidValue(format!(
                "trust radii must satisfy min < initial <= max, got {} / {} / {}",
                t.min_radius, t.initial_radius, t.max_radius
            )));
        }
        if !(t.shrink_below < t.grow_above && t.grow_above < t.shrink_above) {
            return Err(ConfigError::InvalidValue(format!(
                "trust ratio thresholds must satisfy shrink_below < grow_above < shrink_above, got {} / {} / {}",
                t.shrink_below, t.grow_above, t.shrink_above
            )));
        }
        if !(t.shrink_factor > 0.0 && t.shrink_factor < 1.0) {
            return Err(ConfigError::InvalidValue(format!(
                "trust.shrink_factor must lie in (0, 1), got {}",
                t.shrink_factor
            )));
        }
        if !(t.grow_factor > 1.0 && t.grow_factor.is_finite()) {
            return Err(ConfigError::InvalidValue(format!(
                "trust.grow_factor must be greater than 1, got {}",
                t.grow_factor
            )));
        }
        positive("trust.boundary_fraction", t.boundary_fraction)?;
        if !(t.noise_floor >= 0.0 && t.noise_floor.is_finite()) {
            return Err(ConfigError::InvalidValue(format!(
                "trust.noise_floor must be non-negative, got {}",
                t.noise_floor
            )));
        }

        let k = &self.curvature;
        positive("curvature.displacement", k.displacement)?;
        positive("curvature.tolerance", k.tolerance)?;
        nonzero("curvature.max_vectors", k.max_vectors)?;

        positive(
            "convergence.eigenvalue_tolerance",
            self.convergence.eigenvalue_tolerance,
        )?;

        if let Some(limit) = self.limits.time_limit_secs {
            positive("limits.time_limit_secs", limit)?;
        }
        if let Some(max) = self.limits.max_evaluations {
            nonzero("limits.max_evaluations", max)?;
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

fn nonzero(name: &str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(format!("{} must be at least 1", name)))
    }
}
