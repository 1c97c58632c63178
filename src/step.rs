//! Partitioned rational-function optimization (P-RFO) steps.
//!
//! In the eigenbasis of the free Hessian the step is split into the tracked
//! saddle mode `k`, which is maximized, and every other mode, which is
//! minimized:
//!
//! ```text
//! μ_max = λ_k/2 + √(λ_k²/4 + F_k²)          h_k = F_k / (μ_max - λ_k)
//! μ_min = Σ_{i≠k} F_i² / (μ_min - λ_i)        h_i = F_i / (μ_min - λ_i)
//! ```
//!
//! with `F = Vᵀ g` the gradient components and `μ_min < min_{i≠k} λ_i`.
//! Steps longer than the trust radius are restricted by splitting the radius
//! between the two parts in proportion to their unrestricted lengths.
//!
//! The saddle mode is tracked between iterations by maximum absolute overlap
//! of normalized Cartesian displacements, which stays meaningful when the
//! free basis or the whole coordinate set changes.

use crate::linalg::Eigenpairs;
use log::debug;
use nalgebra::{DMatrix, DVector};

/// Gradient components below this are treated as zero.
const SMALL_COMPONENT: f64 = 1e-12;

/// Iteration cap of the shift searches.
const MAX_SHIFT_ITERATIONS: usize = 200;

/// Relative accuracy of the restricted step length.
const LENGTH_TOLERANCE: f64 = 1e-10;

/// A P-RFO step in the free basis.
#[derive(Debug, Clone)]
pub struct PrfoStep {
    /// Displacement components in the free basis
    pub displacement: DVector<f64>,
    /// Index of the maximized eigenpair
    pub mode: usize,
    /// Eigenvalue of the maximized mode
    pub mode_eigenvalue: f64,
    /// Quadratic-model energy change `Σ F_i h_i + ½ λ_i h_i²`
    pub predicted_change: f64,
    /// Whether the step was shortened to the trust radius
    pub restricted: bool,
    /// Shift of the maximized part
    pub shift_max: f64,
    /// Shift of the minimized part
    pub shift_min: f64,
}

impl PrfoStep {
    /// Step length.
    pub fn norm(&self) -> f64 {
        self.displacement.norm()
    }
}

/// P-RFO step generator with saddle-mode tracking.
#[derive(Debug, Clone, Default)]
pub struct StepGenerator {
    tracked: Option<DVector<f64>>,
}

impl StepGenerator {
    /// Generator with no mode tracked yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized Cartesian displacement of the currently tracked mode.
    pub fn tracked_mode(&self) -> Option<&DVector<f64>> {
        self.tracked.as_ref()
    }

    /// Picks the saddle mode among eigenvectors whose Cartesian images are
    /// the columns of `images`.
    ///
    /// Lowest eigenvalue when nothing is tracked, otherwise maximum absolute
    /// overlap with the tracked mode.
    pub fn select_mode(&self, eigen: &Eigenpairs, images: &DMatrix<f64>) -> usize {
        let previous = match &self.tracked {
            Some(previous) if previous.len() == images.nrows() => previous,
            _ => return 0,
        };

        let mut best = 0;
        let mut best_overlap = f64::NEG_INFINITY;
        for i in 0..eigen.len() {
            let image = images.column(i);
            let norm = image.norm();
            if norm == 0.0 {
                continue;
            }
            let overlap = (previous.dot(&image) / norm).abs();
            if overlap > best_overlap {
                best_overlap = overlap;
                best = i;
            }
        }
        if best != 0 {
            debug!(
                "Tracked mode {} (overlap {:.4}) is not the lowest eigenpair",
                best, best_overlap
            );
        }
        best
    }

    /// Computes a P-RFO step and updates the tracked mode.
    ///
    /// `gradient` holds free-basis components, `eigen` the free Hessian
    /// eigenpairs and `cartesian_map` the linear map from free-basis
    /// displacements to Cartesian displacements.
    pub fn compute(
        &mut self,
        gradient: &DVector<f64>,
        eigen: &Eigenpairs,
        cartesian_map: &DMatrix<f64>,
        radius: f64,
    ) -> PrfoStep {
        let images = cartesian_map * &eigen.vectors;
        let mode = self.select_mode(eigen, &images);

        let image = images.column(mode);
        let norm = image.norm();
        if norm > 0.0 {
            self.tracked = Some(image / norm);
        }

        let components = eigen.vectors.transpose() * gradient;
        let step = prfo_components(&components, &eigen.values, mode, radius);
        let predicted_change: f64 = components
            .iter()
            .zip(eigen.values.iter())
            .zip(step.components.iter())
            .map(|((f, l), h)| f * h + 0.5 * l * h * h)
            .sum();

        debug!(
            "P-RFO: mode {} (λ = {:.4e}), shifts {:.4e} / {:.4e}, |h| = {:.4e}{}",
            mode,
            eigen.values[mode],
            step.shift_max,
            step.shift_min,
            step.components.norm(),
            if step.restricted { " (restricted)" } else { "" }
        );

        PrfoStep {
            displacement: &eigen.vectors * &step.components,
            mode,
            mode_eigenvalue: eigen.values[mode],
            predicted_change,
            restricted: step.restricted,
            shift_max: step.shift_max,
            shift_min: step.shift_min,
        }
    }
}

/// Step in the eigenbasis.
struct Components {
    components: DVector<f64>,
    restricted: bool,
    shift_max: f64,
    shift_min: f64,
}

fn prfo_components(forces: &DVector<f64>, eigenvalues: &DVector<f64>, mode: usize, radius: f64) -> Components {
    let n = forces.len();
    let others: Vec<usize> = (0..n).filter(|&i| i != mode).collect();
    let f_min: Vec<f64> = others.iter().map(|&i| forces[i]).collect();
    let l_min: Vec<f64> = others.iter().map(|&i| eigenvalues[i]).collect();

    let (mut h_max, shift_max) = maximize(forces[mode], eigenvalues[mode]);
    let mut shift_min = minimization_shift(&f_min, &l_min);
    let mut h_min = shifted_step(&f_min, &l_min, shift_min);

    let length_min = norm(&h_min);
    let total = (h_max * h_max + length_min * length_min).sqrt();
    let restricted = total > radius;
    if restricted {
        let share_max = radius * h_max.abs() / total;
        let share_min = radius * length_min / total;
        h_max = share_max.copysign(h_max);
        if length_min > 0.0 {
            shift_min = restrict_shift(&f_min, &l_min, shift_min, share_min);
            h_min = shifted_step(&f_min, &l_min, shift_min);
        }
    }

    let mut components = DVector::zeros(n);
    components[mode] = h_max;
    for (&i, h) in others.iter().zip(h_min) {
        components[i] = h;
    }
    Components {
        components,
        restricted,
        shift_max,
        shift_min,
    }
}

/// Closed-form RFO step uphill along one mode.
fn maximize(force: f64, eigenvalue: f64) -> (f64, f64) {
    let shift = 0.5 * eigenvalue + (0.25 * eigenvalue * eigenvalue + force * force).sqrt();
    if force.abs() < SMALL_COMPONENT {
        return (0.0, shift);
    }
    (force / (shift - eigenvalue), shift)
}

fn shifted_step(forces: &[f64], eigenvalues: &[f64], shift: f64) -> Vec<f64> {
    forces
        .iter()
        .zip(eigenvalues)
        .map(|(&f, &l)| {
            if f.abs() < SMALL_COMPONENT {
                0.0
            } else {
                f / (shift - l)
            }
        })
        .collect()
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Lowest root of `μ - Σ F²/(μ - λ) = 0` below the smallest eigenvalue.
///
/// The function is increasing on `(-∞, λ_min)`; safeguarded Newton steps
/// fall back to bisection whenever they leave the bracket.
fn minimization_shift(forces: &[f64], eigenvalues: &[f64]) -> f64 {
    if forces.is_empty() {
        return 0.0;
    }
    let lambda_min = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    let force_norm = norm(forces);
    if force_norm < SMALL_COMPONENT {
        return lambda_min.min(0.0);
    }

    let secular = |mu: f64| {
        let mut value = mu;
        let mut slope = 1.0;
        for (&f, &l) in forces.iter().zip(eigenvalues) {
            if f.abs() < SMALL_COMPONENT {
                continue;
            }
            let d = mu - l;
            value -= f * f / d;
            slope += f * f / (d * d);
        }
        (value, slope)
    };

    let mut lo = lambda_min.min(0.0) - force_norm;
    let mut hi = lambda_min - 1e-12 * lambda_min.abs().max(1.0);
    if secular(hi).0 <= 0.0 {
        return hi;
    }

    let mut mu = 0.5 * (lo + hi);
    for _ in 0..MAX_SHIFT_ITERATIONS {
        let (value, slope) = secular(mu);
        if value.abs() <= 1e-14 * mu.abs().max(1.0) {
            break;
        }
        if value > 0.0 {
            hi = mu;
        } else {
            lo = mu;
        }
        let newton = mu - value / slope;
        mu = if newton > lo && newton < hi {
            newton
        } else {
            0.5 * (lo + hi)
        };
        if hi - lo <= 1e-15 * mu.abs().max(1.0) {
            break;
        }
    }
    mu
}

/// Shift below `upper` giving a minimization step of length `target`.
///
/// The step length grows monotonically with the shift, so bisection on
/// `[λ_min - |F|/target, upper]` converges.
fn restrict_shift(forces: &[f64], eigenvalues: &[f64], upper: f64, target: f64) -> f64 {
    let lambda_min = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut lo = lambda_min - norm(forces) / target;
    let mut hi = upper;
    let mut mu = hi;
    for _ in 0..MAX_SHIFT_ITERATIONS {
        mu = 0.5 * (lo + hi);
        let length = norm(&shifted_step(forces, eigenvalues, mu));
        if (length - target).abs() <= LENGTH_TOLERANCE * target {
            break;
        }
        if length > target {
            hi = mu;
        } else {
            lo = mu;
        }
    }
    mu
}
