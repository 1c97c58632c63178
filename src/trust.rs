//! Trust-region control of the step length.
//!
//! After each evaluated step the actual energy change is compared with the
//! quadratic-model prediction:
//!
//! ```text
//! ratio = ΔE_actual / ΔE_predicted
//! ```
//!
//! A poor ratio on either side shrinks the radius, a good ratio with a step
//! on the boundary grows it. A step whose actual change has the opposite
//! sign of a significant prediction is rejected.

use crate::config::TrustSettings;
use log::debug;

/// Decision on an evaluated step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepVerdict {
    /// Actual over predicted energy change
    pub ratio: f64,
    /// Whether the step is kept
    pub accepted: bool,
    /// Radius before the assessment
    pub previous_radius: f64,
    /// Radius after the assessment
    pub radius: f64,
}

/// Adaptive bound on the step norm.
#[derive(Debug, Clone)]
pub struct TrustRegion {
    radius: f64,
    settings: TrustSettings,
}

impl TrustRegion {
    /// Starts at the configured initial radius.
    pub fn new(settings: &TrustSettings) -> Self {
        Self {
            radius: settings.initial_radius.min(settings.max_radius),
            settings: settings.clone(),
        }
    }

    /// Current radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Whether the radius fell below the configured floor.
    pub fn collapsed(&self) -> bool {
        self.radius < self.settings.min_radius
    }

    /// Actual over predicted change; predictions below the noise floor count as 1.
    pub fn ratio(&self, predicted: f64, actual: f64) -> f64 {
        if predicted.abs() < self.settings.noise_floor {
            1.0
        } else {
            actual / predicted
        }
    }

    /// Rates an evaluated step of length `step_norm` and adapts the radius.
    ///
    /// `correcting` marks steps that still drive constraints towards their
    /// targets; those are never rejected on the ratio.
    pub fn assess(&mut self, predicted: f64, actual: f64, step_norm: f64, correcting: bool) -> StepVerdict {
        let previous_radius = self.radius;
        let ratio = self.ratio(predicted, actual);
        let significant = predicted.abs() >= self.settings.noise_floor;
        let accepted = correcting || !significant || ratio >= 0.0;

        let s = &self.settings;
        if !accepted || ratio < s.shrink_below || ratio > s.shrink_above {
            self.shrink(step_norm);
        } else if ratio > s.grow_above && step_norm >= s.boundary_fraction * self.radius {
            self.radius = (s.grow_factor * self.radius).min(s.max_radius);
        }

        debug!(
            "Trust radius {:.4e} -> {:.4e} (ratio {:.4}, {})",
            previous_radius,
            self.radius,
            ratio,
            if accepted { "accepted" } else { "rejected" }
        );

        StepVerdict {
            ratio,
            accepted,
            previous_radius,
            radius: self.radius,
        }
    }

    /// Shrinks to `shrink_factor · min(radius, |step|)`.
    pub fn shrink(&mut self, step_norm: f64) {
        let basis = if step_norm.is_finite() && step_norm > 0.0 {
            self.radius.min(step_norm)
        } else {
            self.radius
        };
        self.radius = self.settings.shrink_factor * basis;
    }
}
