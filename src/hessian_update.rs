//! Secant updates of an approximate Hessian for saddle-point searches.
//!
//! All formulas here satisfy the secant condition `H_new · Δx = Δg` exactly
//! for the step just taken and, unlike BFGS, keep indefinite matrices
//! indefinite, which a transition-state search needs.
//!
//! # Available Update Methods
//!
//! - **SR1**: Murtagh-Sargent symmetric rank-one update
//! - **PSB**: Powell-symmetric-Broyden rank-two update
//! - **Bofill**: weighted SR1/PSB mixture (default)
//!
//! # References
//!
//! - Bofill, J. M. J. Comput. Chem. 1994, 15, 1-11.
//! - Powell, M. J. D. Math. Programming 1971, 1, 26-57.
//! - Murtagh, B. A.; Sargent, R. W. H. Comput. J. 1970, 13, 185-194.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hessian update method selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HessianUpdateMethod {
    /// Symmetric rank-one (Murtagh-Sargent) update
    Sr1,
    /// Powell-symmetric-Broyden update
    Psb,
    /// Bofill weighted SR1/PSB mixture
    #[default]
    Bofill,
}

impl fmt::Display for HessianUpdateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sr1 => "sr1",
            Self::Psb => "psb",
            Self::Bofill => "bofill",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for HessianUpdateMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sr1" | "ms" | "murtagh-sargent" => Ok(Self::Sr1),
            "psb" | "powell" => Ok(Self::Psb),
            "bofill" => Ok(Self::Bofill),
            other => Err(format!("unknown Hessian update method '{}'", other)),
        }
    }
}

/// Numerical thresholds for Hessian updates.
const SMALL: f64 = 1e-14;
const RMIN2: f64 = 1e-12;

/// Relative size of `ξ·Δx` below which SR1 is considered singular.
const SR1_SKIP: f64 = 1e-8;

/// Updates the Hessian matrix using the specified method.
///
/// This is the main entry point for Hessian updates, dispatching to the
/// appropriate formula based on the selected method. Non-finite input and
/// vanishing steps leave the matrix unchanged; the result is symmetrized.
///
/// # Arguments
///
/// * `hessian` - Current Hessian matrix
/// * `delta_x` - Step vector (x_new - x_old)
/// * `delta_g` - Gradient difference (g_new - g_old)
/// * `method` - Update method to use
pub fn update_hessian_with_method(
    hessian: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
    method: HessianUpdateMethod,
) -> DMatrix<f64> {
    if !delta_x.iter().all(|v| v.is_finite()) || !delta_g.iter().all(|v| v.is_finite()) {
        debug!("Skipping Hessian update: non-finite step or gradient change");
        return hessian.clone();
    }
    if delta_x.norm_squared() < RMIN2 {
        debug!("Skipping Hessian update: step too small");
        return hessian.clone();
    }

    let h_new = match method {
        HessianUpdateMethod::Sr1 => update_hessian_sr1(hessian, delta_x, delta_g),
        HessianUpdateMethod::Psb => update_hessian_psb(hessian, delta_x, delta_g),
        HessianUpdateMethod::Bofill => update_hessian_bofill(hessian, delta_x, delta_g),
    };
    (&h_new + h_new.transpose()) * 0.5
}

/// Murtagh-Sargent symmetric rank-one update.
///
/// ```text
/// ξ = Δg - H·Δx
/// H_new = H + ξ·ξᵀ / (ξ·Δx)
/// ```
///
/// Falls back to [`update_hessian_psb`] when `|ξ·Δx|` is negligible
/// relative to `|ξ|·|Δx|`, where the rank-one term is undefined.
pub fn update_hessian_sr1(
    hessian: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
) -> DMatrix<f64> {
    let xi = delta_g - hessian * delta_x;
    let xi_norm = xi.norm();
    if xi_norm * xi_norm < SMALL {
        return hessian.clone();
    }

    let denom = xi.dot(delta_x);
    if denom.abs() <= SR1_SKIP * xi_norm * delta_x.norm() {
        debug!("SR1 denominator {:.3e} is singular, using PSB", denom);
        return update_hessian_psb(hessian, delta_x, delta_g);
    }

    hessian + (&xi * xi.transpose()) / denom
}

/// Powell-symmetric-Broyden update.
///
/// ```text
/// ξ = Δg - H·Δx
/// H_new = H + (ξ·Δxᵀ + Δx·ξᵀ)/|Δx|² - (ξ·Δx)·Δx·Δxᵀ/|Δx|⁴
/// ```
pub fn update_hessian_psb(
    hessian: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
) -> DMatrix<f64> {
    let dx_norm_sq = delta_x.norm_squared();
    if dx_norm_sq < RMIN2 {
        return hessian.clone();
    }

    let xi = delta_g - hessian * delta_x;
    let xi_dx = xi.dot(delta_x);

    let mut h_new = hessian.clone();
    let n = hessian.nrows();
    for i in 0..n {
        for j in 0..=i {
            let update = (xi[i] * delta_x[j] + delta_x[i] * xi[j]) / dx_norm_sq
                - xi_dx * delta_x[i] * delta_x[j] / (dx_norm_sq * dx_norm_sq);
            h_new[(i, j)] += update;
            if i != j {
                h_new[(j, i)] += update;
            }
        }
    }
    h_new
}

/// Bofill weighted update for saddle points.
///
/// Implements Bofill's formula from J. Comput. Chem. 1994, 15, 1-11:
/// ```text
/// H_new = H + φ·SR1_term + (1-φ)·PSB_term
/// φ = (ξ·Δx)² / (|ξ|²·|Δx|²)
/// ```
///
/// Both terms satisfy the secant condition, so their convex combination
/// does as well. When `ξ·Δx` vanishes the weight goes to zero and the
/// update reduces to pure PSB.
pub fn update_hessian_bofill(
    hessian: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
) -> DMatrix<f64> {
    let dx_norm_sq = delta_x.norm_squared();
    if dx_norm_sq < RMIN2 {
        return hessian.clone();
    }

    let xi = delta_g - hessian * delta_x;
    let xi_norm_sq = xi.norm_squared();
    if xi_norm_sq < SMALL {
        return hessian.clone();
    }

    let xi_dx = xi.dot(delta_x);
    let phi = ((xi_dx * xi_dx) / (xi_norm_sq * dx_norm_sq)).clamp(0.0, 1.0);
    let sr1_valid = xi_dx.abs() > SR1_SKIP * (xi_norm_sq * dx_norm_sq).sqrt();

    let mut h_new = hessian.clone();
    let n = hessian.nrows();
    for i in 0..n {
        for j in 0..=i {
            let psb = (xi[i] * delta_x[j] + delta_x[i] * xi[j]) / dx_norm_sq
                - xi_dx * delta_x[i] * delta_x[j] / (dx_norm_sq * dx_norm_sq);
            let sr1 = if sr1_valid { xi[i] * xi[j] / xi_dx } else { 0.0 };

            let update = if sr1_valid {
                phi * sr1 + (1.0 - phi) * psb
            } else {
                psb
            };
            h_new[(i, j)] += update;
            if i != j {
                h_new[(j, i)] += update;
            }
        }
    }

    h_new
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn indefinite() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            3,
            3,
            &[-0.4, 0.1, 0.0, 0.1, 0.8, 0.05, 0.0, 0.05, 0.3],
        )
    }

    fn assert_secant(h_new: &DMatrix<f64>, dx: &DVector<f64>, dg: &DVector<f64>) {
        let residual = h_new * dx - dg;
        assert_abs_diff_eq!(residual.norm(), 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!((h_new - h_new.transpose()).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_secant_condition_for_every_method() {
        let h = indefinite();
        let dx = DVector::from_vec(vec![0.1, -0.2, 0.3]);
        let dg = DVector::from_vec(vec![0.02, -0.31, 0.12]);
        for method in [
            HessianUpdateMethod::Sr1,
            HessianUpdateMethod::Psb,
            HessianUpdateMethod::Bofill,
        ] {
            let h_new = update_hessian_with_method(&h, &dx, &dg, method);
            assert_secant(&h_new, &dx, &dg);
        }
    }

    #[test]
    fn test_sr1_falls_back_to_psb_when_singular() {
        let h = DMatrix::identity(2, 2);
        let dx = DVector::from_vec(vec![1.0, 0.0]);
        // ξ = (0, 1) is orthogonal to Δx.
        let dg = DVector::from_vec(vec![1.0, 1.0]);
        let h_new = update_hessian_with_method(&h, &dx, &dg, HessianUpdateMethod::Sr1);
        assert!(h_new.iter().all(|v| v.is_finite()));
        assert_secant(&h_new, &dx, &dg);
        let psb = update_hessian_psb(&h, &dx, &dg);
        assert_abs_diff_eq!((h_new - psb).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_curvature_is_kept() {
        let h = DMatrix::identity(2, 2);
        let dx = DVector::from_vec(vec![0.1, 0.0]);
        let dg = DVector::from_vec(vec![-0.05, 0.0]);
        let h_new = update_hessian_with_method(&h, &dx, &dg, HessianUpdateMethod::Bofill);
        assert_abs_diff_eq!(h_new[(0, 0)], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(h_new[(1, 1)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exact_model_is_unchanged() {
        let h = indefinite();
        let dx = DVector::from_vec(vec![0.1, 0.2, -0.1]);
        let dg = &h * &dx;
        let h_new = update_hessian_with_method(&h, &dx, &dg, HessianUpdateMethod::Sr1);
        assert_abs_diff_eq!((h_new - h).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_step_handled() {
        let h = indefinite();
        let dx = DVector::zeros(3);
        let dg = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        for method in [
            HessianUpdateMethod::Sr1,
            HessianUpdateMethod::Psb,
            HessianUpdateMethod::Bofill,
        ] {
            assert_eq!(update_hessian_with_method(&h, &dx, &dg, method), h);
        }
    }

    #[test]
    fn test_non_finite_input_skipped() {
        let h = indefinite();
        let dx = DVector::from_vec(vec![0.1, f64::NAN, 0.0]);
        let dg = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        assert_eq!(
            update_hessian_with_method(&h, &dx, &dg, HessianUpdateMethod::Bofill),
            h
        );
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("SR1".parse(), Ok(HessianUpdateMethod::Sr1));
        assert_eq!(" powell ".parse(), Ok(HessianUpdateMethod::Psb));
        assert_eq!("bofill".parse(), Ok(HessianUpdateMethod::Bofill));
        assert!("bfgs".parse::<HessianUpdateMethod>().is_err());
    }
}
