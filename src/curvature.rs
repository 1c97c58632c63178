//! Finite-difference refinement of the lowest free curvature.
//!
//! The approximate Hessian starts from a positive-definite guess, so before
//! any secant update it knows nothing about the saddle mode. [`lowest_curvature`]
//! measures it with a Davidson iteration on the free subspace: each new
//! direction costs one Hessian-vector product, supplied by the caller (the
//! search forms it from a gradient at a displaced configuration).
//!
//! The measured subspace and its products feed
//! [`ApproximateHessian::block_update`](crate::hessian::ApproximateHessian::block_update).

use crate::config::CurvatureSettings;
use crate::linalg::symmetric_eigen_sorted;
use log::debug;
use nalgebra::{DMatrix, DVector};

/// Directions whose orthogonalized residual is shorter than this are dropped.
const EXPANSION_FLOOR: f64 = 1e-8;

/// Outcome of a curvature refinement.
#[derive(Debug, Clone)]
pub struct RitzPair {
    /// Lowest Ritz value
    pub value: f64,
    /// Corresponding unit Ritz vector
    pub vector: DVector<f64>,
    /// Residual norm `|A x - θ x|`
    pub residual: f64,
    /// Orthonormal subspace explored, one column per product
    pub subspace: DMatrix<f64>,
    /// Products `A V`, symmetrized so that `Vᵀ A V` is symmetric
    pub products: DMatrix<f64>,
}

/// Davidson iteration for the lowest eigenpair of the operator behind `product`.
///
/// Starts from `start` (falls back to the first unit vector when it vanishes)
/// and expands with the orthogonalized residual until the residual drops
/// below `tolerance · |θ|`, the subspace reaches `max_vectors`, or the
/// whole space is spanned. `product` is called once per subspace vector.
pub fn lowest_curvature<E, F>(
    start: &DVector<f64>,
    settings: &CurvatureSettings,
    mut product: F,
) -> Result<RitzPair, E>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, E>,
{
    let n = start.len();
    let limit = settings.max_vectors.min(n).max(1);

    let mut next = if start.norm() > 0.0 {
        start.normalize()
    } else {
        let mut e = DVector::zeros(n);
        e[0] = 1.0;
        e
    };
    let mut vectors: Vec<DVector<f64>> = Vec::with_capacity(limit);
    let mut products: Vec<DVector<f64>> = Vec::with_capacity(limit);

    loop {
        products.push(product(&next)?);
        vectors.push(next);

        let v = DMatrix::from_columns(&vectors);
        let av = DMatrix::from_columns(&products);
        let ritz = symmetric_eigen_sorted(&(v.transpose() * &av));
        let theta = ritz.values[0];
        let y = ritz.vectors.column(0).clone_owned();
        let x = &v * &y;
        let r = &av * &y - &x * theta;
        let residual = r.norm();

        debug!(
            "Davidson {}: θ = {:.6e}, |r| = {:.3e}",
            vectors.len(),
            theta,
            residual
        );

        let done = residual <= settings.tolerance * theta.abs() || vectors.len() >= limit;
        let mut expansion = r;
        if !done {
            for _ in 0..2 {
                for b in &vectors {
                    let overlap = b.dot(&expansion);
                    expansion -= b * overlap;
                }
            }
        }
        if done || expansion.norm() < EXPANSION_FLOOR {
            let m = v.transpose() * &av;
            let antisymmetric = (&m - m.transpose()) * 0.5;
            let products = av - &v * antisymmetric;
            return Ok(RitzPair {
                value: theta,
                vector: x,
                residual,
                subspace: v,
                products,
            });
        }
        next = expansion.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::convert::Infallible;

    fn operator() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            4,
            &[
                0.6, 0.1, 0.0, 0.05, //
                0.1, -0.3, 0.2, 0.0, //
                0.0, 0.2, 0.9, 0.1, //
                0.05, 0.0, 0.1, 0.4,
            ],
        )
    }

    fn settings(tolerance: f64, max_vectors: usize) -> CurvatureSettings {
        CurvatureSettings {
            tolerance,
            max_vectors,
            ..CurvatureSettings::default()
        }
    }

    #[test]
    fn test_full_subspace_gives_exact_lowest_eigenvalue() {
        let a = operator();
        let exact = symmetric_eigen_sorted(&a).values[0];
        let start = DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0]);
        let result = lowest_curvature::<Infallible, _>(&start, &settings(1e-12, 4), |v| Ok(&a * v)).unwrap();
        assert_abs_diff_eq!(result.value, exact, epsilon = 1e-10);
        assert!(result.residual < 1e-8);
        let k = result.subspace.ncols();
        let gram = result.subspace.transpose() * &result.subspace;
        assert_abs_diff_eq!((gram - DMatrix::identity(k, k)).amax(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_subspace_limit_bounds_products() {
        let a = operator();
        let mut calls = 0;
        let start = DVector::from_vec(vec![0.0, 1.0, 0.0, 0.0]);
        let result = lowest_curvature::<Infallible, _>(&start, &settings(1e-12, 2), |v| {
            calls += 1;
            Ok(&a * v)
        })
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(result.subspace.ncols(), 2);
        assert!(result.value < 0.0);
        let m = result.subspace.transpose() * &result.products;
        assert_abs_diff_eq!((&m - m.transpose()).amax(), 0.0, epsilon = 1e-14);
    }

    #[test]
    fn test_single_dimension() {
        let result =
            lowest_curvature::<Infallible, _>(&DVector::from_vec(vec![-2.0]), &settings(0.1, 10), |v| Ok(v * -0.36))
                .unwrap();
        assert_abs_diff_eq!(result.value, -0.36, epsilon = 1e-14);
        assert_abs_diff_eq!(result.vector[0].abs(), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn test_product_error_propagates() {
        let result = lowest_curvature(&DVector::from_vec(vec![1.0, 0.0]), &settings(0.1, 2), |_| {
            Err::<DVector<f64>, _>("evaluation failed")
        });
        assert_eq!(result.unwrap_err(), "evaluation failed");
    }
}
