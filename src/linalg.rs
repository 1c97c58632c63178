//! Small dense linear-algebra helpers built on nalgebra's decompositions.
//!
//! Pseudo-inverses of the Wilson B-matrix come from an SVD. Orthonormal bases
//! of row and column spaces and orthogonal complements reduce to
//! eigen-decompositions of symmetric positive semi-definite products, which
//! are robust for the rank-deficient matrices produced by redundant
//! coordinates.

use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// Relative eigenvalue cutoff separating a Gram matrix's range from its null space.
pub const RANGE_TOLERANCE: f64 = 1e-10;

/// Eigenpairs of a symmetric matrix sorted by ascending eigenvalue.
#[derive(Debug, Clone)]
pub struct Eigenpairs {
    /// Eigenvalues in ascending order
    pub values: DVector<f64>,
    /// Unit eigenvectors stored as columns, in the same order as `values`
    pub vectors: DMatrix<f64>,
}

impl Eigenpairs {
    /// Number of eigenpairs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the decomposition is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of eigenvalues strictly below `-tolerance`.
    pub fn count_negative(&self, tolerance: f64) -> usize {
        self.values.iter().filter(|&&v| v < -tolerance).count()
    }
}

/// Eigen-decomposition of a symmetric matrix with eigenvalues sorted ascending.
pub fn symmetric_eigen_sorted(matrix: &DMatrix<f64>) -> Eigenpairs {
    let n = matrix.nrows();
    if n == 0 {
        return Eigenpairs {
            values: DVector::zeros(0),
            vectors: DMatrix::zeros(0, 0),
        };
    }

    let sym = (matrix + matrix.transpose()) * 0.5;
    let eigen = sym.symmetric_eigen();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let mut values = DVector::zeros(n);
    let mut vectors = DMatrix::zeros(n, n);
    for (dst, &src) in order.iter().enumerate() {
        values[dst] = eigen.eigenvalues[src];
        vectors.set_column(dst, &eigen.eigenvectors.column(src));
    }
    Eigenpairs { values, vectors }
}

/// Moore-Penrose pseudo-inverse.
///
/// Computed from a singular value decomposition of `a` itself, so near-
/// redundant B-matrices keep their conditioning. `rel_tol` applies to the
/// squared singular values, matching [`orthonormal_range`]: singular values
/// below `√rel_tol · σ_max` are treated as zero.
pub fn pseudo_inverse(a: &DMatrix<f64>, rel_tol: f64) -> DMatrix<f64> {
    let (rows, cols) = a.shape();
    if rows == 0 || cols == 0 {
        return DMatrix::zeros(cols, rows);
    }

    let svd = a.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    if sigma_max <= 0.0 {
        return DMatrix::zeros(cols, rows);
    }
    svd.pseudo_inverse(rel_tol.sqrt() * sigma_max)
        .unwrap_or_else(|_| DMatrix::zeros(cols, rows))
}

/// Orthonormal basis (as columns) of the column space of `a`.
pub fn orthonormal_range(a: &DMatrix<f64>, rel_tol: f64) -> DMatrix<f64> {
    let (rows, cols) = a.shape();
    if rows == 0 || cols == 0 {
        return DMatrix::zeros(rows, 0);
    }

    let gram = a * a.transpose();
    let eigen = symmetric_eigen_sorted(&gram);
    let lambda_max = eigen.values.iter().cloned().fold(0.0, f64::max);
    if lambda_max <= f64::EPSILON {
        return DMatrix::zeros(rows, 0);
    }

    let cutoff = rel_tol * lambda_max;
    let keep: Vec<usize> = (0..rows).filter(|&i| eigen.values[i] > cutoff).collect();
    select_columns(&eigen.vectors, &keep)
}

/// Orthonormal basis of the part of `span(basis)` orthogonal to `directions`.
///
/// `basis` must have orthonormal columns. `directions` may be rank deficient
/// and need not lie inside `span(basis)`; only their projection onto it is
/// removed.
pub fn orthogonal_complement(
    basis: &DMatrix<f64>,
    directions: &DMatrix<f64>,
    rel_tol: f64,
) -> DMatrix<f64> {
    let m = basis.ncols();
    if m == 0 || directions.ncols() == 0 {
        return basis.clone();
    }

    // Removed directions expressed in the coordinates of `basis`.
    let local = basis.transpose() * directions;
    let removed = orthonormal_range(&local, rel_tol);
    if removed.ncols() == 0 {
        return basis.clone();
    }

    let projector = DMatrix::identity(m, m) - &removed * removed.transpose();
    let eigen = symmetric_eigen_sorted(&projector);
    let keep: Vec<usize> = (0..m).filter(|&i| eigen.values[i] > 0.5).collect();
    basis * select_columns(&eigen.vectors, &keep)
}

/// Copy the listed columns into a new matrix.
pub fn select_columns(matrix: &DMatrix<f64>, columns: &[usize]) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(matrix.nrows(), columns.len());
    for (dst, &src) in columns.iter().enumerate() {
        out.set_column(dst, &matrix.column(src));
    }
    out
}

/// Wrap an angle difference into (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// Largest absolute component of a vector (0 for an empty vector).
pub fn max_abs(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_eigen_sorted_ascending() {
        let m = DMatrix::from_row_slice(3, 3, &[3.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 2.0]);
        let eig = symmetric_eigen_sorted(&m);
        assert_abs_diff_eq!(eig.values[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eig.values[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eig.values[2], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eig.vectors[(1, 0)].abs(), 1.0, epsilon = 1e-12);
        assert_eq!(eig.count_negative(1e-8), 1);
    }

    #[test]
    fn test_pseudo_inverse_of_rank_deficient_matrix() {
        // Rows 0 and 2 are identical.
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 0.0, 1.0, 1.0, 2.0]);
        let pinv = pseudo_inverse(&a, RANGE_TOLERANCE);
        assert_eq!(pinv.shape(), (2, 3));
        let apa = &a * &pinv * &a;
        assert_abs_diff_eq!((apa - &a).norm(), 0.0, epsilon = 1e-10);
        let pap = &pinv * &a * &pinv;
        assert_abs_diff_eq!((pap - &pinv).norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_pseudo_inverse_of_near_redundant_matrix() {
        // Singular values about 2 and 5e-5: still inside the range.
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0 + 1e-4]);
        let pinv = pseudo_inverse(&a, RANGE_TOLERANCE);
        let identity = &pinv * &a;
        assert!(
            (identity - DMatrix::identity(2, 2)).amax() < 1e-9,
            "pseudo-inverse lost accuracy on an ill-conditioned matrix"
        );
    }

    #[test]
    fn test_orthonormal_range_drops_dependent_columns() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let u = orthonormal_range(&a, RANGE_TOLERANCE);
        assert_eq!(u.ncols(), 2);
        let utu = u.transpose() * &u;
        assert_abs_diff_eq!((utu - DMatrix::identity(2, 2)).norm(), 0.0, epsilon = 1e-12);
        // Nothing along z.
        assert_abs_diff_eq!(u.row(2).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_orthogonal_complement() {
        let basis = DMatrix::identity(3, 3);
        let directions = DMatrix::from_column_slice(3, 1, &[1.0, 1.0, 0.0]);
        let free = orthogonal_complement(&basis, &directions, RANGE_TOLERANCE);
        assert_eq!(free.ncols(), 2);
        let overlap = free.transpose() * &directions;
        assert_abs_diff_eq!(overlap.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_complement_without_directions_is_identity_map() {
        let basis = DMatrix::identity(2, 2);
        let free = orthogonal_complement(&basis, &DMatrix::zeros(2, 0), RANGE_TOLERANCE);
        assert_eq!(free, basis);
    }

    #[test]
    fn test_wrap_angle() {
        assert_abs_diff_eq!(wrap_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_angle(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_angle(0.25), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_angle(-PI), PI, epsilon = 1e-12);
    }
}
