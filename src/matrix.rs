//! Small dense linear algebra used by keypoint refinement and transform fitting.
//!
//! Everything operates on `nalgebra` dynamic matrices. Inversion and the square solver
//! are Gaussian elimination with partial pivoting so that the pivot tolerance is under
//! our control; the decomposition itself comes from `nalgebra`.

use crate::errors::{Error, Result};
use nalgebra::{DMatrix, DVector, Dynamic, SVD};
use float_ord::FloatOrd;

/// Pivots with a magnitude below this are treated as zero.
const PIVOT_EPSILON: f64 = 1e-12;

/// Inverts a square matrix after adding `regularization` to its diagonal.
///
/// Returns [`Error::NotSquare`] for non-square input and [`Error::Singular`] if a pivot
/// vanishes even after regularization.
pub fn invert(matrix: &DMatrix<f64>, regularization: f64) -> Result<DMatrix<f64>> {
    let (n, cols) = matrix.shape();
    if n != cols {
        return Err(Error::NotSquare { rows: n, cols });
    }
    // Augmented [A + λI | I].
    let mut augmented = DMatrix::<f64>::zeros(n, 2 * n);
    augmented.columns_mut(0, n).copy_from(matrix);
    for i in 0..n {
        augmented[(i, i)] += regularization;
        augmented[(i, i + n)] = 1.0;
    }

    for i in 0..n {
        let pivot_row = (i..n)
            .max_by_key(|&k| FloatOrd(augmented[(k, i)].abs()))
            .unwrap_or(i);
        if pivot_row != i {
            augmented.swap_rows(i, pivot_row);
        }
        let pivot = augmented[(i, i)];
        if !pivot.is_finite() || pivot.abs() < PIVOT_EPSILON {
            return Err(Error::Singular);
        }
        for j in 0..2 * n {
            augmented[(i, j)] /= pivot;
        }
        for k in 0..n {
            if k != i {
                let factor = augmented[(k, i)];
                if factor != 0.0 {
                    for j in 0..2 * n {
                        augmented[(k, j)] -= factor * augmented[(i, j)];
                    }
                }
            }
        }
    }

    Ok(augmented.columns(n, n).into_owned())
}

/// Matrix product with a dimension check.
pub fn multiply(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if a.ncols() != b.nrows() {
        return Err(Error::DimensionMismatch {
            expected: a.ncols(),
            actual: b.nrows(),
        });
    }
    Ok(a * b)
}

/// Solves the square system `a * x = b` by Gaussian elimination with partial pivoting.
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let (n, cols) = a.shape();
    if n != cols {
        return Err(Error::NotSquare { rows: n, cols });
    }
    if b.len() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            actual: b.len(),
        });
    }
    let mut augmented = DMatrix::<f64>::zeros(n, n + 1);
    augmented.columns_mut(0, n).copy_from(a);
    augmented.column_mut(n).copy_from(b);

    // Forward elimination.
    for i in 0..n {
        let pivot_row = (i..n)
            .max_by_key(|&k| FloatOrd(augmented[(k, i)].abs()))
            .unwrap_or(i);
        if pivot_row != i {
            augmented.swap_rows(i, pivot_row);
        }
        let pivot = augmented[(i, i)];
        if !pivot.is_finite() || pivot.abs() < PIVOT_EPSILON {
            return Err(Error::Singular);
        }
        for k in (i + 1)..n {
            let factor = augmented[(k, i)] / pivot;
            if factor != 0.0 {
                for j in i..=n {
                    augmented[(k, j)] -= factor * augmented[(i, j)];
                }
            }
        }
    }

    // Back substitution.
    let mut x = DVector::<f64>::zeros(n);
    for i in (0..n).rev() {
        let tail: f64 = ((i + 1)..n).map(|j| augmented[(i, j)] * x[j]).sum();
        x[i] = (augmented[(i, n)] - tail) / augmented[(i, i)];
    }
    Ok(x)
}

/// Least-squares solution of an overdetermined system through its normal equations.
pub fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    if a.nrows() < a.ncols() {
        return Err(Error::DimensionMismatch {
            expected: a.ncols(),
            actual: a.nrows(),
        });
    }
    if b.len() != a.nrows() {
        return Err(Error::DimensionMismatch {
            expected: a.nrows(),
            actual: b.len(),
        });
    }
    let at = a.transpose();
    solve(&(&at * a), &(&at * b))
}

/// Full singular value decomposition.
pub fn svd(a: &DMatrix<f64>) -> Result<SVD<f64, Dynamic, Dynamic>> {
    a.clone()
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or(Error::SvdFailed)
}

/// Unit vector `x` minimizing `|a * x|`, i.e. the right singular vector of the smallest
/// singular value.
///
/// Wide matrices are padded with zero rows first, since the thin decomposition would
/// otherwise drop exactly the null space we are after.
pub fn null_vector(a: &DMatrix<f64>) -> Result<DVector<f64>> {
    let (rows, cols) = a.shape();
    let padded = if rows < cols {
        a.clone().insert_rows(rows, cols - rows, 0.0)
    } else {
        a.clone()
    };
    let decomposition = padded
        .try_svd(false, true, f64::EPSILON, 0)
        .ok_or(Error::SvdFailed)?;
    let v_t = decomposition.v_t.ok_or(Error::SvdFailed)?;
    let smallest = decomposition
        .singular_values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &value)| FloatOrd(value))
        .map(|(ix, _)| ix)
        .ok_or(Error::SvdFailed)?;
    Ok(v_t.row(smallest).transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn well_conditioned(n: usize, rng: &mut Pcg64) -> DMatrix<f64> {
        let mut m = DMatrix::from_fn(n, n, |_, _| rng.gen_range(-1.0..1.0));
        // Diagonal dominance keeps the condition number small.
        for i in 0..n {
            m[(i, i)] += n as f64 * 2.0;
        }
        m
    }

    #[test]
    fn inverse_round_trip() {
        let mut rng = Pcg64::seed_from_u64(7);
        for n in 1..=6 {
            let m = well_conditioned(n, &mut rng);
            let inv = invert(&m, 0.0).unwrap();
            let back = invert(&inv, 0.0).unwrap();
            assert_relative_eq!(back, m, epsilon = 1e-9);
            let identity = multiply(&m, &inv).unwrap();
            assert_relative_eq!(identity, DMatrix::identity(n, n), epsilon = 1e-9);
        }
    }

    #[test]
    fn inverse_needs_pivoting() {
        let m = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let inv = invert(&m, 0.0).unwrap();
        assert_relative_eq!(inv, m, epsilon = 1e-12);
    }

    #[test]
    fn non_square_inverse_is_rejected() {
        let m = DMatrix::<f64>::zeros(2, 3);
        assert_eq!(invert(&m, 0.0), Err(Error::NotSquare { rows: 2, cols: 3 }));
    }

    #[test]
    fn singular_inverse_is_reported() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let err = invert(&m, 0.0).unwrap_err();
        assert_eq!(err, Error::Singular);
        assert!(err.is_numerical());
    }

    #[test]
    fn regularization_rescues_zero_matrix() {
        let m = DMatrix::<f64>::zeros(3, 3);
        let inv = invert(&m, 1e-3).unwrap();
        assert_relative_eq!(inv, DMatrix::identity(3, 3) * 1e3, epsilon = 1e-6);
    }

    #[test]
    fn multiply_checks_dimensions() {
        let a = DMatrix::<f64>::zeros(2, 3);
        let b = DMatrix::<f64>::zeros(2, 3);
        assert_eq!(
            multiply(&a, &b),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn least_squares_recovers_line() {
        // y = 2x + 1 sampled exactly.
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let a = DMatrix::from_fn(xs.len(), 2, |r, c| if c == 0 { xs[r] } else { 1.0 });
        let b = DVector::from_iterator(xs.len(), xs.iter().map(|x| 2.0 * x + 1.0));
        let x = solve_least_squares(&a, &b).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn null_vector_of_wide_matrix() {
        // The null space of this 2x3 matrix is spanned by (1, -2, 1).
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 1.0, 1.0, 1.0, 2.0, 3.0]);
        let v = null_vector(&a).unwrap();
        let residual = &a * &v;
        assert!(residual.norm() < 1e-9);
        assert_relative_eq!(v.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!((v[0] / v[1]).abs(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn svd_reconstructs_input() {
        let mut rng = Pcg64::seed_from_u64(3);
        let m = DMatrix::from_fn(4, 3, |_, _| rng.gen_range(-1.0..1.0));
        let decomposition = svd(&m).unwrap();
        let rebuilt = decomposition.recompose().unwrap();
        assert_relative_eq!(rebuilt, m, epsilon = 1e-9);
    }
}
