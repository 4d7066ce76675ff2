//! Small dense linear algebra: ridge solves and truncated SVDs.
//!
//! Decompositions go through `nalgebra`; the rest of the crate only sees
//! `ndarray` matrices.
use std::cmp::Ordering;

use nalgebra::{DMatrix, QR, SVD};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

const PIVOT_TOLERANCE: f64 = 1e-12;
const SVD_OVERSAMPLES: usize = 10;
const SVD_MAX_ITERATIONS: usize = 10_000;

/// Solve `a x = b`.
///
/// Ridge normal equations are symmetric positive definite, so Cholesky is
/// tried first, then Gaussian elimination with partial pivoting. `None`
/// means the system is singular or produced non-finite values.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    cholesky_solve(a, b)
        .or_else(|| gaussian_solve(a, b))
        .filter(|x| x.iter().all(|value| value.is_finite()))
}

fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }

            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * z[k];
        }
        z[i] = sum / l[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }

    Some(x)
}

fn gaussian_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut m = a.to_owned();
    let mut rhs = b.to_owned();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            m[[i, col]]
                .abs()
                .partial_cmp(&m[[j, col]].abs())
                .unwrap_or(Ordering::Equal)
        })?;

        if m[[pivot, col]].abs() < PIVOT_TOLERANCE {
            return None;
        }

        if pivot != col {
            for k in 0..n {
                m.swap([col, k], [pivot, k]);
            }
            rhs.swap(col, pivot);
        }

        for row in (col + 1)..n {
            let factor = m[[row, col]] / m[[col, col]];
            for k in col..n {
                m[[row, k]] -= factor * m[[col, k]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = rhs[i];
        for k in (i + 1)..n {
            sum -= m[[i, k]] * x[k];
        }
        x[i] = sum / m[[i, i]];
    }

    Some(x)
}

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn to_array(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

/// Orthonormal basis of the column space, from a thin QR decomposition.
pub fn orthonormalize(a: &Array2<f64>) -> Array2<f64> {
    to_array(&QR::new(to_dmatrix(a)).q())
}

/// Rank-`k` factors `u · diag(sigma) · vt` of a dense matrix.
#[derive(Clone, Debug)]
pub struct Svd {
    /// Left singular vectors as columns.
    pub u: Array2<f64>,
    /// Singular values, largest first.
    pub sigma: Array1<f64>,
    /// Right singular vectors as rows.
    pub vt: Array2<f64>,
}

/// Exact SVD of `m`, truncated to its `k` largest singular values.
///
/// `None` when the decomposition does not converge.
pub fn truncated_svd(m: &Array2<f64>, k: usize) -> Option<Svd> {
    let decomposition = SVD::try_new(to_dmatrix(m), true, true, f64::EPSILON, SVD_MAX_ITERATIONS)?;
    let (u, v_t) = match (decomposition.u, decomposition.v_t) {
        (Some(u), Some(v_t)) => (to_array(&u), to_array(&v_t)),
        _ => return None,
    };
    let singular_values = &decomposition.singular_values;

    let mut order: Vec<usize> = (0..singular_values.len()).collect();
    order.sort_by(|&i, &j| {
        singular_values[j]
            .partial_cmp(&singular_values[i])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(k);

    Some(Svd {
        u: u.select(Axis(1), &order),
        sigma: order.iter().map(|&i| singular_values[i]).collect(),
        vt: v_t.select(Axis(0), &order),
    })
}

/// Randomized truncated SVD (Halko, Martinsson and Tropp).
///
/// A Gaussian sketch of the range of `m` is refined by `n_iter` power
/// iterations; the small projected problem is then decomposed exactly. The
/// effective rank is capped by the smallest dimension of `m`. With a seeded
/// `rng` the output is fully deterministic.
pub fn randomized_svd<R: Rng>(
    m: &Array2<f64>,
    k: usize,
    n_iter: usize,
    rng: &mut R,
) -> Option<Svd> {
    let (nb_rows, nb_cols) = m.dim();
    let k = k.min(nb_rows).min(nb_cols);
    let sketch_size = (k + SVD_OVERSAMPLES).min(nb_rows).min(nb_cols);

    let omega = Array2::<f64>::from_shape_simple_fn((nb_cols, sketch_size), || {
        rng.sample(StandardNormal)
    });

    let mut q = orthonormalize(&m.dot(&omega));
    for _ in 0..n_iter {
        q = orthonormalize(&m.t().dot(&q));
        q = orthonormalize(&m.dot(&q));
    }

    let projected = truncated_svd(&q.t().dot(m), k)?;

    Some(Svd {
        u: q.dot(&projected.u),
        sigma: projected.sigma,
        vt: projected.vt,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-8
    }

    #[test]
    fn solves_positive_definite_systems() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];

        let x = solve(&a, &b).unwrap();
        assert!(close(x[0], 1.0 / 11.0));
        assert!(close(x[1], 7.0 / 11.0));
    }

    #[test]
    fn falls_back_to_pivoting() {
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let b = array![2.0, 3.0];

        let x = solve(&a, &b).unwrap();
        assert!(close(x[0], 3.0));
        assert!(close(x[1], 2.0));
    }

    #[test]
    fn singular_systems_are_reported() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 1.0];

        assert!(solve(&a, &b).is_none());
    }

    #[test]
    fn orthonormal_basis() {
        let a = array![[1.0, 2.0], [0.0, 1.0], [1.0, 0.0]];
        let q = orthonormalize(&a);

        assert_eq!(q.dim(), (3, 2));
        let gram = q.t().dot(&q);
        for ((i, j), value) in gram.indexed_iter() {
            assert!(close(*value, if i == j { 1.0 } else { 0.0 }));
        }

        // Both columns of `a` stay in the span of `q`.
        let residual = &a - &q.dot(&q.t().dot(&a));
        assert!(residual.iter().all(|value| value.abs() < 1e-8));
    }

    #[test]
    fn exact_svd_is_sorted_and_truncated() {
        let m = array![[3.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 1.0]];
        let svd = truncated_svd(&m, 2).unwrap();

        assert_eq!(svd.u.dim(), (3, 2));
        assert_eq!(svd.vt.dim(), (2, 3));
        assert!(close(svd.sigma[0], 5.0));
        assert!(close(svd.sigma[1], 3.0));
        assert!(close(svd.u[[1, 0]].abs(), 1.0));
        assert!(close(svd.vt[[1, 0]].abs(), 1.0));
    }

    #[test]
    fn randomized_svd_reconstructs_low_rank_matrix() {
        let left = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, -1.0]];
        let right = array![[1.0, 2.0, 0.0, -1.0, 3.0], [0.5, -1.0, 2.0, 1.0, 0.0]];
        let m = left.dot(&right);

        let mut rng = XorShiftRng::seed_from_u64(42);
        let svd = randomized_svd(&m, 2, 5, &mut rng).unwrap();

        assert_eq!(svd.u.dim(), (4, 2));
        assert_eq!(svd.vt.dim(), (2, 5));
        assert!(svd.sigma[0] >= svd.sigma[1]);

        let reconstructed = svd.u.dot(&Array2::from_diag(&svd.sigma)).dot(&svd.vt);
        for (x, y) in reconstructed.iter().zip(m.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn rank_is_capped_by_dimensions() {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let mut rng = XorShiftRng::seed_from_u64(0);
        let svd = randomized_svd(&m, 10, 3, &mut rng).unwrap();

        assert_eq!(svd.sigma.len(), 2);
    }
}
