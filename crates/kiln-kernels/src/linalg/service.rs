//! Factorization service boundary and its host implementation.
//!
//! Matrices cross the boundary as column-major `f64` buffers, LAPACK style:
//! element `(i, j)` of an `m x n` matrix lives at `i + j * m`.

use kiln_core::{KilnError, Result};
use rayon::prelude::*;

/// Which singular vectors `gesvd` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvdJob {
    /// Singular values only.
    None,
    /// `min(m, n)` left and right singular vectors.
    Reduced,
    /// All `m` left and `n` right singular vectors.
    Full,
}

impl SvdJob {
    /// Columns of U for an `m x n` input.
    pub fn u_cols(self, m: usize, n: usize) -> usize {
        match self {
            SvdJob::None => 0,
            SvdJob::Reduced => m.min(n),
            SvdJob::Full => m,
        }
    }

    /// Rows of Vᵀ for an `m x n` input.
    pub fn vt_rows(self, m: usize, n: usize) -> usize {
        match self {
            SvdJob::None => 0,
            SvdJob::Reduced => m.min(n),
            SvdJob::Full => n,
        }
    }
}

/// Dense factorizations used by `lu_with_info` and `svd`.
///
/// Status codes follow LAPACK: 0 is success, `-i` means argument `i` was
/// illegal, positive values are routine specific.
pub trait FactorizationService: Send + Sync {
    /// LU with partial pivoting of `infos.len()` matrices of size `m x n`
    /// stored back to back in `a`, overwritten with the packed factors.
    ///
    /// Writes `min(m, n)` 1-based pivot rows per matrix. `infos[b] = i > 0`
    /// when `U(i, i)` of matrix `b` is exactly zero.
    fn getrf_batch(
        &self,
        m: usize,
        n: usize,
        a: &mut [f64],
        pivots: &mut [i64],
        infos: &mut [i64],
    ) -> Result<()>;

    /// Singular value decomposition `A = U diag(S) Vᵀ` of one `m x n`
    /// matrix. `s` holds `min(m, n)` values in descending order. `u` is
    /// `m x job.u_cols(m, n)`, `vt` is `job.vt_rows(m, n) x n`.
    ///
    /// Returns the number of off-diagonal pairs that failed to converge.
    #[allow(clippy::too_many_arguments)]
    fn gesvd(
        &self,
        job: SvdJob,
        m: usize,
        n: usize,
        a: &[f64],
        s: &mut [f64],
        u: &mut [f64],
        vt: &mut [f64],
    ) -> Result<i64>;
}

/// Host LU (partial pivoting) and one-sided Jacobi SVD.
#[derive(Debug, Clone)]
pub struct HostFactorization {
    /// Jacobi sweeps before the SVD gives up.
    pub max_sweeps: usize,
    /// Relative orthogonality threshold for a column pair.
    pub tolerance: f64,
}

impl Default for HostFactorization {
    fn default() -> Self {
        Self {
            max_sweeps: 60,
            tolerance: 1.0e-12,
        }
    }
}

const EPS: f64 = 1.0e-12;

impl FactorizationService for HostFactorization {
    fn getrf_batch(
        &self,
        m: usize,
        n: usize,
        a: &mut [f64],
        pivots: &mut [i64],
        infos: &mut [i64],
    ) -> Result<()> {
        let batch = infos.len();
        let k = m.min(n);
        if a.len() != batch * m * n || pivots.len() != batch * k {
            return Err(KilnError::Storage(format!(
                "getrf_batch: buffers do not match {batch} matrices of {m}x{n}"
            )));
        }
        if batch == 0 || k == 0 {
            infos.fill(0);
            return Ok(());
        }
        a.par_chunks_mut(m * n)
            .zip(pivots.par_chunks_mut(k))
            .zip(infos.par_iter_mut())
            .for_each(|((matrix, ipiv), info)| *info = getrf(m, n, matrix, ipiv));
        Ok(())
    }

    fn gesvd(
        &self,
        job: SvdJob,
        m: usize,
        n: usize,
        a: &[f64],
        s: &mut [f64],
        u: &mut [f64],
        vt: &mut [f64],
    ) -> Result<i64> {
        let k = m.min(n);
        let (u_cols, vt_rows) = (job.u_cols(m, n), job.vt_rows(m, n));
        if a.len() != m * n || s.len() != k || u.len() != m * u_cols || vt.len() != vt_rows * n {
            return Err(KilnError::Storage(format!(
                "gesvd: buffers do not match a {m}x{n} matrix"
            )));
        }
        if k == 0 {
            u.fill(0.0);
            vt.fill(0.0);
            complete_basis(m, 0, u_cols, u);
            let mut v = vec![0.0; n * vt_rows];
            complete_basis(n, 0, vt_rows, &mut v);
            write_transposed(n, vt_rows, &v, vt);
            return Ok(0);
        }

        // Jacobi works on the taller orientation; Aᵀ = V S Uᵀ swaps roles.
        let (left, right, unconverged) = if m >= n {
            let (sigma, left, right, unconverged) = self.jacobi(m, n, a.to_vec());
            s.copy_from_slice(&sigma);
            (left, right, unconverged)
        } else {
            let mut at = vec![0.0; m * n];
            write_transposed(m, n, a, &mut at);
            let (sigma, left, right, unconverged) = self.jacobi(n, m, at);
            s.copy_from_slice(&sigma);
            (right, left, unconverged)
        };

        if job != SvdJob::None {
            u[..m * k].copy_from_slice(&left);
            complete_basis(m, k, u_cols, u);
            let mut v = vec![0.0; n * vt_rows];
            v[..n * k].copy_from_slice(&right);
            complete_basis(n, k, vt_rows, &mut v);
            write_transposed(n, vt_rows, &v, vt);
        }
        Ok(unconverged)
    }
}

impl HostFactorization {
    /// One-sided Jacobi on a column-major `rows x cols` matrix with
    /// `rows >= cols`. Returns descending singular values, `rows x cols` left
    /// vectors, `cols x cols` right vectors and the unconverged pair count.
    fn jacobi(&self, rows: usize, cols: usize, mut w: Vec<f64>) -> (Vec<f64>, Vec<f64>, Vec<f64>, i64) {
        let mut v = vec![0.0; cols * cols];
        for i in 0..cols {
            v[i + i * cols] = 1.0;
        }

        // Columns below this squared norm count as numerically zero.
        let negligible = EPS * EPS * w.iter().map(|x| x * x).sum::<f64>();
        let mut unconverged = 0;
        for _ in 0..self.max_sweeps {
            unconverged = 0;
            for p in 0..cols {
                for q in (p + 1)..cols {
                    let (mut alpha, mut beta, mut gamma) = (0.0, 0.0, 0.0);
                    for i in 0..rows {
                        let (wp, wq) = (w[i + p * rows], w[i + q * rows]);
                        alpha += wp * wp;
                        beta += wq * wq;
                        gamma += wp * wq;
                    }
                    if alpha.min(beta) <= negligible
                        || gamma.abs() <= self.tolerance * (alpha * beta).sqrt()
                    {
                        continue;
                    }
                    unconverged += 1;
                    let zeta = (beta - alpha) / (2.0 * gamma);
                    let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                    let c = 1.0 / (1.0 + t * t).sqrt();
                    let s = c * t;
                    rotate(&mut w, rows, p, q, c, s);
                    rotate(&mut v, cols, p, q, c, s);
                }
            }
            if unconverged == 0 {
                break;
            }
        }

        let norms: Vec<f64> = (0..cols)
            .map(|j| w[j * rows..(j + 1) * rows].iter().map(|x| x * x).sum::<f64>().sqrt())
            .collect();
        let mut order: Vec<usize> = (0..cols).collect();
        order.sort_by(|&a, &b| norms[b].total_cmp(&norms[a]));

        let scale = norms.iter().copied().fold(0.0, f64::max);
        let mut sigma = Vec::with_capacity(cols);
        let mut left = vec![0.0; rows * cols];
        let mut right = vec![0.0; cols * cols];
        for (dst, &src) in order.iter().enumerate() {
            let norm = norms[src];
            sigma.push(norm);
            if norm > EPS * scale.max(1.0) {
                for i in 0..rows {
                    left[i + dst * rows] = w[i + src * rows] / norm;
                }
            }
            right[dst * cols..(dst + 1) * cols].copy_from_slice(&v[src * cols..(src + 1) * cols]);
        }
        // Left vectors of zero singular values are filled from the basis.
        let first_zero = sigma
            .iter()
            .position(|&x| x <= EPS * scale.max(1.0))
            .unwrap_or(cols);
        complete_basis(rows, first_zero, cols, &mut left);
        (sigma, left, right, unconverged)
    }
}

/// Column rotation `(p, q) <- (c p - s q, s p + c q)`.
fn rotate(data: &mut [f64], rows: usize, p: usize, q: usize, c: f64, s: f64) {
    for i in 0..rows {
        let (xp, xq) = (data[i + p * rows], data[i + q * rows]);
        data[i + p * rows] = c * xp - s * xq;
        data[i + q * rows] = s * xp + c * xq;
    }
}

/// Fill columns `filled..target` of a column-major `rows x target` matrix
/// with unit vectors orthonormal to the earlier columns (Gram-Schmidt over
/// the standard basis).
fn complete_basis(rows: usize, filled: usize, target: usize, data: &mut [f64]) {
    let mut col = filled;
    let mut basis = 0;
    while col < target && basis < rows {
        let mut vec = vec![0.0; rows];
        vec[basis] = 1.0;
        basis += 1;
        for j in 0..col {
            let column = &data[j * rows..(j + 1) * rows];
            let proj: f64 = column.iter().zip(&vec).map(|(a, b)| a * b).sum();
            for (x, c) in vec.iter_mut().zip(column) {
                *x -= proj * c;
            }
        }
        let norm = vec.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 1.0e-10 {
            for (dst, x) in data[col * rows..(col + 1) * rows].iter_mut().zip(&vec) {
                *dst = x / norm;
            }
            col += 1;
        }
    }
}

/// Write the transpose of a column-major `rows x cols` matrix.
fn write_transposed(rows: usize, cols: usize, src: &[f64], dst: &mut [f64]) {
    for j in 0..cols {
        for i in 0..rows {
            dst[j + i * cols] = src[i + j * rows];
        }
    }
}

/// Unblocked partial-pivot LU of one column-major matrix. Returns the
/// LAPACK status.
fn getrf(m: usize, n: usize, a: &mut [f64], ipiv: &mut [i64]) -> i64 {
    let mut info = 0;
    for j in 0..m.min(n) {
        let mut pivot_row = j;
        let mut pivot_abs = a[j + j * m].abs();
        for r in (j + 1)..m {
            let abs = a[r + j * m].abs();
            if abs > pivot_abs {
                pivot_abs = abs;
                pivot_row = r;
            }
        }
        ipiv[j] = pivot_row as i64 + 1;

        if a[pivot_row + j * m] != 0.0 {
            if pivot_row != j {
                for c in 0..n {
                    a.swap(j + c * m, pivot_row + c * m);
                }
            }
            let pivot = a[j + j * m];
            for r in (j + 1)..m {
                a[r + j * m] /= pivot;
            }
        } else if info == 0 {
            info = j as i64 + 1;
        }

        for c in (j + 1)..n {
            let u = a[j + c * m];
            if u != 0.0 {
                for r in (j + 1)..m {
                    a[r + c * m] -= a[r + j * m] * u;
                }
            }
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{a} vs {b} (tol {tol})");
    }

    #[test]
    fn test_getrf_pivots() {
        // [[1, 2], [3, 4]] column-major
        let mut a = vec![1.0, 3.0, 2.0, 4.0];
        let mut ipiv = vec![0; 2];
        let info = getrf(2, 2, &mut a, &mut ipiv);
        assert_eq!(info, 0);
        assert_eq!(ipiv, vec![2, 2]);
        // L = [[1, 0], [1/3, 1]], U = [[3, 4], [0, 2/3]]
        assert_close(a[0], 3.0, 1e-12);
        assert_close(a[1], 1.0 / 3.0, 1e-12);
        assert_close(a[2], 4.0, 1e-12);
        assert_close(a[3], 2.0 / 3.0, 1e-12);
    }

    #[test]
    fn test_getrf_singular_info() {
        let mut a = vec![1.0, 2.0, 2.0, 4.0];
        let mut ipiv = vec![0; 2];
        assert_eq!(getrf(2, 2, &mut a, &mut ipiv), 2);

        let mut zeros = vec![0.0; 4];
        assert_eq!(getrf(2, 2, &mut zeros, &mut ipiv), 1);
    }

    #[test]
    fn test_getrf_batch_lengths_checked() {
        let host = HostFactorization::default();
        let mut a = vec![0.0; 3];
        let err = host.getrf_batch(2, 2, &mut a, &mut [0; 2], &mut [0; 1]);
        assert!(err.is_err());
    }

    fn reconstruct(m: usize, n: usize, job: SvdJob, a: &[f64]) {
        let host = HostFactorization::default();
        let k = m.min(n);
        let (uc, vr) = (job.u_cols(m, n), job.vt_rows(m, n));
        let mut s = vec![0.0; k];
        let mut u = vec![0.0; m * uc];
        let mut vt = vec![0.0; vr * n];
        assert_eq!(host.gesvd(job, m, n, a, &mut s, &mut u, &mut vt).unwrap(), 0);
        assert!(s.windows(2).all(|w| w[0] >= w[1]));
        for i in 0..m {
            for j in 0..n {
                let value: f64 = (0..k).map(|l| u[i + l * m] * s[l] * vt[l + j * vr]).sum();
                assert_close(value, a[i + j * m], 1e-9);
            }
        }
        // U columns orthonormal
        for p in 0..uc {
            for q in 0..uc {
                let dot: f64 = (0..m).map(|i| u[i + p * m] * u[i + q * m]).sum();
                assert_close(dot, if p == q { 1.0 } else { 0.0 }, 1e-9);
            }
        }
    }

    #[test]
    fn test_gesvd_tall_and_wide() {
        let tall = [1.0, 3.0, 5.0, 2.0, 4.0, 6.0];
        reconstruct(3, 2, SvdJob::Reduced, &tall);
        reconstruct(3, 2, SvdJob::Full, &tall);
        reconstruct(2, 3, SvdJob::Full, &tall);
        reconstruct(2, 3, SvdJob::Reduced, &tall);
    }

    #[test]
    fn test_gesvd_rank_deficient() {
        // rank 1: columns are multiples of [1, 2, 2]
        let a = [1.0, 2.0, 2.0, 2.0, 4.0, 4.0];
        reconstruct(3, 2, SvdJob::Full, &a);
    }

    #[test]
    fn test_gesvd_values() {
        let host = HostFactorization::default();
        // diag(3, 4) -> singular values 4, 3
        let a = [3.0, 0.0, 0.0, 4.0];
        let mut s = vec![0.0; 2];
        host.gesvd(SvdJob::None, 2, 2, &a, &mut s, &mut [], &mut []).unwrap();
        assert_close(s[0], 4.0, 1e-12);
        assert_close(s[1], 3.0, 1e-12);
    }

    #[test]
    fn test_gesvd_reports_unconverged() {
        let host = HostFactorization {
            max_sweeps: 1,
            ..HostFactorization::default()
        };
        let a = [4.0, 1.0, 2.0, 1.0, 3.0, 0.5, 2.0, 0.5, 5.0];
        let mut s = vec![0.0; 3];
        let info = host
            .gesvd(SvdJob::None, 3, 3, &a, &mut s, &mut [], &mut [])
            .unwrap();
        assert!(info > 0);
    }
}
