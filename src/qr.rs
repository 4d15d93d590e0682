//! Incremental QR factorization with column insert/delete (C4)
//!
//! Maintains `A = Q * R` as columns are inserted and deleted one at a time,
//! using iterated modified Gram-Schmidt (with a restart heuristic for
//! numerically difficult columns) for insertion and a chain of Givens
//! reflectors to restore upper-triangularity after both insertion and
//! deletion. The inner products and norms route through [`Cohort`] so the
//! same code serves both a single, fully-local matrix and one whose columns
//! are row-partitioned across a cohort.
//!
//! `rows` is *local* rows when `Q`'s columns are row-partitioned across a
//! cohort of size > 1 (each rank stores only the rows it owns); `row_offset`
//! is this rank's first global row index, needed only by the restart
//! heuristic's cross-rank "row of Q with minimal length" search.

#![forbid(unsafe_code)]

use crate::cohort::Cohort;
use crate::error::{invariant, CoreError};
use crate::linalg::{DenseMatrix, DenseVector};

/// Reorthogonalization threshold from the modified-Gram-Schmidt-with-reorthogonalization
/// literature (Daniel/Gragg/Kaufman/Stewart): `1/sqrt(2)`.
pub const DEFAULT_THETA: f64 = std::f64::consts::FRAC_1_SQRT_2;
/// Default additional-mass factor for the termination test.
pub const DEFAULT_OMEGA: f64 = 1e-10;
/// Default restart threshold on rho-reduction.
pub const DEFAULT_SIGMA: f64 = 1e-3;

/// A single Givens reflector `G` with `(x, y) * G = (t, 0)`.
#[derive(Debug, Clone, Copy)]
struct GivensRot {
    gamma: f64,
    sigma: f64,
}

/// Compute the reflector that zeros `y` against `x`, returning the reflector
/// and the new (unchanged-direction) value `t` that replaces `x` (`y`
/// becomes `0`). `y == 0` is special-cased to the identity reflector.
fn compute_reflector(x: f64, y: f64) -> (GivensRot, f64) {
    if y == 0.0 {
        (GivensRot { gamma: 1.0, sigma: 0.0 }, x)
    } else {
        let mu = x.abs().max(y.abs());
        let mut t = mu * ((x / mu).powi(2) + (y / mu).powi(2)).sqrt();
        if x < 0.0 {
            t = -t;
        }
        (GivensRot { gamma: x / t, sigma: y / t }, t)
    }
}

/// Apply `grot` to the parallel pair `(p, q)` over index range `[k, l)`,
/// replacing `[p(k:l), q(k:l)]` by `[p(k:l), q(k:l)] * G`.
fn apply_reflector(grot: GivensRot, k: usize, l: usize, p: &mut [f64], q: &mut [f64]) {
    let nu = grot.sigma / (1.0 + grot.gamma);
    for j in k..l {
        let u = p[j];
        let v = q[j];
        let t = u * grot.gamma + v * grot.sigma;
        p[j] = t;
        q[j] = (t + u) * nu - v;
    }
}

/// Incremental `A = Q * R` factorization.
///
/// `Q` is `rows x cols` with (to working precision) orthonormal columns;
/// `R` is `cols x cols` upper triangular.
#[derive(Clone, Debug)]
pub struct QrFactorization {
    q: DenseMatrix,
    r: DenseMatrix,
    rows: usize,
    cols: usize,
    omega: f64,
    theta: f64,
    sigma: f64,
}

impl QrFactorization {
    /// An empty factorization (`rows = 0`, `cols = 0`); `rows` is adopted
    /// from the first inserted column.
    pub fn new(omega: f64, theta: f64, sigma: f64) -> Self {
        QrFactorization { q: DenseMatrix::zeros(0, 0), r: DenseMatrix::zeros(0, 0), rows: 0, cols: 0, omega, theta, sigma }
    }

    /// An empty factorization using the literature defaults.
    pub fn with_defaults() -> Self {
        QrFactorization::new(DEFAULT_OMEGA, DEFAULT_THETA, DEFAULT_SIGMA)
    }

    /// Rebuild a factorization directly from a checkpointed `Q`/`R` pair,
    /// bypassing `insert_column`. Used by `postprocessing.rs` to restore a
    /// `QrAcceleratedPostProcessing`'s internal QR across a checkpoint
    /// import without replaying every historical column insertion.
    pub fn from_parts(q: DenseMatrix, r: DenseMatrix, omega: f64, theta: f64, sigma: f64) -> Result<Self, CoreError> {
        invariant!(r.rows() == r.cols(), "from_parts: R must be square (got {}x{})", r.rows(), r.cols());
        invariant!(q.cols() == r.rows(), "from_parts: Q.cols ({}) must equal R.rows ({})", q.cols(), r.rows());
        let rows = q.rows();
        let cols = q.cols();
        Ok(QrFactorization { q, r, rows, cols, omega, theta, sigma })
    }

    /// Current row count (local rows, if `Q`'s columns are row-partitioned).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Current column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The current `Q` factor.
    pub fn q(&self) -> &DenseMatrix {
        &self.q
    }

    /// The current `R` factor.
    pub fn r(&self) -> &DenseMatrix {
        &self.r
    }

    /// Insert `v` (length `rows`, or adopted as the row count if this is the
    /// first column) at column index `k` (`0 <= k <= cols`), maintaining
    /// `A = Q * R`.
    ///
    /// `cohort` and `row_offset` are only exercised when `Q`'s columns are
    /// row-partitioned across more than one rank (`row_offset` is this
    /// rank's first global row index, used by the restart heuristic's
    /// cross-rank search); pass [`Cohort::solo`] and `0` in the local case.
    pub fn insert_column(&mut self, k: usize, v: DenseVector, cohort: &Cohort, row_offset: usize) -> Result<(), CoreError> {
        if self.cols == 0 {
            self.rows = v.len();
        }
        invariant!(k <= self.cols, "insert_column: k ({k}) out of range (cols={})", self.cols);
        invariant!(v.len() == self.rows, "insert_column: v.len() ({}) != rows ({})", v.len(), self.rows);

        self.r.insert_zero_column(self.cols);
        self.r = grow_square_with_zero_row(&self.r);
        self.cols += 1;

        for j in (k..self.cols - 1).rev() {
            for i in 0..=j {
                let value = self.r.get(i, j);
                self.r.set(i, j + 1, value);
            }
        }
        for j in k + 1..self.cols {
            self.r.set(j, j, 0.0);
        }

        let mut v = v;
        let mut u = DenseVector::zeros(self.cols);
        let mut rho1 = 0.0;
        self.orthogonalize(&mut v, &mut u, &mut rho1, self.cols - 1, cohort, row_offset)?;

        self.q.insert_zero_column(self.cols - 1);
        self.q.set_column(self.cols - 1, &v);

        for l in (k..self.cols - 1).rev() {
            let (grot, t) = compute_reflector(u.get(l), u.get(l + 1));
            u.set(l, t);
            u.set(l + 1, 0.0);

            let mut r1 = self.r.row(l);
            let mut r2 = self.r.row(l + 1);
            apply_reflector(grot, l + 1, self.cols, r1.as_mut_slice(), r2.as_mut_slice());
            self.r.set_row(l, &r1);
            self.r.set_row(l + 1, &r2);

            let mut q1 = self.q.column(l);
            let mut q2 = self.q.column(l + 1);
            apply_reflector(grot, 0, self.rows, q1.as_mut_slice(), q2.as_mut_slice());
            self.q.set_column(l, &q1);
            self.q.set_column(l + 1, &q2);
        }

        for i in 0..=k {
            self.r.set(i, k, u.get(i));
        }
        Ok(())
    }

    /// Delete column `k` (`0 <= k < cols`), restoring upper-triangular `R`
    /// with a chain of Givens reflectors before shrinking both factors.
    pub fn delete_column(&mut self, k: usize) -> Result<(), CoreError> {
        invariant!(k < self.cols, "delete_column: k ({k}) out of range (cols={})", self.cols);

        for l in k..self.cols - 1 {
            let (grot, t) = compute_reflector(self.r.get(l, l + 1), self.r.get(l + 1, l + 1));
            self.r.set(l, l + 1, t);
            self.r.set(l + 1, l + 1, 0.0);

            let mut r1 = self.r.row(l);
            let mut r2 = self.r.row(l + 1);
            apply_reflector(grot, l + 2, self.cols, r1.as_mut_slice(), r2.as_mut_slice());
            self.r.set_row(l, &r1);
            self.r.set_row(l + 1, &r2);

            let mut q1 = self.q.column(l);
            let mut q2 = self.q.column(l + 1);
            apply_reflector(grot, 0, self.rows, q1.as_mut_slice(), q2.as_mut_slice());
            self.q.set_column(l, &q1);
            self.q.set_column(l + 1, &q2);
        }

        for j in k..self.cols - 1 {
            for i in 0..=j {
                let value = self.r.get(i, j + 1);
                self.r.set(i, j, value);
            }
        }
        self.r = shrink_square(&self.r, self.cols - 1);
        self.q.remove_column(self.cols - 1);
        self.cols -= 1;
        Ok(())
    }

    /// `insert_column(0, v, ...)`.
    pub fn push_front(&mut self, v: DenseVector, cohort: &Cohort, row_offset: usize) -> Result<(), CoreError> {
        self.insert_column(0, v, cohort, row_offset)
    }

    /// `insert_column(cols, v, ...)`.
    pub fn push_back(&mut self, v: DenseVector, cohort: &Cohort, row_offset: usize) -> Result<(), CoreError> {
        self.insert_column(self.cols, v, cohort, row_offset)
    }

    /// `delete_column(0)`.
    pub fn pop_front(&mut self) -> Result<(), CoreError> {
        self.delete_column(0)
    }

    /// `delete_column(cols - 1)`.
    pub fn pop_back(&mut self) -> Result<(), CoreError> {
        self.delete_column(self.cols - 1)
    }

    /// Reset to empty, discarding `Q`/`R`.
    pub fn reset(&mut self) {
        self.q = DenseMatrix::zeros(0, 0);
        self.r = DenseMatrix::zeros(0, 0);
        self.rows = 0;
        self.cols = 0;
    }

    /// Iterated modified Gram-Schmidt: orthogonalize `v` (length `rows`)
    /// against columns `0..col_num` of `Q`, returning the Fourier
    /// coefficients in `r` (length `cols`, `r(col_num)` set to the residual
    /// norm) and the residual norm in `rho`. `v` is normalized in place.
    /// Returns the iteration count, or an error if refinement does not
    /// terminate within 4 iterations (a numerical breakdown).
    fn orthogonalize(
        &self,
        v: &mut DenseVector,
        r: &mut DenseVector,
        rho: &mut f64,
        col_num: usize,
        cohort: &Cohort,
        row_offset: usize,
    ) -> Result<i32, CoreError> {
        let mut restart = false;
        let mut null = false;
        *r = DenseVector::zeros(self.cols);

        *rho = cohort.l2norm(v.as_slice())?;
        let mut rho0 = *rho;
        let mut k = 0i32;
        loop {
            let mut s = DenseVector::zeros(col_num);
            let mut u = DenseVector::zeros(self.rows);
            for j in 0..col_num {
                let qj = self.q.column(j);
                let sj = cohort.dot(qj.as_slice(), v.as_slice())?;
                s.set(j, sj);
                u.axpy(sj, &qj);
            }
            if !null {
                for j in 0..col_num {
                    r.set(j, r.get(j) + s.get(j));
                }
            }
            v.sub_assign(&u);
            let rho1_local = cohort.l2norm(v.as_slice())?;
            // `s` is already a replicated global vector (each `s(j)` is a
            // cohort-wide dot product, identical on every rank), so its norm
            // is a plain local Euclidean norm, not a distributed `l2norm`
            // (which would sum it again across ranks).
            let t = s.as_slice().iter().map(|x| x * x).sum::<f64>().sqrt();
            k += 1;

            if self.rows == col_num {
                *v = DenseVector::zeros(self.rows);
                *rho = 0.0;
                return Ok(k);
            }

            let mut rho1 = rho1_local;
            if rho0 + self.omega * t >= self.theta * rho1 {
                if k >= 4 {
                    return Err(CoreError::numerical("orthogonalize: too many refinement iterations"));
                }
                if !restart && rho1 <= *rho * self.sigma {
                    restart = true;
                    let local_best = local_min_squared_row_norm(&self.q, col_num, row_offset);
                    let (_, winner) = cohort.reduce_arg_min(local_best)?;

                    if rho1 == 0.0 {
                        null = true;
                        rho1 = 1.0;
                    }
                    *v = DenseVector::zeros(self.rows);
                    if winner >= row_offset && winner - row_offset < self.rows {
                        v.set(winner - row_offset, rho1);
                    }
                    k = 0;
                }
                rho0 = rho1;
            } else {
                v.scale(1.0 / rho1);
                *rho = if null { 0.0 } else { rho1 };
                r.set(col_num, *rho);
                return Ok(k);
            }
        }
    }
}

/// Local contribution to the cross-rank "row of `Q` with minimal squared
/// length" search: `(min squared length, global row index)`, or `None` if
/// this rank owns no rows.
fn local_min_squared_row_norm(q: &DenseMatrix, col_num: usize, row_offset: usize) -> Option<(f64, usize)> {
    if q.rows() == 0 {
        return None;
    }
    let mut best = (f64::INFINITY, 0usize);
    for i in 0..q.rows() {
        let mut sum = 0.0;
        for j in 0..col_num {
            let x = q.get(i, j);
            sum += x * x;
        }
        if sum < best.0 {
            best = (sum, row_offset + i);
        }
    }
    Some(best)
}

fn grow_square_with_zero_row(m: &DenseMatrix) -> DenseMatrix {
    // `m` already has its new zero column appended by `insert_zero_column`;
    // this appends the matching zero row so the matrix is square again.
    let cols = m.cols();
    let mut out = DenseMatrix::zeros(cols, cols);
    for j in 0..cols {
        for i in 0..cols - 1 {
            out.set(i, j, m.get(i, j));
        }
    }
    out
}

fn shrink_square(m: &DenseMatrix, new_size: usize) -> DenseMatrix {
    let mut out = DenseMatrix::zeros(new_size, new_size);
    for j in 0..new_size {
        for i in 0..new_size {
            out.set(i, j, m.get(i, j));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo() -> Cohort {
        Cohort::solo()
    }

    #[test]
    fn single_column_insert_matches_worked_example() {
        let mut qr = QrFactorization::with_defaults();
        qr.insert_column(0, DenseVector::from_vec(vec![3.0, 4.0]), &solo(), 0).unwrap();
        assert_eq!(qr.cols(), 1);
        assert_eq!(qr.rows(), 2);
        assert!((qr.q().get(0, 0) - 0.6).abs() < 1e-12);
        assert!((qr.q().get(1, 0) - 0.8).abs() < 1e-12);
        assert!((qr.r().get(0, 0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn insert_then_delete_round_trips_to_a_fresh_qr() {
        let mut qr = QrFactorization::with_defaults();
        let v = DenseVector::from_vec(vec![1.0 / std::f64::consts::SQRT_2, 1.0 / std::f64::consts::SQRT_2]);
        qr.insert_column(0, v, &solo(), 0).unwrap();
        qr.delete_column(0).unwrap();
        assert_eq!(qr.cols(), 0);

        let mut fresh = QrFactorization::with_defaults();
        fresh.insert_column(0, DenseVector::from_vec(vec![0.0, 1.0]), &solo(), 0).unwrap();
        assert_eq!(fresh.cols(), 1);
        assert!((fresh.r().get(0, 0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn two_columns_reconstruct_the_original_matrix() {
        let mut qr = QrFactorization::with_defaults();
        qr.insert_column(0, DenseVector::from_vec(vec![1.0, 0.0, 0.0]), &solo(), 0).unwrap();
        qr.insert_column(1, DenseVector::from_vec(vec![1.0, 1.0, 0.0]), &solo(), 0).unwrap();

        let qr_product = qr.q().matmul(qr.r());
        // original columns were (1,0,0) and (1,1,0)
        assert!((qr_product.get(0, 0) - 1.0).abs() < 1e-9);
        assert!((qr_product.get(1, 0) - 0.0).abs() < 1e-9);
        assert!((qr_product.get(0, 1) - 1.0).abs() < 1e-9);
        assert!((qr_product.get(1, 1) - 1.0).abs() < 1e-9);

        // Q has orthonormal columns: Q^T Q == I.
        for a in 0..2 {
            for b in 0..2 {
                let dot = qr.q().column(a).dot_local(&qr.q().column(b));
                let expected = if a == b { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn insert_in_middle_keeps_r_upper_triangular() {
        let mut qr = QrFactorization::with_defaults();
        qr.insert_column(0, DenseVector::from_vec(vec![1.0, 0.0, 0.0]), &solo(), 0).unwrap();
        qr.insert_column(1, DenseVector::from_vec(vec![0.0, 0.0, 1.0]), &solo(), 0).unwrap();
        qr.insert_column(1, DenseVector::from_vec(vec![0.0, 1.0, 0.0]), &solo(), 0).unwrap();
        for j in 0..qr.cols() {
            for i in (j + 1)..qr.cols() {
                assert!(qr.r().get(i, j).abs() < 1e-9, "R not upper triangular at ({i},{j})");
            }
        }
    }

    #[test]
    fn compute_reflector_special_case_y_zero() {
        let (grot, t) = compute_reflector(3.0, 0.0);
        assert_eq!(grot.gamma, 1.0);
        assert_eq!(grot.sigma, 0.0);
        assert_eq!(t, 3.0);
    }

    #[test]
    fn insert_column_adopts_row_count_from_first_column() {
        let mut qr = QrFactorization::with_defaults();
        assert_eq!(qr.rows(), 0);
        qr.insert_column(0, DenseVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]), &solo(), 0).unwrap();
        assert_eq!(qr.rows(), 4);
    }

    #[test]
    fn from_parts_rejects_non_square_r() {
        let q = DenseMatrix::zeros(3, 2);
        let r = DenseMatrix::zeros(2, 3);
        assert!(QrFactorization::from_parts(q, r, DEFAULT_OMEGA, DEFAULT_THETA, DEFAULT_SIGMA).is_err());
    }

    #[test]
    fn from_parts_round_trips_a_fresh_qr() {
        let mut qr = QrFactorization::with_defaults();
        qr.insert_column(0, DenseVector::from_vec(vec![3.0, 4.0]), &solo(), 0).unwrap();
        let rebuilt = QrFactorization::from_parts(qr.q().clone(), qr.r().clone(), DEFAULT_OMEGA, DEFAULT_THETA, DEFAULT_SIGMA).unwrap();
        assert_eq!(rebuilt.rows(), qr.rows());
        assert_eq!(rebuilt.cols(), qr.cols());
        assert_eq!(rebuilt.q(), qr.q());
    }

    #[test]
    fn random_insertions_keep_q_orthonormal_and_r_upper_triangular() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::from_seed([7u8; 32]);
        let rows = 6;
        let mut qr = QrFactorization::with_defaults();
        for k in 0..4 {
            let v: Vec<f64> = (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect();
            qr.insert_column(k, DenseVector::from_vec(v), &solo(), 0).unwrap();

            for j in 0..qr.cols() {
                for i in (j + 1)..qr.cols() {
                    assert!(qr.r().get(i, j).abs() < 1e-8, "R not upper triangular at ({i},{j})");
                }
            }
            for a in 0..qr.cols() {
                for b in 0..qr.cols() {
                    let dot = qr.q().column(a).dot_local(&qr.q().column(b));
                    let expected = if a == b { 1.0 } else { 0.0 };
                    assert!((dot - expected).abs() < 1e-6, "Q^T Q off at ({a},{b}): {dot}");
                }
            }
        }
    }

    #[test]
    fn inserting_a_dependent_column_triggers_restart_without_crashing() {
        // insert e1 and e2, then insert a near-duplicate of e1 (tiny
        // perturbation) -- the restart heuristic must kick in rather than fail.
        let mut qr = QrFactorization::with_defaults();
        qr.insert_column(0, DenseVector::from_vec(vec![1.0, 0.0]), &solo(), 0).unwrap();
        let result = qr.insert_column(1, DenseVector::from_vec(vec![1.0, 0.0]), &solo(), 0);
        assert!(result.is_ok());
        assert_eq!(qr.cols(), 2);
    }

    #[test]
    fn distributed_insert_matches_the_solo_factorization() {
        use crate::comm::ChannelCommunicator;
        use std::sync::Arc;
        use std::thread;

        // Global 4-row, 2-column matrix, split two rows per rank.
        let col0 = vec![1.0, 0.0, 0.0, 0.0];
        let col1 = vec![1.0, 1.0, 0.0, 0.0];

        let mut expected = QrFactorization::with_defaults();
        expected.insert_column(0, DenseVector::from_vec(col0.clone()), &solo(), 0).unwrap();
        expected.insert_column(1, DenseVector::from_vec(col1.clone()), &solo(), 0).unwrap();

        let (master_link, slave_link) = ChannelCommunicator::pair(0, 1);
        let master_cohort = Cohort::master(2, vec![Arc::new(master_link)]).unwrap();
        let slave_cohort = Cohort::slave(1, 2, 0, Arc::new(slave_link)).unwrap();

        let (col0_slave, col1_slave) = (vec![col0[2], col0[3]], vec![col1[2], col1[3]]);
        let slave_thread = thread::spawn(move || {
            let mut qr = QrFactorization::with_defaults();
            qr.insert_column(0, DenseVector::from_vec(col0_slave), &slave_cohort, 2).unwrap();
            qr.insert_column(1, DenseVector::from_vec(col1_slave), &slave_cohort, 2).unwrap();
            qr
        });

        let mut master_qr = QrFactorization::with_defaults();
        master_qr.insert_column(0, DenseVector::from_vec(vec![col0[0], col0[1]]), &master_cohort, 0).unwrap();
        master_qr.insert_column(1, DenseVector::from_vec(vec![col1[0], col1[1]]), &master_cohort, 0).unwrap();

        let slave_qr = slave_thread.join().unwrap();

        // R is replicated: both ranks compute it from the same global inner
        // products, so it must match the solo R exactly.
        for i in 0..2 {
            for j in 0..2 {
                assert!((master_qr.r().get(i, j) - expected.r().get(i, j)).abs() < 1e-9);
                assert!((slave_qr.r().get(i, j) - expected.r().get(i, j)).abs() < 1e-9);
            }
        }

        // Q is row-partitioned: each rank's local rows must match the
        // corresponding rows of the solo Q.
        for i in 0..2 {
            for j in 0..2 {
                assert!((master_qr.q().get(i, j) - expected.q().get(i, j)).abs() < 1e-9);
                assert!((slave_qr.q().get(i, j) - expected.q().get(2 + i, j)).abs() < 1e-9);
            }
        }
    }
}
