//! Distributed dense matrix/vector products (C3)
//!
//! Three computation strategies, selected by result shape: a square result
//! with `p == r` uses a cyclic block
//! communication ([`multiply_nn`]); a rectangular result is computed either
//! by a per-entry distributed dot product ([`multiply_nm_dot_product`],
//! low storage, high communication setup cost) or by a local block product
//! reduced and redistributed from the master ([`multiply_nm_block`], higher
//! local storage, lower setup cost). [`multiply`] is the dispatcher the rest
//! of the crate is expected to call; the three kernels are exposed directly
//! for testing and for callers that already know which strategy they want.

#![forbid(unsafe_code)]

use crate::cohort::Cohort;
use crate::comm::Communicator;
use crate::error::{invariant, CoreError};
use crate::linalg::{DenseMatrix, DenseVector, Offsets};

/// The pair of fixed-peer links a rank uses for the cyclic kernel of
/// [`multiply_nn`]: `cyclic_left` only ever receives (from the rank's left
/// neighbor), `cyclic_right` only ever sends (to the rank's right
/// neighbor). Built with [`crate::comm::ChannelCommunicator::ring`].
pub struct RingLinks<'a> {
    /// Receives from this rank's left neighbor.
    pub cyclic_left: &'a dyn Communicator,
    /// Sends to this rank's right neighbor.
    pub cyclic_right: &'a dyn Communicator,
}

/// Strategy selection for the rectangular (`p != r`) case of [`multiply`].
#[derive(Debug, Clone, Copy)]
pub struct MultiplyOptions {
    dot_product_computation: bool,
}

impl Default for MultiplyOptions {
    fn default() -> Self {
        MultiplyOptions { dot_product_computation: true }
    }
}

impl MultiplyOptions {
    /// Start from the default (dot-product computation).
    pub fn new() -> Self {
        MultiplyOptions::default()
    }

    /// Select the block-wise (reduce + redistribute) strategy instead of the
    /// default per-entry distributed dot product.
    pub fn dot_product_computation(mut self, enabled: bool) -> Self {
        self.dot_product_computation = enabled;
        self
    }
}

/// Multiply `left` (`p x q` local, row-distributed per `offsets`) by `right`
/// (`q x r` local) into a `p x r` result, choosing a strategy from the shape
/// of the problem.
///
/// On a cohort of size 1 this is a plain local [`DenseMatrix::matmul`]. On a
/// cohort of size > 1:
/// - `p == r` (a square result, e.g. `W~^T Z`): cyclic block communication
///   via `ring`, which must be `Some` in this case.
/// - otherwise: distributed dot product, or block reduce+redistribute if
///   `options.dot_product_computation()` is `false`.
pub fn multiply(
    cohort: &Cohort,
    ring: Option<&RingLinks>,
    left: &DenseMatrix,
    right: &DenseMatrix,
    offsets: &Offsets,
    p: usize,
    q: usize,
    r: usize,
    options: MultiplyOptions,
) -> Result<DenseMatrix, CoreError> {
    invariant!(left.cols() == right.rows(), "multiply: inner dims mismatch ({} vs {})", left.cols(), right.rows());

    if cohort.size() == 1 {
        return Ok(left.matmul(right));
    }

    if p == r {
        let ring = ring.ok_or_else(|| CoreError::invariant("multiply: square result needs ring links"))?;
        multiply_nn(cohort, ring, left, right, offsets, p, q, r)
    } else if options.dot_product_computation {
        multiply_nm_dot_product(cohort, left, right, offsets, p, r)
    } else {
        multiply_nm_block(cohort, left, right, offsets, p, r)
    }
}

fn cycle_source(rank: usize, cycle: usize, size: usize) -> usize {
    let r = rank as isize - cycle as isize;
    (((r % size as isize) + size as isize) % size as isize) as usize
}

fn copy_block(dst: &mut DenseMatrix, row_off: usize, col_off: usize, block: &DenseMatrix) {
    for j in 0..block.cols() {
        for i in 0..block.rows() {
            dst.set(row_off + i, col_off + j, block.get(i, j));
        }
    }
}

/// Cyclic block computation for a square result (`p == r == offsets.p_global()`).
///
/// `left` is this rank's local `(n_local x q)` slice, `right` is this rank's
/// local `(q x n_local)` slice; every rank ends up holding the complete
/// `(p x r)` result, assembled one ring-hop block at a time.
pub fn multiply_nn(
    cohort: &Cohort,
    ring: &RingLinks,
    left: &DenseMatrix,
    right: &DenseMatrix,
    offsets: &Offsets,
    p: usize,
    q: usize,
    r: usize,
) -> Result<DenseMatrix, CoreError> {
    invariant!(left.cols() == q, "multiply_nn: left.cols() ({}) != q ({})", left.cols(), q);
    invariant!(left.rows() == right.cols(), "multiply_nn: left.rows() ({}) != right.cols() ({})", left.rows(), right.cols());
    invariant!(offsets.p_global() == p, "multiply_nn: offsets span {} rows, expected p={}", offsets.p_global(), p);
    invariant!(r == p, "multiply_nn: r ({}) must equal p ({})", r, p);

    let rank = cohort.rank();
    let size = cohort.size();
    let mut result = DenseMatrix::zeros(p, r);

    let prev_proc = if rank == 0 { size - 1 } else { rank - 1 };
    let mut rows_rcv = offsets.local_rows(prev_proc);
    let mut left_rcv = DenseMatrix::zeros(rows_rcv, q);

    let mut send_req = if !left.as_slice().is_empty() { Some(ring.cyclic_right.a_send_f64(left.as_slice().to_vec())) } else { None };
    let mut recv_req = if !left_rcv.as_slice().is_empty() {
        Some(ring.cyclic_left.a_receive_f64(left_rcv.as_slice().len()))
    } else {
        None
    };

    // diagonal block: computed entirely locally, no communication needed.
    let diag_block = left.matmul(right);
    let off = offsets.offset(rank);
    copy_block(&mut result, off, 0, &diag_block);

    for cycle in 1..size {
        if let Some(req) = send_req.take() {
            req.wait()?;
        }
        if let Some(req) = recv_req.take() {
            let data = req.wait()?;
            left_rcv = DenseMatrix::from_col_major(rows_rcv, q, data);
        }

        let source_proc = cycle_source(rank, cycle, size);
        let left_copy = left_rcv.clone();

        if cycle < size - 1 {
            if !left_copy.as_slice().is_empty() {
                send_req = Some(ring.cyclic_right.a_send_f64(left_copy.as_slice().to_vec()));
            }
            let source_proc_next_cycle = cycle_source(rank, cycle + 1, size);
            rows_rcv = offsets.local_rows(source_proc_next_cycle);
            left_rcv = DenseMatrix::zeros(rows_rcv, q);
            if !left_rcv.as_slice().is_empty() {
                recv_req = Some(ring.cyclic_left.a_receive_f64(left_rcv.as_slice().len()));
            }
        }

        let block = left_copy.matmul(right);
        let off = offsets.offset(source_proc);
        copy_block(&mut result, off, 0, &block);
    }

    Ok(result)
}

/// Per-entry distributed dot product for a rectangular result.
///
/// `left` is `(p x q_local)` and `right` is `(q_local x r)`, both replicated
/// across ranks along `p`/`r` but holding only this rank's slice of the
/// (distributed) inner dimension `q`; `offsets` assigns ownership of each
/// output row to exactly one rank. Every rank participates in every
/// [`Cohort::dot`] call regardless of ownership, since the inner dimension
/// is split across all of them.
pub fn multiply_nm_dot_product(
    cohort: &Cohort,
    left: &DenseMatrix,
    right: &DenseMatrix,
    offsets: &Offsets,
    p: usize,
    r: usize,
) -> Result<DenseMatrix, CoreError> {
    invariant!(left.rows() == p, "multiply_nm_dot_product: left.rows() ({}) != p ({})", left.rows(), p);
    invariant!(right.cols() == r, "multiply_nm_dot_product: right.cols() ({}) != r ({})", right.cols(), r);

    let rank = cohort.rank();
    let local_rows = offsets.local_rows(rank);
    let mut result = DenseMatrix::zeros(local_rows, r);

    for i in 0..left.rows() {
        let owner = offsets.owner_of(i);
        let row_i = left.row(i);
        for j in 0..r {
            let col_j = right.column(j);
            let value = cohort.dot(row_i.as_slice(), col_j.as_slice())?;
            if owner == rank {
                result.set(i - offsets.offset(rank), j, value);
            }
        }
    }
    Ok(result)
}

/// Block-wise (SAXPY-style) computation for a rectangular result: every rank
/// computes its local contribution to the *full* `(p x r)` product, the
/// master reduces them, and redistributes the row-slice each rank owns.
///
/// Lower communication setup cost than [`multiply_nm_dot_product`] at the
/// price of every rank momentarily materializing a full `p x r` block.
pub fn multiply_nm_block(
    cohort: &Cohort,
    left: &DenseMatrix,
    right: &DenseMatrix,
    offsets: &Offsets,
    p: usize,
    r: usize,
) -> Result<DenseMatrix, CoreError> {
    invariant!(left.rows() == p, "multiply_nm_block: left.rows() ({}) != p ({})", left.rows(), p);
    invariant!(right.cols() == r, "multiply_nm_block: right.cols() ({}) != r ({})", right.cols(), r);

    let block = left.matmul(right);
    let summed = cohort.reduce_sum_vec(block.as_slice())?;
    let local_rows = offsets.local_rows(cohort.rank());
    let mut result = DenseMatrix::zeros(local_rows, r);

    if cohort.is_master() {
        let summed = DenseMatrix::from_col_major(p, r, summed);

        let my_off = offsets.offset(cohort.master_rank());
        copy_block(&mut result, 0, 0, &slice_rows(&summed, my_off, local_rows));

        for slave_index in 0..cohort.num_slaves() {
            let slave_rank = cohort.slave_rank(slave_index);
            let off = offsets.offset(slave_rank);
            let rows = offsets.local_rows(slave_rank);
            if rows == 0 {
                continue;
            }
            let send_block = slice_rows(&summed, off, rows);
            cohort.send_f64_slice_to_slave(slave_index, send_block.as_slice())?;
        }
    } else if !result.as_slice().is_empty() {
        let mut buf = vec![0.0; local_rows * r];
        cohort.receive_f64_slice_from_master(&mut buf)?;
        result = DenseMatrix::from_col_major(local_rows, r, buf);
    }

    Ok(result)
}

fn slice_rows(m: &DenseMatrix, row_off: usize, rows: usize) -> DenseMatrix {
    let mut out = DenseMatrix::zeros(rows, m.cols());
    for j in 0..m.cols() {
        for i in 0..rows {
            out.set(i, j, m.get(row_off + i, j));
        }
    }
    out
}

/// Distributed matrix-vector product, always via per-entry distributed dot
/// product (there is only one strategy for the vector case).
pub fn matvec(cohort: &Cohort, a: &DenseMatrix, v: &DenseVector, offsets: &Offsets, p: usize) -> Result<DenseVector, CoreError> {
    invariant!(a.cols() == v.len(), "matvec: a.cols() ({}) != v.len() ({})", a.cols(), v.len());

    if cohort.size() == 1 {
        return Ok(a.matvec(v));
    }

    invariant!(a.rows() == p, "matvec: a.rows() ({}) != p ({})", a.rows(), p);
    let rank = cohort.rank();
    let local_rows = offsets.local_rows(rank);
    let mut result = DenseVector::zeros(local_rows);

    for i in 0..a.rows() {
        let owner = offsets.owner_of(i);
        let row_i = a.row(i);
        let value = cohort.dot(row_i.as_slice(), v.as_slice())?;
        if owner == rank {
            result.set(i - offsets.offset(rank), value);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelCommunicator;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn solo_cohort_multiply_is_plain_matmul() {
        let cohort = Cohort::solo();
        let a = DenseMatrix::from_col_major(2, 2, vec![1.0, 3.0, 2.0, 4.0]);
        let b = DenseMatrix::from_col_major(2, 2, vec![5.0, 7.0, 6.0, 8.0]);
        let offsets = Offsets::even(2, 1);
        let result = multiply(&cohort, None, &a, &b, &offsets, 2, 2, 2, MultiplyOptions::new()).unwrap();
        assert_eq!(result.get(0, 0), 19.0);
        assert_eq!(result.get(1, 1), 50.0);
    }

    #[test]
    fn solo_cohort_matvec_is_plain_matvec() {
        let cohort = Cohort::solo();
        let a = DenseMatrix::from_col_major(2, 2, vec![1.0, 0.0, 0.0, 1.0]);
        let v = DenseVector::from_vec(vec![3.0, 4.0]);
        let offsets = Offsets::even(2, 1);
        let result = matvec(&cohort, &a, &v, &offsets, 2).unwrap();
        assert_eq!(result.as_slice(), &[3.0, 4.0]);
    }

    #[test]
    fn distributed_dot_product_multiply_assigns_rows_to_owners() {
        // Global left is (2 x 2), split by inner dimension across two ranks
        // (one column each); global right is (2 x 2) split by rows to match.
        // offsets assigns output row 0 to rank 0 and row 1 to rank 1.
        let (master_link, slave_link) = ChannelCommunicator::pair(0, 1);
        let master_cohort = Cohort::master(2, vec![Arc::new(master_link)]).unwrap();
        let slave_cohort = Cohort::slave(1, 2, 0, Arc::new(slave_link)).unwrap();
        let offsets = Offsets::even(2, 2);

        // identity matrix, column 0 local to rank 0, column 1 local to rank 1.
        let left_master = DenseMatrix::from_col_major(2, 1, vec![1.0, 0.0]);
        let left_slave = DenseMatrix::from_col_major(2, 1, vec![0.0, 1.0]);
        let right_master = DenseMatrix::from_col_major(1, 2, vec![1.0, 0.0]);
        let right_slave = DenseMatrix::from_col_major(1, 2, vec![0.0, 1.0]);
        let offsets_slave = offsets.clone();

        let slave_thread = thread::spawn(move || {
            multiply_nm_dot_product(&slave_cohort, &left_slave, &right_slave, &offsets_slave, 2, 2).unwrap()
        });
        let master_result = multiply_nm_dot_product(&master_cohort, &left_master, &right_master, &offsets, 2, 2).unwrap();
        let slave_result = slave_thread.join().unwrap();

        // reconstructed identity: master owns row 0 -> [1, 0], slave owns row 1 -> [0, 1]
        assert_eq!(master_result.as_slice(), &[1.0, 0.0]);
        assert_eq!(slave_result.as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn distributed_block_multiply_reduces_and_redistributes() {
        let (master_link, slave_link) = ChannelCommunicator::pair(0, 1);
        let master_cohort = Cohort::master(2, vec![Arc::new(master_link)]).unwrap();
        let slave_cohort = Cohort::slave(1, 2, 0, Arc::new(slave_link)).unwrap();
        let offsets = Offsets::even(2, 2);

        // each rank contributes a local (2x2) block that sums to 2*I.
        let left_master = DenseMatrix::from_col_major(2, 1, vec![1.0, 0.0]);
        let left_slave = left_master.clone();
        let right_master = DenseMatrix::from_col_major(1, 2, vec![1.0, 0.0]);
        let right_slave = right_master.clone();
        let offsets_slave = offsets.clone();

        let slave_thread =
            thread::spawn(move || multiply_nm_block(&slave_cohort, &left_slave, &right_slave, &offsets_slave, 2, 2).unwrap());
        let master_result = multiply_nm_block(&master_cohort, &left_master, &right_master, &offsets, 2, 2).unwrap();
        let slave_result = slave_thread.join().unwrap();

        assert_eq!(master_result.as_slice(), &[2.0, 0.0]);
        assert_eq!(slave_result.as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn random_block_multiply_matches_a_single_rank_reference() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::from_seed([11u8; 32]);
        let (p, q, r) = (4usize, 3usize, 5usize);
        let left_full = DenseMatrix::from_col_major(p, q, (0..p * q).map(|_| rng.gen_range(-2.0..2.0)).collect());
        let right_full = DenseMatrix::from_col_major(q, r, (0..q * r).map(|_| rng.gen_range(-2.0..2.0)).collect());
        let expected = left_full.matmul(&right_full);

        let offsets = Offsets::even(p, 2);
        let (master_link, slave_link) = ChannelCommunicator::pair(0, 1);
        let master_cohort = Cohort::master(2, vec![Arc::new(master_link)]).unwrap();
        let slave_cohort = Cohort::slave(1, 2, 0, Arc::new(slave_link)).unwrap();

        let master_rows = offsets.local_rows(0);
        let left_master = slice_rows(&left_full, 0, master_rows);
        let left_slave = slice_rows(&left_full, master_rows, p - master_rows);
        let right_master = right_full.clone();
        let right_slave = right_full.clone();
        let offsets_slave = offsets.clone();

        let slave_thread =
            thread::spawn(move || multiply_nm_block(&slave_cohort, &left_slave, &right_slave, &offsets_slave, p, r).unwrap());
        let master_result = multiply_nm_block(&master_cohort, &left_master, &right_master, &offsets, p, r).unwrap();
        let slave_result = slave_thread.join().unwrap();

        for i in 0..master_rows {
            for j in 0..r {
                assert!((master_result.get(i, j) - expected.get(i, j)).abs() < 1e-9);
            }
        }
        for i in 0..(p - master_rows) {
            for j in 0..r {
                assert!((slave_result.get(i, j) - expected.get(master_rows + i, j)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn distributed_cyclic_nn_assembles_the_full_result_on_every_rank() {
        // Two local (1x1) blocks, one per rank: left_i = right_i = [v_i].
        // multiply_nn assembles the full (2x2) result where entry (i, i) is
        // the local diagonal product and entry (i, j) for i != j is the
        // cross product exchanged over the ring.
        let ring_links = ChannelCommunicator::ring(2);
        let mut ring_links = ring_links.into_iter();
        let (left0, right0) = ring_links.next().unwrap();
        let (left1, right1) = ring_links.next().unwrap();

        // Cohort membership links (unused by multiply_nn itself, which only
        // reads rank/size, but required to build a valid two-rank Cohort).
        let (master_membership, slave_membership) = ChannelCommunicator::pair(0, 1);

        let offsets = Offsets::even(2, 2);
        let offsets1 = offsets.clone();

        let rank1 = thread::spawn(move || {
            let cohort = Cohort::slave(1, 2, 0, Arc::new(slave_membership)).unwrap();
            let ring = RingLinks { cyclic_left: &left1, cyclic_right: &right1 };
            let left = DenseMatrix::from_col_major(1, 1, vec![4.0]);
            let right = DenseMatrix::from_col_major(1, 1, vec![4.0]);
            multiply_nn(&cohort, &ring, &left, &right, &offsets1, 2, 1, 2).unwrap()
        });

        let cohort = Cohort::master(2, vec![Arc::new(master_membership)]).unwrap();
        let ring = RingLinks { cyclic_left: &left0, cyclic_right: &right0 };
        let left = DenseMatrix::from_col_major(1, 1, vec![3.0]);
        let right = DenseMatrix::from_col_major(1, 1, vec![3.0]);
        let rank0_result = multiply_nn(&cohort, &ring, &left, &right, &offsets, 2, 1, 2).unwrap();
        let rank1_result = rank1.join().unwrap();

        assert_eq!(rank0_result.get(0, 0), 9.0);
        assert_eq!(rank0_result.get(1, 1), 16.0);
        assert_eq!(rank0_result.get(0, 1), 12.0);
        assert_eq!(rank0_result.get(1, 0), 12.0);
        assert_eq!(rank0_result, rank1_result);
    }
}
