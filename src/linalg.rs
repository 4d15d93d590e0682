//! Dense `f64` matrix/vector primitives and the row-partition descriptor
//!
//! Rather than pull in an external linear-algebra crate, this module
//! hand-rolls a column-major flat-buffer convention directly over
//! `Vec<f64>`, indexed `(i, j)`.
//!
//! Only the operations the rest of the crate actually needs are provided:
//! indexed access, row/column views, resize-in-place (growing/shrinking by
//! one row or column at a time, mirroring `insertColumn`/`deleteColumn`),
//! and a handful of arithmetic helpers.

#![forbid(unsafe_code)]

use crate::error::CoreError;

/// A dense, column-major `f64` matrix.
///
/// Element `(i, j)` (row `i`, column `j`) lives at `data[j * rows + i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl DenseMatrix {
    /// A `rows x cols` matrix filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        DenseMatrix { rows, cols, data: vec![0.0; rows * cols] }
    }

    /// Build a matrix from column-major data, checking the length matches.
    pub fn from_col_major(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols, "data length must equal rows*cols");
        DenseMatrix { rows, cols, data }
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.rows && j < self.cols, "index ({i},{j}) out of bounds ({}x{})", self.rows, self.cols);
        j * self.rows + i
    }

    /// Read element `(i, j)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[self.index(i, j)]
    }

    /// Write element `(i, j)`.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        let idx = self.index(i, j);
        self.data[idx] = value;
    }

    /// Column `j` as an owned vector.
    pub fn column(&self, j: usize) -> DenseVector {
        let start = j * self.rows;
        DenseVector::from_vec(self.data[start..start + self.rows].to_vec())
    }

    /// Overwrite column `j` with `v`.
    pub fn set_column(&mut self, j: usize, v: &DenseVector) {
        assert_eq!(v.len(), self.rows, "column length mismatch");
        let start = j * self.rows;
        self.data[start..start + self.rows].copy_from_slice(v.as_slice());
    }

    /// Row `i` as an owned vector (not contiguous in column-major storage).
    pub fn row(&self, i: usize) -> DenseVector {
        let mut out = vec![0.0; self.cols];
        for j in 0..self.cols {
            out[j] = self.get(i, j);
        }
        DenseVector::from_vec(out)
    }

    /// Overwrite row `i` with `v`.
    pub fn set_row(&mut self, i: usize, v: &DenseVector) {
        assert_eq!(v.len(), self.cols, "row length mismatch");
        for j in 0..self.cols {
            self.set(i, j, v.get(j));
        }
    }

    /// Raw column-major backing slice.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Raw column-major backing mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Insert a zero column at index `j`, shifting later columns right.
    pub fn insert_zero_column(&mut self, j: usize) {
        assert!(j <= self.cols);
        let start = j * self.rows;
        let zeros = vec![0.0; self.rows];
        self.data.splice(start..start, zeros);
        self.cols += 1;
    }

    /// Remove column `j`, shifting later columns left.
    pub fn remove_column(&mut self, j: usize) {
        assert!(j < self.cols);
        let start = j * self.rows;
        self.data.drain(start..start + self.rows);
        self.cols -= 1;
    }

    /// Plain dense matrix product `self * rhs`.
    pub fn matmul(&self, rhs: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.cols, rhs.rows, "inner dimensions must match");
        let mut out = DenseMatrix::zeros(self.rows, rhs.cols);
        for j in 0..rhs.cols {
            for k in 0..self.cols {
                let r = rhs.get(k, j);
                if r == 0.0 {
                    continue;
                }
                for i in 0..self.rows {
                    let v = out.get(i, j) + self.get(i, k) * r;
                    out.set(i, j, v);
                }
            }
        }
        out
    }

    /// Plain dense matrix-vector product `self * v`.
    pub fn matvec(&self, v: &DenseVector) -> DenseVector {
        assert_eq!(self.cols, v.len(), "inner dimension must match");
        let mut out = vec![0.0; self.rows];
        for j in 0..self.cols {
            let vj = v.get(j);
            if vj == 0.0 {
                continue;
            }
            for i in 0..self.rows {
                out[i] += self.get(i, j) * vj;
            }
        }
        DenseVector::from_vec(out)
    }

    /// Frobenius norm.
    pub fn frobenius_norm(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum::<f64>().sqrt()
    }
}

/// A dense `f64` vector.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct DenseVector {
    data: Vec<f64>,
}

impl DenseVector {
    /// A zero vector of length `n`.
    pub fn zeros(n: usize) -> Self {
        DenseVector { data: vec![0.0; n] }
    }

    /// Build from a plain `Vec<f64>`.
    pub fn from_vec(data: Vec<f64>) -> Self {
        DenseVector { data }
    }

    /// The standard basis vector `e_k` of length `n`.
    pub fn unit(n: usize, k: usize) -> Self {
        let mut v = vec![0.0; n];
        v[k] = 1.0;
        DenseVector { data: v }
    }

    /// Length of the vector.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the vector has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element `i`.
    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        self.data[i]
    }

    /// Set element `i`.
    #[inline]
    pub fn set(&mut self, i: usize, value: f64) {
        self.data[i] = value;
    }

    /// Raw backing slice.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Raw mutable backing slice.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Local (non-distributed) Euclidean inner product.
    pub fn dot_local(&self, other: &DenseVector) -> f64 {
        assert_eq!(self.len(), other.len());
        self.data.iter().zip(other.as_slice()).map(|(a, b)| a * b).sum()
    }

    /// Local (non-distributed) Euclidean norm.
    pub fn norm_local(&self) -> f64 {
        self.dot_local(self).sqrt()
    }

    /// `self += scale * other`.
    pub fn axpy(&mut self, scale: f64, other: &DenseVector) {
        assert_eq!(self.len(), other.len());
        for (a, b) in self.data.iter_mut().zip(other.as_slice()) {
            *a += scale * b;
        }
    }

    /// `self *= scale`.
    pub fn scale(&mut self, scale: f64) {
        for a in self.data.iter_mut() {
            *a *= scale;
        }
    }

    /// `self -= other`.
    pub fn sub_assign(&mut self, other: &DenseVector) {
        assert_eq!(self.len(), other.len());
        for (a, b) in self.data.iter_mut().zip(other.as_slice()) {
            *a -= b;
        }
    }
}

/// Monotonically non-decreasing row-partition descriptor of length
/// `size + 1`, with `offsets[size] == p_global`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offsets {
    values: Vec<usize>,
}

impl Offsets {
    /// Validate and wrap a raw offsets array.
    pub fn new(values: Vec<usize>) -> Result<Self, CoreError> {
        if values.len() < 2 {
            return Err(CoreError::invariant("offsets must have length >= 2 (size+1)"));
        }
        if values[0] != 0 {
            return Err(CoreError::invariant("offsets[0] must be 0"));
        }
        if values.windows(2).any(|w| w[1] < w[0]) {
            return Err(CoreError::invariant("offsets must be monotonically non-decreasing"));
        }
        Ok(Offsets { values })
    }

    /// Build a contiguous, evenly sized partition of `p_global` rows across
    /// `size` ranks (remainder distributed to the first ranks).
    pub fn even(p_global: usize, size: usize) -> Self {
        let base = p_global / size;
        let rem = p_global % size;
        let mut values = Vec::with_capacity(size + 1);
        values.push(0);
        let mut acc = 0;
        for rank in 0..size {
            acc += base + usize::from(rank < rem);
            values.push(acc);
        }
        Offsets { values }
    }

    /// Number of ranks this partition spans.
    pub fn size(&self) -> usize {
        self.values.len() - 1
    }

    /// Total (global) row count, `offsets[size]`.
    pub fn p_global(&self) -> usize {
        self.values[self.values.len() - 1]
    }

    /// Number of local rows owned by `rank`.
    pub fn local_rows(&self, rank: usize) -> usize {
        self.values[rank + 1] - self.values[rank]
    }

    /// Global row offset of `rank`'s first local row.
    pub fn offset(&self, rank: usize) -> usize {
        self.values[rank]
    }

    /// Raw offsets slice (length `size + 1`).
    pub fn as_slice(&self) -> &[usize] {
        &self.values
    }

    /// The smallest rank `k` such that global row `i` is owned by `k`,
    /// tolerating empty ranks (a linear scan: `while i >= offsets[rank+1] { rank += 1 }`).
    pub fn owner_of(&self, i: usize) -> usize {
        let mut rank = 0;
        while i >= self.values[rank + 1] {
            rank += 1;
        }
        rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_major_indexing_matches_row_col() {
        let mut m = DenseMatrix::zeros(2, 3);
        m.set(0, 0, 1.0);
        m.set(1, 0, 2.0);
        m.set(0, 1, 3.0);
        assert_eq!(m.as_slice(), &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert_eq!(m.get(1, 0), 2.0);
        assert_eq!(m.row(0).as_slice(), &[1.0, 3.0, 0.0]);
        assert_eq!(m.column(0).as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn insert_and_remove_column_round_trip() {
        let mut m = DenseMatrix::from_col_major(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        m.insert_zero_column(1);
        assert_eq!(m.cols(), 3);
        assert_eq!(m.column(1).as_slice(), &[0.0, 0.0]);
        m.set_column(1, &DenseVector::from_vec(vec![9.0, 9.0]));
        m.remove_column(1);
        assert_eq!(m.cols(), 2);
        assert_eq!(m.column(1).as_slice(), &[3.0, 4.0]);
    }

    #[test]
    fn matmul_matches_hand_computation() {
        let a = DenseMatrix::from_col_major(2, 2, vec![1.0, 3.0, 2.0, 4.0]); // [[1,2],[3,4]]
        let b = DenseMatrix::from_col_major(2, 2, vec![5.0, 7.0, 6.0, 8.0]); // [[5,6],[7,8]]
        let c = a.matmul(&b);
        // [[1,2],[3,4]] * [[5,6],[7,8]] = [[19,22],[43,50]]
        assert_eq!(c.get(0, 0), 19.0);
        assert_eq!(c.get(0, 1), 22.0);
        assert_eq!(c.get(1, 0), 43.0);
        assert_eq!(c.get(1, 1), 50.0);
    }

    #[test]
    fn offsets_even_partition() {
        let offs = Offsets::even(10, 3);
        assert_eq!(offs.as_slice(), &[0, 4, 7, 10]);
        assert_eq!(offs.local_rows(0), 4);
        assert_eq!(offs.local_rows(1), 3);
        assert_eq!(offs.owner_of(4), 1);
        assert_eq!(offs.owner_of(9), 2);
    }

    #[test]
    fn offsets_reject_bad_input() {
        assert!(Offsets::new(vec![1, 2]).is_err());
        assert!(Offsets::new(vec![0, 3, 2]).is_err());
        assert!(Offsets::new(vec![0, 3, 5]).is_ok());
    }

    #[test]
    fn offsets_owner_of_tolerates_empty_ranks() {
        let offs = Offsets::new(vec![0, 0, 5, 5, 8]).unwrap();
        assert_eq!(offs.owner_of(0), 1);
        assert_eq!(offs.owner_of(4), 1);
        assert_eq!(offs.owner_of(5), 3);
    }
}
