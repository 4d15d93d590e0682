//! Post-processing hook (C6) and reference plug-ins (C10)
//!
//! Post-processing dispatches to whichever concrete acceleration scheme was
//! configured (constant relaxation, various quasi-Newton variants); the
//! core only guarantees the call protocol
//! (`perform_post_processing`/`export_state`/`import_state`/`new_measurement_series`).
//! This module ships the [`PostProcessing`] trait plus two concrete
//! implementations exercising it end to end: [`ConstantRelaxation`], the
//! textbook non-accelerated case, and [`QrAcceleratedPostProcessing`], a
//! minimal IQN-ILS-style quasi-Newton step built on top of the crate's own
//! [`QrFactorization`] (C4).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io;

use crate::checkpoint::{CheckpointReader, CheckpointWriter};
use crate::cohort::Cohort;
use crate::coupling_scheme::{CoupledData, DataId};
use crate::error::CoreError;
use crate::linalg::{DenseMatrix, DenseVector};
use crate::qr::{QrFactorization, DEFAULT_OMEGA, DEFAULT_SIGMA, DEFAULT_THETA};

/// Polymorphic acceleration step applied to the current iterate between
/// sub-iterations.
pub trait PostProcessing: Send {
    /// Accelerate every registered datum's `values` in place, given the
    /// current map of coupled data (keyed by data id, in the coupling
    /// scheme's iteration order).
    fn perform_post_processing(&mut self, data: &mut BTreeMap<DataId, CoupledData>, cohort: &Cohort) -> Result<(), CoreError>;

    /// Persist internal state so a checkpointed run can resume exactly.
    fn export_state(&self, writer: &mut dyn CheckpointWriter) -> io::Result<()>;

    /// The strict inverse of [`PostProcessing::export_state`].
    fn import_state(&mut self, reader: &mut dyn CheckpointReader) -> io::Result<()>;

    /// Reset rolling state at the start of a new coupled timestep.
    fn new_measurement_series(&mut self);
}

/// Textbook non-accelerated under-relaxation: `values <- relaxation * values
/// + (1 - relaxation) * oldValues.column(0)`. Stateless.
pub struct ConstantRelaxation {
    relaxation: f64,
}

impl ConstantRelaxation {
    /// Build a constant-relaxation post-processing with factor `relaxation`
    /// (must lie in `(0, 1]`; `1.0` disables relaxation entirely).
    pub fn new(relaxation: f64) -> Result<Self, CoreError> {
        if !(relaxation > 0.0 && relaxation <= 1.0) {
            return Err(CoreError::configuration("constant relaxation factor must lie in (0, 1]"));
        }
        Ok(ConstantRelaxation { relaxation })
    }
}

impl PostProcessing for ConstantRelaxation {
    fn perform_post_processing(&mut self, data: &mut BTreeMap<DataId, CoupledData>, _cohort: &Cohort) -> Result<(), CoreError> {
        for datum in data.values_mut() {
            crate::error::invariant!(datum.old_values.cols() >= 1, "constant relaxation: datum has no old_values column");
            let old0 = datum.old_values.column(0);
            for i in 0..datum.values.len() {
                let relaxed = self.relaxation * datum.values.get(i) + (1.0 - self.relaxation) * old0.get(i);
                datum.values.set(i, relaxed);
            }
        }
        Ok(())
    }

    fn export_state(&self, _writer: &mut dyn CheckpointWriter) -> io::Result<()> {
        Ok(())
    }

    fn import_state(&mut self, _reader: &mut dyn CheckpointReader) -> io::Result<()> {
        Ok(())
    }

    fn new_measurement_series(&mut self) {}
}

/// Minimal IQN-ILS-style quasi-Newton acceleration.
///
/// Stacks every registered datum's residual (`values - oldValues.column(0)`)
/// into one vector, maintains an incremental QR ([`QrFactorization`]) of the
/// differences of that stacked residual across sub-iterations, and at each
/// call solves the small triangular least-squares system `R * alpha = -(Q^T
/// * residual)` by back-substitution, then applies the correction `W *
/// alpha` (where `W`'s columns are the matching differences of the stacked
/// iterate) to every datum's `values`.
pub struct QrAcceleratedPostProcessing {
    qr: QrFactorization,
    delta_values: Vec<DenseVector>,
    last_residual: Option<DenseVector>,
    last_values: Option<DenseVector>,
}

impl QrAcceleratedPostProcessing {
    /// Build an accelerator using the QR factorization's literature
    /// defaults (`ω`, `θ`, `σ`).
    pub fn new() -> Self {
        QrAcceleratedPostProcessing {
            qr: QrFactorization::with_defaults(),
            delta_values: Vec::new(),
            last_residual: None,
            last_values: None,
        }
    }

    fn stack(data: &BTreeMap<DataId, CoupledData>) -> Result<(DenseVector, DenseVector, Vec<usize>), CoreError> {
        let mut values = Vec::new();
        let mut residual = Vec::new();
        let mut lengths = Vec::with_capacity(data.len());
        for datum in data.values() {
            crate::error::invariant!(datum.old_values.cols() >= 1, "qr acceleration: datum has no old_values column");
            let old0 = datum.old_values.column(0);
            lengths.push(datum.values.len());
            for i in 0..datum.values.len() {
                values.push(datum.values.get(i));
                residual.push(datum.values.get(i) - old0.get(i));
            }
        }
        Ok((DenseVector::from_vec(values), DenseVector::from_vec(residual), lengths))
    }

    fn solve_back_substitution(r: &DenseMatrix, rhs: &DenseVector) -> Result<DenseVector, CoreError> {
        let cols = r.cols();
        let mut alpha = DenseVector::zeros(cols);
        for i in (0..cols).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..cols {
                sum += r.get(i, j) * alpha.get(j);
            }
            let rii = r.get(i, i);
            if rii.abs() < 1e-300 {
                return Err(CoreError::numerical("qr acceleration: singular R in quasi-Newton solve"));
            }
            alpha.set(i, (-rhs.get(i) - sum) / rii);
        }
        Ok(alpha)
    }
}

impl Default for QrAcceleratedPostProcessing {
    fn default() -> Self {
        QrAcceleratedPostProcessing::new()
    }
}

impl PostProcessing for QrAcceleratedPostProcessing {
    fn perform_post_processing(&mut self, data: &mut BTreeMap<DataId, CoupledData>, cohort: &Cohort) -> Result<(), CoreError> {
        let (values_now, residual_now, lengths) = Self::stack(data)?;

        if let (Some(last_residual), Some(last_values)) = (self.last_residual.take(), self.last_values.take()) {
            let mut delta_r = residual_now.clone();
            delta_r.sub_assign(&last_residual);
            let mut delta_w = values_now.clone();
            delta_w.sub_assign(&last_values);

            self.qr.push_back(delta_r, cohort, 0)?;
            self.delta_values.push(delta_w);

            let cols = self.qr.cols();
            let q = self.qr.q();
            let r = self.qr.r();

            let mut c = DenseVector::zeros(cols);
            for j in 0..cols {
                let qj = q.column(j);
                c.set(j, cohort.dot(qj.as_slice(), residual_now.as_slice())?);
            }
            let alpha = Self::solve_back_substitution(r, &c)?;

            let mut correction = DenseVector::zeros(values_now.len());
            for (column, a) in self.delta_values.iter().zip(alpha.as_slice()) {
                correction.axpy(*a, column);
            }

            let mut corrected = values_now.clone();
            corrected.axpy(1.0, &correction);

            let mut offset = 0;
            for (len, datum) in lengths.iter().zip(data.values_mut()) {
                for i in 0..*len {
                    datum.values.set(i, corrected.get(offset + i));
                }
                offset += len;
            }
        }

        self.last_residual = Some(residual_now);
        self.last_values = Some(values_now);
        Ok(())
    }

    fn export_state(&self, writer: &mut dyn CheckpointWriter) -> io::Result<()> {
        let rows = self.qr.rows();
        let cols = self.qr.cols();
        writer.write_matrix(&DenseMatrix::from_col_major(1, 2, vec![rows as f64, cols as f64]))?;
        writer.write_matrix(self.qr.q())?;
        writer.write_matrix(self.qr.r())?;

        let mut w = DenseMatrix::zeros(rows, cols);
        for (j, column) in self.delta_values.iter().enumerate() {
            w.set_column(j, column);
        }
        writer.write_matrix(&w)?;

        let residual_rows = self.last_residual.as_ref().map(DenseVector::len).unwrap_or(0);
        writer.write_matrix(&DenseMatrix::from_col_major(1, 1, vec![residual_rows as f64]))?;
        let mut last = DenseMatrix::zeros(residual_rows, 2);
        if let (Some(r), Some(v)) = (&self.last_residual, &self.last_values) {
            last.set_column(0, r);
            last.set_column(1, v);
        }
        writer.write_matrix(&last)?;
        Ok(())
    }

    fn import_state(&mut self, reader: &mut dyn CheckpointReader) -> io::Result<()> {
        let shape = reader.read_matrix(1, 2)?;
        let rows = shape.get(0, 0) as usize;
        let cols = shape.get(0, 1) as usize;

        let q = reader.read_matrix(rows, cols)?;
        let r = reader.read_matrix(cols, cols)?;
        let w = reader.read_matrix(rows, cols)?;

        self.qr = QrFactorization::from_parts(q, r, DEFAULT_OMEGA, DEFAULT_THETA, DEFAULT_SIGMA)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.delta_values = (0..cols).map(|j| w.column(j)).collect();

        let residual_shape = reader.read_matrix(1, 1)?;
        let residual_rows = residual_shape.get(0, 0) as usize;
        let last = reader.read_matrix(residual_rows, 2)?;
        if residual_rows > 0 {
            self.last_residual = Some(last.column(0));
            self.last_values = Some(last.column(1));
        } else {
            self.last_residual = None;
            self.last_values = None;
        }
        Ok(())
    }

    fn new_measurement_series(&mut self) {
        self.qr.reset();
        self.delta_values.clear();
        self.last_residual = None;
        self.last_values = None;
    }
}
