//! Checkpoint codec and iterations log (C9)
//!
//! Checkpointing is a simple sequential text dump: `exportState`/
//! `importState` write and read the `old_values` history for every bound
//! datum, and the iterations log appends one row per completed timestep.
//! The wire format is plain text, so this crate ships one concrete
//! realization behind small traits — [`CheckpointWriter`]/[`CheckpointReader`]
//! — so an integrator can substitute a binary or mmap-backed codec without
//! touching `coupling_scheme.rs`.

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::linalg::DenseMatrix;

/// Write-side half of the checkpoint codec: one call per matrix to persist,
/// in the deterministic order `coupling_scheme.rs` calls them (send data,
/// then receive data, then any post-processing state).
pub trait CheckpointWriter {
    /// Append one matrix to the checkpoint stream.
    fn write_matrix(&mut self, m: &DenseMatrix) -> io::Result<()>;
}

/// Read-side half of the checkpoint codec; the strict inverse of
/// [`CheckpointWriter`] — matrices must be read back in exactly the order
/// they were written.
pub trait CheckpointReader {
    /// Read the next matrix from the checkpoint stream. `rows`/`cols` are
    /// the shape the caller expects; a shape mismatch is an error.
    fn read_matrix(&mut self, rows: usize, cols: usize) -> io::Result<DenseMatrix>;
}

/// Concrete TXT realization of the checkpoint format: a header line
/// `<rows> <cols>` followed by `rows` lines of `cols` space-separated `f64`
/// values, formatted `{:.17e}` (round-trip-exact for `f64`).
pub struct TxtCheckpointWriter<W: Write> {
    out: W,
}

impl TxtCheckpointWriter<BufWriter<File>> {
    /// Open (creating or truncating) `path` for writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(TxtCheckpointWriter { out: BufWriter::new(File::create(path)?) })
    }
}

impl<W: Write> TxtCheckpointWriter<W> {
    /// Wrap any `Write`, e.g. an in-memory `Vec<u8>` for tests.
    pub fn new(out: W) -> Self {
        TxtCheckpointWriter { out }
    }
}

impl<W: Write> CheckpointWriter for TxtCheckpointWriter<W> {
    fn write_matrix(&mut self, m: &DenseMatrix) -> io::Result<()> {
        writeln!(self.out, "{} {}", m.rows(), m.cols())?;
        for i in 0..m.rows() {
            let mut line = String::with_capacity(m.cols() * 24);
            for j in 0..m.cols() {
                if j > 0 {
                    line.push(' ');
                }
                line.push_str(&format!("{:.17e}", m.get(i, j)));
            }
            writeln!(self.out, "{line}")?;
        }
        Ok(())
    }
}

/// Concrete TXT realization of the read side; the strict inverse of
/// [`TxtCheckpointWriter`].
pub struct TxtCheckpointReader<R: BufRead> {
    input: R,
}

impl TxtCheckpointReader<BufReader<File>> {
    /// Open `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(TxtCheckpointReader { input: BufReader::new(File::open(path)?) })
    }
}

impl<R: BufRead> TxtCheckpointReader<R> {
    /// Wrap any `BufRead`, e.g. an in-memory `Cursor` for tests.
    pub fn new(input: R) -> Self {
        TxtCheckpointReader { input }
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let n = self.input.read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "checkpoint stream ended early"));
        }
        Ok(line)
    }
}

impl<R: BufRead> CheckpointReader for TxtCheckpointReader<R> {
    fn read_matrix(&mut self, rows: usize, cols: usize) -> io::Result<DenseMatrix> {
        let header = self.read_line()?;
        let mut parts = header.split_whitespace();
        let file_rows: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed checkpoint header"))?;
        let file_cols: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed checkpoint header"))?;
        if file_rows != rows || file_cols != cols {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("checkpoint shape mismatch: file has {file_rows}x{file_cols}, expected {rows}x{cols}"),
            ));
        }

        let mut m = DenseMatrix::zeros(rows, cols);
        for i in 0..rows {
            let line = self.read_line()?;
            let mut values = line.split_whitespace();
            for j in 0..cols {
                let v: f64 = values
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed value at row {i}")))?;
                m.set(i, j, v);
            }
        }
        Ok(m)
    }
}

/// Appends one row per completed coupled timestep to the iterations log:
/// `Timesteps Total-Iterations Iterations Convergence`.
pub struct IterationsLogWriter<W: Write> {
    out: W,
    header_written: bool,
}

impl IterationsLogWriter<BufWriter<File>> {
    /// Create (truncating) `iterations-<participant>.txt`-style log file.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(IterationsLogWriter { out: BufWriter::new(File::create(path)?), header_written: false })
    }
}

impl<W: Write> IterationsLogWriter<W> {
    /// Wrap any `Write`, e.g. an in-memory `Vec<u8>` for tests.
    pub fn new(out: W) -> Self {
        IterationsLogWriter { out, header_written: false }
    }

    /// Append one row for a just-completed timestep.
    pub fn write_row(&mut self, timesteps: u64, total_iterations: u64, iterations: u64, converged: bool) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.out, "Timesteps Total-Iterations Iterations Convergence")?;
            self.header_written = true;
        }
        writeln!(self.out, "{} {} {} {}", timesteps, total_iterations, iterations, u8::from(converged))
    }
}

/// Object-safe handle to an [`IterationsLogWriter`], so `coupling_scheme.rs`
/// can hold one behind a trait object instead of threading the sink's
/// concrete `Write` type through `CouplingScheme`'s own type parameters.
pub trait IterationsSink: Send {
    /// Append one row for a just-completed timestep.
    fn write_row(&mut self, timesteps: u64, total_iterations: u64, iterations: u64, converged: bool) -> io::Result<()>;
}

impl<W: Write + Send> IterationsSink for IterationsLogWriter<W> {
    fn write_row(&mut self, timesteps: u64, total_iterations: u64, iterations: u64, converged: bool) -> io::Result<()> {
        IterationsLogWriter::write_row(self, timesteps, total_iterations, iterations, converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn txt_checkpoint_round_trips_a_matrix() {
        let m = DenseMatrix::from_col_major(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut buf = Vec::new();
        TxtCheckpointWriter::new(&mut buf).write_matrix(&m).unwrap();

        let mut reader = TxtCheckpointReader::new(Cursor::new(buf));
        let round_tripped = reader.read_matrix(2, 3).unwrap();
        assert_eq!(round_tripped, m);
    }

    #[test]
    fn txt_checkpoint_round_trips_multiple_matrices_in_order() {
        let a = DenseMatrix::from_col_major(1, 2, vec![1.5, -2.5]);
        let b = DenseMatrix::from_col_major(2, 1, vec![0.0, 9.25]);
        let mut buf = Vec::new();
        {
            let mut writer = TxtCheckpointWriter::new(&mut buf);
            writer.write_matrix(&a).unwrap();
            writer.write_matrix(&b).unwrap();
        }
        let mut reader = TxtCheckpointReader::new(Cursor::new(buf));
        assert_eq!(reader.read_matrix(1, 2).unwrap(), a);
        assert_eq!(reader.read_matrix(2, 1).unwrap(), b);
    }

    #[test]
    fn txt_checkpoint_read_rejects_shape_mismatch() {
        let m = DenseMatrix::zeros(2, 2);
        let mut buf = Vec::new();
        TxtCheckpointWriter::new(&mut buf).write_matrix(&m).unwrap();
        let mut reader = TxtCheckpointReader::new(Cursor::new(buf));
        assert!(reader.read_matrix(3, 3).is_err());
    }

    #[test]
    fn iterations_log_writes_header_once_then_one_row_per_timestep() {
        let mut buf = Vec::new();
        {
            let mut log = IterationsLogWriter::new(&mut buf);
            log.write_row(1, 3, 3, true).unwrap();
            log.write_row(2, 5, 2, false).unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "Timesteps Total-Iterations Iterations Convergence");
        assert_eq!(lines.next().unwrap(), "1 3 3 1");
        assert_eq!(lines.next().unwrap(), "2 5 2 0");
    }
}
