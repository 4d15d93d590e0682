//! Crate root: public surface and core aliases
//!
//! This module is the **single canonical entry-point** for downstream users
//! of the library. It re-exports the submodules implementing an implicit
//! partner-coupling scheme for multi-physics co-simulation: incremental QR
//! factorization, distributed dense linear algebra, a point-to-point
//! communicator abstraction, an explicit cohort context replacing a global
//! singleton, convergence measures, post-processing (acceleration), the
//! checkpoint codec, and the coupling scheme itself.
//!
//! ## Invariants
//!
//! - **No process-global state.** Every distributed primitive takes its
//!   [`cohort::Cohort`] by reference; there is no singleton to initialize or
//!   tear down.
//! - **Column-major dense storage.** [`linalg::DenseMatrix`] matches the
//!   layout the QR and post-processing code assume throughout.
//! - **`unsafe` is forbidden** crate-wide; every module carries its own
//!   `#![forbid(unsafe_code)]` as a redundant, file-local guard.
//! - **Precise errors, never panics in production paths.** Invariant
//!   violations and configuration mistakes surface as [`error::CoreError`];
//!   this crate does not own logging or process exit codes — callers decide
//!   how to report failures.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Unified error type for configuration, numerical, transport, and internal
/// invariant failures.
pub mod error;
/// Column-major dense matrix/vector types and the row-partition descriptor.
pub mod linalg;
/// Point-to-point communicator abstraction and an in-process implementation.
pub mod comm;
/// Explicit distributed-context struct and its collective primitives.
pub mod cohort;
/// Distributed matrix-matrix and matrix-vector multiplication strategies.
pub mod matops;
/// Incremental QR factorization with Givens-rotation column insert/delete.
pub mod qr;
/// Convergence-measure registry and reference plug-ins.
pub mod convergence;
/// Checkpoint codec (TXT realization) and the iterations log.
pub mod checkpoint;
/// Post-processing (acceleration) hook and reference plug-ins.
pub mod postprocessing;
/// Implicit coupling scheme: the per-timestep iteration state machine.
pub mod coupling_scheme;

pub use crate::cohort::Cohort;
pub use crate::comm::{ChannelCommunicator, Communicator};
pub use crate::convergence::{AbsoluteConvergenceMeasure, ConvergenceMeasure, RelativeConvergenceMeasure};
pub use crate::coupling_scheme::{Action, CoupledData, CouplingScheme, DataId, DtMethod};
pub use crate::error::CoreError;
pub use crate::linalg::{DenseMatrix, DenseVector, Offsets};
pub use crate::postprocessing::{ConstantRelaxation, PostProcessing, QrAcceleratedPostProcessing};
pub use crate::qr::QrFactorization;
