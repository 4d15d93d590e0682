//! Unified error taxonomy for the coupling core
//!
//! Every fallible public operation in this crate returns `Result<_, CoreError>`.
//! The four variants mirror the four failure categories the core distinguishes:
//! a bad configuration caught at construction/initialize time, a numerical
//! breakdown inside the QR machinery, a transport failure from the
//! communicator, and an internal invariant violation (a programmer error, not
//! a runtime condition a caller can recover from).
//!
//! One flat enum rather than a per-module error tree: every fallible call
//! site just needs `Result<_, CoreError>` and `?`, with no conversions to
//! wire up at module boundaries.

#![forbid(unsafe_code)]

/// Top-level error type surfaced by every public operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Contradictory or incomplete configuration, caught at construction or
    /// `initialize()` time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Numerical breakdown: orthogonalization exceeded its refinement budget,
    /// or another unrecoverable numerical condition.
    #[error("numerical breakdown: {0}")]
    Numerical(String),

    /// A point-to-point transport error surfaced from the `Communicator`.
    #[error("transport error: {0}")]
    Transport(String),

    /// An invariant the core itself is responsible for maintaining was
    /// violated: dimension mismatch, shape drift, missing columns.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Shorthand for constructing a [`CoreError::Configuration`].
    pub fn configuration(msg: impl Into<String>) -> Self {
        CoreError::Configuration(msg.into())
    }

    /// Shorthand for constructing a [`CoreError::Numerical`].
    pub fn numerical(msg: impl Into<String>) -> Self {
        CoreError::Numerical(msg.into())
    }

    /// Shorthand for constructing a [`CoreError::Transport`].
    pub fn transport(msg: impl Into<String>) -> Self {
        CoreError::Transport(msg.into())
    }

    /// Shorthand for constructing a [`CoreError::Invariant`].
    pub fn invariant(msg: impl Into<String>) -> Self {
        CoreError::Invariant(msg.into())
    }
}

/// Convenience assertion macro used throughout the crate's distributed and
/// numerical kernels in place of `panic!`/`assert!`, returning a
/// [`CoreError::Invariant`] instead of unwinding.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::CoreError::invariant(format!($($arg)*)));
        }
    };
}

pub(crate) use invariant;
