//! Convergence-measure registry (C5) and reference plug-ins (C10)
//!
//! A [`ConvergenceMeasure`] is a polymorphic judge over a pair of iterates
//! (the previous sub-iteration's values and the current one); the registry
//! semantics — "all registered measures converge" or "at least one measure
//! marked `suffices` converges" — live in [`measure_convergence`]. Two
//! reference implementations are provided so the crate's own tests (and an
//! integrator starting from scratch) have something concrete to register:
//! [`AbsoluteConvergenceMeasure`] and [`RelativeConvergenceMeasure`].

#![forbid(unsafe_code)]

use crate::cohort::Cohort;
use crate::error::CoreError;
use crate::linalg::DenseVector;

/// A pure judge of fixed-point convergence between two iterates.
///
/// Implementations own whatever rolling state they need (e.g. the residual
/// norm from the last call, for a printable diagnostic); [`new_measurement_series`]
/// resets that state at the start of every coupled timestep, before the
/// first sub-iteration.
pub trait ConvergenceMeasure: Send {
    /// Judge convergence between `old` (the previous sub-iteration's value,
    /// `oldValues` column 0) and `new` (the current iterate), updating
    /// internal state. Dot products/norms route through `cohort` so
    /// implementations are distributed-aware without extra plumbing.
    fn measure(&mut self, old: &DenseVector, new: &DenseVector, cohort: &Cohort) -> Result<(), CoreError>;

    /// Whether the most recent [`ConvergenceMeasure::measure`] call judged
    /// convergence.
    fn is_convergence(&self) -> bool;

    /// A human-readable summary of the current state, for logging by the
    /// caller (this crate never logs on its own).
    fn print_state(&self) -> String;

    /// Reset rolling state at the start of a new coupled timestep.
    fn new_measurement_series(&mut self);
}

/// One registered measure: which datum it judges, whether it alone suffices
/// for overall convergence, and the plug-in itself.
pub struct RegisteredMeasure {
    /// The data-id this measure judges.
    pub data_id: u32,
    /// If `true`, this measure converging is sufficient for overall
    /// convergence regardless of the other registered measures.
    pub suffices: bool,
    /// The measure plug-in.
    pub measure: Box<dyn ConvergenceMeasure>,
}

/// Iterate every registered measure's [`ConvergenceMeasure::measure`] against
/// `(old, new)` fetched for its `data_id`, then return `all_converged ||
/// one_suffices`. `lookup` resolves a `data_id` to the `(old, new)`
/// pair to judge; errors if any registered `data_id` cannot be resolved.
///
/// Panics only via `debug_assert`: callers must register at least one
/// measure (checked by [`crate::coupling_scheme::CouplingScheme::initialize`],
/// which is the only production call site, as part of its configuration-error
/// taxonomy: "zero convergence measures on the second participant").
pub fn measure_convergence(
    measures: &mut [RegisteredMeasure],
    lookup: impl Fn(u32) -> Option<(DenseVector, DenseVector)>,
    cohort: &Cohort,
) -> Result<bool, CoreError> {
    let mut all_converged = true;
    let mut one_suffices = false;
    for registered in measures.iter_mut() {
        let (old, new) = lookup(registered.data_id)
            .ok_or_else(|| CoreError::invariant(format!("no data bound for convergence measure on data id {}", registered.data_id)))?;
        registered.measure.measure(&old, &new, cohort)?;
        if registered.measure.is_convergence() {
            if registered.suffices {
                one_suffices = true;
            }
        } else {
            all_converged = false;
        }
    }
    Ok(all_converged || one_suffices)
}

/// Converged when `‖new - old‖_2 <= limit`.
pub struct AbsoluteConvergenceMeasure {
    limit: f64,
    last_residual: f64,
    converged: bool,
}

impl AbsoluteConvergenceMeasure {
    /// Build a measure with absolute residual bound `limit` (must be `> 0`).
    pub fn new(limit: f64) -> Result<Self, CoreError> {
        if !(limit > 0.0) {
            return Err(CoreError::configuration("absolute convergence measure limit must be positive"));
        }
        Ok(AbsoluteConvergenceMeasure { limit, last_residual: f64::INFINITY, converged: false })
    }
}

impl ConvergenceMeasure for AbsoluteConvergenceMeasure {
    fn measure(&mut self, old: &DenseVector, new: &DenseVector, cohort: &Cohort) -> Result<(), CoreError> {
        let mut residual = new.clone();
        residual.sub_assign(old);
        self.last_residual = cohort.l2norm(residual.as_slice())?;
        self.converged = self.last_residual <= self.limit;
        Ok(())
    }

    fn is_convergence(&self) -> bool {
        self.converged
    }

    fn print_state(&self) -> String {
        format!("absolute convergence measure: residual = {:.6e}, limit = {:.6e}, convergence = {}", self.last_residual, self.limit, self.converged)
    }

    fn new_measurement_series(&mut self) {
        self.last_residual = f64::INFINITY;
        self.converged = false;
    }
}

/// Converged when `‖new - old‖_2 <= limit * ‖new‖_2`; a zero-norm `new` is
/// treated as converged (there is nothing left to relax against).
pub struct RelativeConvergenceMeasure {
    limit: f64,
    last_relative_residual: f64,
    converged: bool,
}

impl RelativeConvergenceMeasure {
    /// Build a measure with relative residual bound `limit` (must be `> 0`).
    pub fn new(limit: f64) -> Result<Self, CoreError> {
        if !(limit > 0.0) {
            return Err(CoreError::configuration("relative convergence measure limit must be positive"));
        }
        Ok(RelativeConvergenceMeasure { limit, last_relative_residual: f64::INFINITY, converged: false })
    }
}

impl ConvergenceMeasure for RelativeConvergenceMeasure {
    fn measure(&mut self, old: &DenseVector, new: &DenseVector, cohort: &Cohort) -> Result<(), CoreError> {
        let mut residual = new.clone();
        residual.sub_assign(old);
        let residual_norm = cohort.l2norm(residual.as_slice())?;
        let new_norm = cohort.l2norm(new.as_slice())?;
        if new_norm == 0.0 {
            self.last_relative_residual = 0.0;
            self.converged = true;
            return Ok(());
        }
        self.last_relative_residual = residual_norm / new_norm;
        self.converged = self.last_relative_residual <= self.limit;
        Ok(())
    }

    fn is_convergence(&self) -> bool {
        self.converged
    }

    fn print_state(&self) -> String {
        format!(
            "relative convergence measure: relative residual = {:.6e}, limit = {:.6e}, convergence = {}",
            self.last_relative_residual, self.limit, self.converged
        )
    }

    fn new_measurement_series(&mut self) {
        self.last_relative_residual = f64::INFINITY;
        self.converged = false;
    }
}
