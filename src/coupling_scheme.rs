//! Implicit coupling scheme (C7)
//!
//! The per-timestep iteration state machine driving two participants through
//! a boundary-data exchange to a fixed point. The shared bookkeeping common
//! to any such scheme (timestep count, current time, completion flag) is
//! factored into [`BaseState`], a plain embedded struct rather than a base
//! class a deeper state-machine hierarchy might use.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::io;

use crate::checkpoint::{CheckpointReader, CheckpointWriter, IterationsSink};
use crate::cohort::Cohort;
use crate::comm::Communicator;
use crate::convergence::{self, RegisteredMeasure};
use crate::error::{invariant, CoreError};
use crate::linalg::{DenseMatrix, DenseVector};
use crate::postprocessing::PostProcessing;

/// Key identifying one coupled datum, shared by the send and receive maps.
pub type DataId = u32;

/// Per-data-id record: the current iterate and its extrapolation history.
///
/// `old_values` is column-major: column 0 is the previous iterate,
/// columns `1..k` hold historical iterates for extrapolation. Every column
/// has the same row count as `values`.
#[derive(Clone, Debug)]
pub struct CoupledData {
    /// The current iterate, row-partitioned across the cohort in a
    /// distributed deployment.
    pub values: DenseVector,
    /// Column 0 is the previous sub-iteration's value; further columns hold
    /// older timesteps' values for extrapolation.
    pub old_values: DenseMatrix,
}

impl CoupledData {
    /// A freshly registered datum with no extrapolation history yet
    /// (`old_values` has zero columns; `initialize()` allocates what's
    /// needed).
    pub fn new(values: DenseVector) -> Self {
        let len = values.len();
        CoupledData { values, old_values: DenseMatrix::zeros(len, 0) }
    }
}

/// Timestep-length negotiation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtMethod {
    /// The timestep length is fixed and shared by both participants.
    FixedDt,
    /// The first participant picks `dt` each step; the second receives it.
    FirstParticipantSetsDt,
    /// The structural dual: the second participant picks `dt`; the first
    /// receives it.
    SecondParticipantSetsDt,
}

/// An action the external driver must acknowledge before the next
/// `advance()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Emitted after a converged timestep: the driver must persist its
    /// physics state.
    WriteIterationCheckpoint,
    /// Emitted when a sub-iteration failed to converge: the driver must
    /// rewind to its last checkpoint.
    ReadIterationCheckpoint,
}

/// Bookkeeping shared by both participant roles, held as a plain embedded
/// struct (see module docs).
#[derive(Debug, Clone, Default)]
pub struct BaseState {
    /// Number of completed coupled timesteps.
    pub timesteps: u64,
    /// Current simulated time.
    pub time: f64,
    /// Whether `initialize()` has run.
    pub is_initialized: bool,
    /// Whether the current timestep has converged and completed.
    pub is_coupling_timestep_complete: bool,
}

impl BaseState {
    fn send(&self, communicator: &dyn Communicator) -> Result<(), CoreError> {
        communicator.send_int(self.timesteps as i32)?;
        communicator.send_f64(self.time)?;
        communicator.send_int(i32::from(self.is_coupling_timestep_complete))?;
        Ok(())
    }

    fn receive(communicator: &dyn Communicator) -> Result<Self, CoreError> {
        let timesteps = communicator.receive_int()? as u64;
        let time = communicator.receive_f64()?;
        let is_coupling_timestep_complete = communicator.receive_int()? != 0;
        Ok(BaseState { timesteps, time, is_initialized: true, is_coupling_timestep_complete })
    }
}

/// The implicit coupling scheme's iteration state machine.
pub struct CouplingScheme {
    base: BaseState,
    max_time: f64,
    max_timesteps: Option<u64>,
    timestep_length: Option<f64>,
    #[allow(dead_code)]
    valid_digits: i32,

    first_participant: String,
    second_participant: String,
    does_first_step: bool,
    dt_method: DtMethod,
    participant_sets_dt: bool,
    participant_receives_dt: bool,
    current_dt: f64,

    communicator: Box<dyn Communicator>,
    cohort: Cohort,

    max_iterations: Option<u32>,
    iterations: u32,
    total_iterations: u64,

    extrapolation_order: u8,
    send_data: BTreeMap<DataId, CoupledData>,
    receive_data: BTreeMap<DataId, CoupledData>,
    convergence_measures: Vec<RegisteredMeasure>,
    post_processing: Option<Box<dyn PostProcessing>>,
    iterations_log: Option<Box<dyn IterationsSink>>,

    required_actions: HashSet<Action>,
    has_to_send_init_data: bool,
    has_to_receive_init_data: bool,
}

impl CouplingScheme {
    /// Build a scheme. Validates the configuration error taxonomy:
    /// distinct non-empty participant names, `local_participant` equal to
    /// one of them, `FixedDt` requiring a positive `timestep_length`, and
    /// `max_iterations` either unbounded (`None`) or `>= 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_time: f64,
        max_timesteps: Option<u64>,
        timestep_length: Option<f64>,
        valid_digits: i32,
        first_participant: impl Into<String>,
        second_participant: impl Into<String>,
        local_participant: impl Into<String>,
        communicator: Box<dyn Communicator>,
        cohort: Cohort,
        max_iterations: Option<u32>,
        dt_method: DtMethod,
    ) -> Result<Self, CoreError> {
        let first_participant = first_participant.into();
        let second_participant = second_participant.into();
        let local_participant = local_participant.into();

        if first_participant.is_empty() || second_participant.is_empty() {
            return Err(CoreError::configuration("participant names must not be empty"));
        }
        if first_participant == second_participant {
            return Err(CoreError::configuration("first and second participant must have different names"));
        }
        let does_first_step = if local_participant == first_participant {
            true
        } else if local_participant == second_participant {
            false
        } else {
            return Err(CoreError::configuration(format!(
                "local participant \"{local_participant}\" matches neither \"{first_participant}\" nor \"{second_participant}\""
            )));
        };
        if matches!(dt_method, DtMethod::FixedDt) && !matches!(timestep_length, Some(dt) if dt > 0.0) {
            return Err(CoreError::configuration("FixedDt requires a positive timestep_length"));
        }
        if let Some(0) = max_iterations {
            return Err(CoreError::configuration("max_iterations must be >= 1 when bounded"));
        }

        let (participant_sets_dt, participant_receives_dt) = match dt_method {
            DtMethod::FixedDt => (false, false),
            DtMethod::FirstParticipantSetsDt => (does_first_step, !does_first_step),
            DtMethod::SecondParticipantSetsDt => (!does_first_step, does_first_step),
        };
        // FixedDt: both sides already agree. Otherwise the side that doesn't
        // set dt starts "undefined" (0.0) until its first receive.
        let current_dt = if matches!(dt_method, DtMethod::FixedDt) { timestep_length.unwrap_or(0.0) } else { 0.0 };

        Ok(CouplingScheme {
            base: BaseState::default(),
            max_time,
            max_timesteps,
            timestep_length,
            valid_digits,
            first_participant,
            second_participant,
            does_first_step,
            dt_method,
            participant_sets_dt,
            participant_receives_dt,
            current_dt,
            communicator,
            cohort,
            max_iterations,
            iterations: 0,
            total_iterations: 0,
            extrapolation_order: 0,
            send_data: BTreeMap::new(),
            receive_data: BTreeMap::new(),
            convergence_measures: Vec::new(),
            post_processing: None,
            iterations_log: None,
            required_actions: HashSet::new(),
            has_to_send_init_data: false,
            has_to_receive_init_data: false,
        })
    }

    /// Register a datum this participant sends to its partner.
    pub fn add_send_data(&mut self, data_id: DataId, values: DenseVector) {
        self.send_data.insert(data_id, CoupledData::new(values));
    }

    /// Register a datum this participant receives from its partner.
    pub fn add_receive_data(&mut self, data_id: DataId, values: DenseVector) {
        self.receive_data.insert(data_id, CoupledData::new(values));
    }

    /// Mark initial data as needing exchange before the first `advance()`.
    pub fn set_initial_data_exchange(&mut self, send: bool, receive: bool) {
        self.has_to_send_init_data = send;
        self.has_to_receive_init_data = receive;
    }

    /// Set the extrapolation order (`0`, `1`, or `2`; any other value is a
    /// configuration error).
    pub fn set_extrapolation_order(&mut self, order: u8) -> Result<(), CoreError> {
        if order > 2 {
            return Err(CoreError::configuration("extrapolation order must be 0, 1, or 2"));
        }
        self.extrapolation_order = order;
        Ok(())
    }

    /// Register a convergence measure judging `data_id`.
    pub fn add_convergence_measure(&mut self, data_id: DataId, suffices: bool, measure: Box<dyn crate::convergence::ConvergenceMeasure>) {
        self.convergence_measures.push(RegisteredMeasure { data_id, suffices, measure });
    }

    /// Install the post-processing (acceleration) plug-in.
    pub fn set_iteration_post_processing(&mut self, post_processing: Box<dyn PostProcessing>) {
        self.post_processing = Some(post_processing);
    }

    /// Install the iterations-log sink; optional.
    pub fn set_iterations_log(&mut self, log: Box<dyn IterationsSink>) {
        self.iterations_log = Some(log);
    }

    /// Whether the local participant is the first or second participant.
    pub fn does_first_step(&self) -> bool {
        self.does_first_step
    }

    /// The timestep length in effect for the upcoming `advance()`: either
    /// the configured fixed value, or the most recently negotiated one
    /// under `FirstParticipantSetsDt`/`SecondParticipantSetsDt`.
    pub fn current_dt(&self) -> f64 {
        self.current_dt
    }

    /// Whether this participant is the one publishing `dt` this timestep
    /// under the configured [`DtMethod`] (always `false` for `FixedDt`).
    pub fn participant_sets_dt(&self) -> bool {
        self.participant_sets_dt
    }

    /// The participant that sets `dt` calls this before `advance()` to
    /// publish its chosen timestep length; a configuration error (caught
    /// here rather than silently ignored) if this participant does not
    /// own `dt` under the configured [`DtMethod`].
    pub fn set_current_dt(&mut self, dt: f64) -> Result<(), CoreError> {
        if !self.participant_sets_dt {
            return Err(CoreError::configuration("set_current_dt: this participant does not set dt under the configured DtMethod"));
        }
        self.current_dt = dt;
        Ok(())
    }

    /// Whether the coupled simulation should keep advancing: neither the
    /// time nor timestep bound has been reached.
    pub fn is_coupling_ongoing(&self) -> bool {
        let time_ok = self.base.time < self.max_time;
        let steps_ok = self.max_timesteps.map_or(true, |max| self.base.timesteps < max);
        time_ok && steps_ok
    }

    /// Read-only access to a registered send datum.
    pub fn send_data(&self, data_id: DataId) -> Option<&CoupledData> {
        self.send_data.get(&data_id)
    }

    /// Mutable access to a registered send datum (the external driver
    /// writes its solved interface values here before `advance()`).
    pub fn send_data_mut(&mut self, data_id: DataId) -> Option<&mut CoupledData> {
        self.send_data.get_mut(&data_id)
    }

    /// Read-only access to a registered receive datum (the external driver
    /// reads the partner's interface values here after `advance()`).
    pub fn receive_data(&self, data_id: DataId) -> Option<&CoupledData> {
        self.receive_data.get(&data_id)
    }

    /// The number of sub-iterations taken so far in the current timestep.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The running total of sub-iterations across the whole run.
    pub fn total_iterations(&self) -> u64 {
        self.total_iterations
    }

    /// The embedded shared base state.
    pub fn base_state(&self) -> &BaseState {
        &self.base
    }

    /// Bind convergence-measure data, allocate `old_values` history columns,
    /// and exchange initial data if configured. Must run exactly once,
    /// before the first `advance()`.
    pub fn initialize(&mut self) -> Result<(), CoreError> {
        invariant!(!self.base.is_initialized, "initialize: called twice");
        if !self.does_first_step && self.convergence_measures.is_empty() {
            return Err(CoreError::configuration("at least one convergence measure must be registered for the second participant"));
        }
        self.setup_data_matrices()?;
        self.base.is_initialized = true;
        Ok(())
    }

    fn setup_data_matrices(&mut self) -> Result<(), CoreError> {
        let measured_ids: Vec<DataId> = self.convergence_measures.iter().map(|m| m.data_id).collect();
        for id in measured_ids {
            let datum = self
                .send_data
                .get_mut(&id)
                .or_else(|| self.receive_data.get_mut(&id))
                .ok_or_else(|| CoreError::invariant(format!("no data bound for convergence measure on data id {id}")))?;
            if datum.old_values.cols() < 1 {
                datum.old_values = DenseMatrix::zeros(datum.values.len(), 1);
            }
        }
        if self.extrapolation_order > 0 {
            let required_cols = self.extrapolation_order as usize + 1;
            for datum in self.send_data.values_mut().chain(self.receive_data.values_mut()) {
                let cols = datum.old_values.cols();
                invariant!(cols <= 1, "setup_data_matrices: old_values already has {cols} columns before extrapolation setup");
                for _ in cols..required_cols {
                    datum.old_values.insert_zero_column(datum.old_values.cols());
                }
            }
        }
        Ok(())
    }

    /// Drive one sub-iteration: exchange boundary data, and for the second
    /// participant, accelerate and measure convergence; complete the
    /// timestep or request another sub-iteration.
    pub fn advance(&mut self) -> Result<(), CoreError> {
        invariant!(self.base.is_initialized, "advance: called before initialize()");
        invariant!(self.is_coupling_ongoing(), "advance: called while coupling is not ongoing");
        if !self.required_actions.is_empty() {
            return Err(CoreError::invariant("advance: required actions from the previous call were not acknowledged"));
        }

        let converged = self.exchange_and_converge()?;
        self.iterations += 1;
        self.total_iterations += 1;

        let forced = self.max_iterations.is_some_and(|k| self.iterations >= k);
        if converged || forced {
            self.timestep_completed(converged)?;
        } else {
            self.require_action(Action::ReadIterationCheckpoint);
        }
        Ok(())
    }

    fn exchange_and_converge(&mut self) -> Result<bool, CoreError> {
        if self.does_first_step {
            self.send_send_data()?;
            self.receive_receive_data()?;
            Ok(self.communicator.receive_int()? != 0)
        } else {
            self.receive_receive_data()?;
            if let Some(pp) = self.post_processing.as_mut() {
                pp.perform_post_processing(&mut self.send_data, &self.cohort)?;
            }
            let converged = self.measure_convergence()?;
            self.send_send_data()?;
            self.communicator.send_int(i32::from(converged))?;
            Ok(converged)
        }
    }

    fn send_send_data(&mut self) -> Result<(), CoreError> {
        self.communicator.start_send_package()?;
        if self.participant_sets_dt {
            self.communicator.send_f64(self.current_dt)?;
        }
        for datum in self.send_data.values() {
            self.communicator.send_f64_slice(datum.values.as_slice())?;
        }
        self.communicator.finish_send_package()
    }

    fn receive_receive_data(&mut self) -> Result<(), CoreError> {
        self.communicator.start_receive_package()?;
        if self.participant_receives_dt {
            self.current_dt = self.communicator.receive_f64()?;
        }
        for datum in self.receive_data.values_mut() {
            let mut buf = vec![0.0; datum.values.len()];
            self.communicator.receive_f64_slice(&mut buf)?;
            datum.values = DenseVector::from_vec(buf);
        }
        self.communicator.finish_receive_package()
    }

    fn measure_convergence(&mut self) -> Result<bool, CoreError> {
        let CouplingScheme { convergence_measures, send_data, receive_data, cohort, .. } = self;
        let lookup = |id: DataId| -> Option<(DenseVector, DenseVector)> {
            let datum = send_data.get(&id).or_else(|| receive_data.get(&id))?;
            invariant_old_values_present(datum).ok()?;
            Some((datum.old_values.column(0), datum.values.clone()))
        };
        convergence::measure_convergence(convergence_measures, lookup, cohort)
    }

    fn timestep_completed(&mut self, converged: bool) -> Result<(), CoreError> {
        self.base.is_coupling_timestep_complete = true;
        self.base.timesteps += 1;

        if let Some(log) = self.iterations_log.as_mut() {
            log.write_row(self.base.timesteps, self.total_iterations, self.iterations as u64, converged)
                .map_err(|e| CoreError::invariant(format!("iterations log write failed: {e}")))?;
        }
        for measure in &mut self.convergence_measures {
            measure.measure.new_measurement_series();
        }
        if let Some(pp) = self.post_processing.as_mut() {
            pp.new_measurement_series();
        }
        self.iterations = 0;

        if self.is_coupling_ongoing() {
            self.require_action(Action::WriteIterationCheckpoint);
        }
        if self.extrapolation_order > 0 {
            self.extrapolate_data()?;
        }
        Ok(())
    }

    fn extrapolate_data(&mut self) -> Result<(), CoreError> {
        let start_with_first_order = self.base.timesteps == 1 && self.extrapolation_order == 2;
        if self.extrapolation_order == 1 || start_with_first_order {
            for datum in self.send_data.values_mut().chain(self.receive_data.values_mut()) {
                invariant!(datum.old_values.cols() > 1, "extrapolate_data: order-1 extrapolation needs >= 2 old_values columns");
                let old1 = datum.old_values.column(1);
                let mut predictor = datum.values.clone();
                predictor.scale(2.0);
                predictor.sub_assign(&old1);
                let current = datum.values.clone();
                datum.old_values.set_column(0, &current);
                shift_set_first(&mut datum.old_values, &predictor);
                datum.values = predictor;
            }
        } else if self.extrapolation_order == 2 {
            for datum in self.send_data.values_mut().chain(self.receive_data.values_mut()) {
                invariant!(datum.old_values.cols() > 2, "extrapolate_data: order-2 extrapolation needs >= 3 old_values columns");
                let old1 = datum.old_values.column(1);
                let old2 = datum.old_values.column(2);
                let mut predictor = datum.values.clone();
                predictor.scale(2.5);
                for i in 0..predictor.len() {
                    let v = predictor.get(i) - old1.get(i) * 2.0 + old2.get(i) * 0.5;
                    predictor.set(i, v);
                }
                let current = datum.values.clone();
                datum.old_values.set_column(0, &current);
                shift_set_first(&mut datum.old_values, &predictor);
                datum.values = predictor;
            }
        } else {
            return Err(CoreError::invariant("extrapolate_data: called with extrapolation order outside {1, 2}"));
        }
        Ok(())
    }

    /// Mark `action` as required before the next `advance()`.
    pub fn require_action(&mut self, action: Action) {
        self.required_actions.insert(action);
    }

    /// The external driver acknowledges `action` (e.g. after writing or
    /// reading its checkpoint).
    pub fn fulfilled_action(&mut self, action: Action) {
        self.required_actions.remove(&action);
    }

    /// Whether `action` is currently required.
    pub fn is_action_required(&self, action: Action) -> bool {
        self.required_actions.contains(&action)
    }

    /// Error if any required action remains unacknowledged.
    pub fn check_completeness_required_actions(&self) -> Result<(), CoreError> {
        if self.required_actions.is_empty() {
            Ok(())
        } else {
            Err(CoreError::invariant("not all required actions have been fulfilled"))
        }
    }

    /// Tear down the scheme. Errors if called before `initialize()` or
    /// while the coupling is still ongoing.
    pub fn finalize(&mut self) -> Result<(), CoreError> {
        self.check_completeness_required_actions()?;
        invariant!(self.base.is_initialized, "finalize: called before initialize()");
        invariant!(!self.is_coupling_ongoing(), "finalize: called while coupling is still ongoing");
        Ok(())
    }

    /// Human-readable one-line summary for the driver to log (this crate
    /// never logs on its own).
    pub fn print_coupling_state(&self) -> String {
        let max_it = self.max_iterations.map(|k| k.to_string()).unwrap_or_else(|| "unbounded".to_string());
        format!(
            "it {} of {} | t {} {} | write-checkpoint {} | read-checkpoint {}",
            self.iterations,
            max_it,
            self.base.timesteps,
            self.base.time,
            self.is_action_required(Action::WriteIterationCheckpoint),
            self.is_action_required(Action::ReadIterationCheckpoint)
        )
    }

    /// Serialize `{baseState, max_iterations, iterations, total_iterations}`
    /// to the partner, for parallel start-up.
    pub fn send_state(&mut self) -> Result<(), CoreError> {
        self.communicator.start_send_package()?;
        self.base.send(self.communicator.as_ref())?;
        self.communicator.send_int(self.max_iterations.map(|k| k as i32).unwrap_or(-1))?;
        self.communicator.send_int(self.iterations as i32)?;
        self.communicator.send_int(self.total_iterations as i32)?;
        self.communicator.finish_send_package()
    }

    /// The strict inverse of [`CouplingScheme::send_state`].
    pub fn receive_state(&mut self) -> Result<(), CoreError> {
        self.communicator.start_receive_package()?;
        self.base = BaseState::receive(self.communicator.as_ref())?;
        let max_iterations = self.communicator.receive_int()?;
        self.max_iterations = if max_iterations < 0 { None } else { Some(max_iterations as u32) };
        self.iterations = self.communicator.receive_int()? as u32;
        self.total_iterations = self.communicator.receive_int()? as u64;
        self.communicator.finish_receive_package()
    }

    /// Checkpoint the `old_values` of every send then receive datum, then
    /// delegate to the post-processing plug-in. Only the second
    /// participant exports state.
    pub fn export_state(&self, writer: &mut dyn CheckpointWriter) -> io::Result<()> {
        if self.does_first_step {
            return Ok(());
        }
        for datum in self.send_data.values() {
            writer.write_matrix(&datum.old_values)?;
        }
        for datum in self.receive_data.values() {
            writer.write_matrix(&datum.old_values)?;
        }
        if let Some(pp) = &self.post_processing {
            pp.export_state(writer)?;
        }
        Ok(())
    }

    /// The strict inverse of [`CouplingScheme::export_state`]; must consume
    /// the same stream in the same order.
    pub fn import_state(&mut self, reader: &mut dyn CheckpointReader) -> io::Result<()> {
        if self.does_first_step {
            return Ok(());
        }
        for datum in self.send_data.values_mut() {
            datum.old_values = reader.read_matrix(datum.old_values.rows(), datum.old_values.cols())?;
        }
        for datum in self.receive_data.values_mut() {
            datum.old_values = reader.read_matrix(datum.old_values.rows(), datum.old_values.cols())?;
        }
        if let Some(pp) = self.post_processing.as_mut() {
            pp.import_state(reader)?;
        }
        Ok(())
    }
}

fn invariant_old_values_present(datum: &CoupledData) -> Result<(), ()> {
    if datum.old_values.cols() >= 1 {
        Ok(())
    } else {
        Err(())
    }
}

/// Shift `old_values`' history right by one column and place `new_first` at
/// column 0, discarding the oldest column.
fn shift_set_first(old_values: &mut DenseMatrix, new_first: &DenseVector) {
    let cols = old_values.cols();
    for j in (1..cols).rev() {
        let previous = old_values.column(j - 1);
        old_values.set_column(j, &previous);
    }
    if cols > 0 {
        old_values.set_column(0, new_first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelCommunicator;
    use crate::convergence::AbsoluteConvergenceMeasure;
    use std::thread;

    fn scheme_pair(max_iterations: Option<u32>) -> (CouplingScheme, CouplingScheme) {
        let (link_first, link_second) = ChannelCommunicator::pair(0, 1);
        let first = CouplingScheme::new(
            10.0,
            None,
            Some(1.0),
            10,
            "A",
            "B",
            "A",
            Box::new(link_first),
            Cohort::solo(),
            max_iterations,
            DtMethod::FixedDt,
        )
        .unwrap();
        let second = CouplingScheme::new(
            10.0,
            None,
            Some(1.0),
            10,
            "A",
            "B",
            "B",
            Box::new(link_second),
            Cohort::solo(),
            max_iterations,
            DtMethod::FixedDt,
        )
        .unwrap();
        (first, second)
    }

    #[test]
    fn rejects_identical_participant_names() {
        let (link, _unused) = ChannelCommunicator::pair(0, 1);
        let err = CouplingScheme::new(
            10.0,
            None,
            Some(1.0),
            10,
            "A",
            "A",
            "A",
            Box::new(link),
            Cohort::solo(),
            None,
            DtMethod::FixedDt,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_local_participant_matching_neither_name() {
        let (link, _unused) = ChannelCommunicator::pair(0, 1);
        let err = CouplingScheme::new(
            10.0,
            None,
            Some(1.0),
            10,
            "A",
            "B",
            "C",
            Box::new(link),
            Cohort::solo(),
            None,
            DtMethod::FixedDt,
        );
        assert!(err.is_err());
    }

    #[test]
    fn fixed_dt_requires_a_positive_timestep_length() {
        let (link, _unused) = ChannelCommunicator::pair(0, 1);
        let err = CouplingScheme::new(10.0, None, None, 10, "A", "B", "A", Box::new(link), Cohort::solo(), None, DtMethod::FixedDt);
        assert!(err.is_err());
    }

    #[test]
    fn initialize_requires_a_convergence_measure_on_the_second_participant() {
        let (_first, mut second) = scheme_pair(None);
        assert!(second.initialize().is_err());
        second.add_convergence_measure(0, false, Box::new(AbsoluteConvergenceMeasure::new(1e-6).unwrap()));
        second.add_send_data(0, DenseVector::from_vec(vec![0.0]));
        assert!(second.initialize().is_ok());
    }

    #[test]
    fn advance_converges_when_both_sides_report_the_same_value() {
        let (mut first, mut second) = scheme_pair(None);
        first.add_send_data(0, DenseVector::from_vec(vec![1.0]));
        first.add_receive_data(1, DenseVector::from_vec(vec![0.0]));
        second.add_receive_data(0, DenseVector::from_vec(vec![0.0]));
        second.add_send_data(1, DenseVector::from_vec(vec![1.0]));
        // The measure judges sub-iteration stability (old vs. new iterate),
        // not cross-participant agreement; oldValues starts at zero, so a
        // loose limit here simply means "converges on the first exchange".
        second.add_convergence_measure(0, false, Box::new(AbsoluteConvergenceMeasure::new(10.0).unwrap()));
        first.initialize().unwrap();
        second.initialize().unwrap();

        let second_thread = thread::spawn(move || {
            second.advance().unwrap();
            second
        });
        first.advance().unwrap();
        let second = second_thread.join().unwrap();

        assert_eq!(first.base_state().timesteps, 1);
        assert_eq!(second.base_state().timesteps, 1);
        assert!(first.is_action_required(Action::WriteIterationCheckpoint));
        assert!(second.is_action_required(Action::WriteIterationCheckpoint));
    }

    #[test]
    fn advance_requests_a_checkpoint_read_when_not_converged() {
        let (mut first, mut second) = scheme_pair(Some(5));
        first.add_send_data(0, DenseVector::from_vec(vec![1.0]));
        first.add_receive_data(1, DenseVector::from_vec(vec![0.0]));
        second.add_receive_data(0, DenseVector::from_vec(vec![0.0]));
        second.add_send_data(1, DenseVector::from_vec(vec![999.0]));
        second.add_convergence_measure(0, false, Box::new(AbsoluteConvergenceMeasure::new(1e-12).unwrap()));
        first.initialize().unwrap();
        second.initialize().unwrap();

        let second_thread = thread::spawn(move || {
            second.advance().unwrap();
            second
        });
        first.advance().unwrap();
        let second = second_thread.join().unwrap();

        assert_eq!(first.base_state().timesteps, 0);
        assert!(first.is_action_required(Action::ReadIterationCheckpoint));
        assert!(second.is_action_required(Action::ReadIterationCheckpoint));
    }

    #[test]
    fn extrapolation_order_1_matches_the_worked_example() {
        let mut datum = CoupledData::new(DenseVector::from_vec(vec![3.0]));
        datum.old_values = DenseMatrix::from_col_major(1, 2, vec![0.0, 1.0]);
        let mut send_data = BTreeMap::new();
        send_data.insert(0u32, datum);

        let (link, _unused) = ChannelCommunicator::pair(0, 1);
        let mut scheme =
            CouplingScheme::new(10.0, None, Some(1.0), 10, "A", "B", "B", Box::new(link), Cohort::solo(), None, DtMethod::FixedDt)
                .unwrap();
        scheme.send_data = send_data;
        scheme.extrapolation_order = 1;
        scheme.base.timesteps = 1;
        scheme.extrapolate_data().unwrap();

        let datum = scheme.send_data.get(&0).unwrap();
        assert_eq!(datum.values.get(0), 5.0);
        assert_eq!(datum.old_values.get(0, 1), 3.0);
    }

    #[test]
    fn extrapolation_order_2_matches_the_worked_example() {
        let mut datum = CoupledData::new(DenseVector::from_vec(vec![4.0]));
        datum.old_values = DenseMatrix::from_col_major(1, 3, vec![0.0, 2.0, 1.0]);
        let mut send_data = BTreeMap::new();
        send_data.insert(0u32, datum);

        let (link, _unused) = ChannelCommunicator::pair(0, 1);
        let mut scheme =
            CouplingScheme::new(10.0, None, Some(1.0), 10, "A", "B", "B", Box::new(link), Cohort::solo(), None, DtMethod::FixedDt)
                .unwrap();
        scheme.send_data = send_data;
        scheme.extrapolation_order = 2;
        scheme.base.timesteps = 2;
        scheme.extrapolate_data().unwrap();

        let datum = scheme.send_data.get(&0).unwrap();
        assert!((datum.values.get(0) - 6.5).abs() < 1e-12);
    }

    #[test]
    fn first_participant_sets_dt_publishes_and_second_receives_it() {
        let (link_first, link_second) = ChannelCommunicator::pair(0, 1);
        let mut first = CouplingScheme::new(
            10.0,
            None,
            None,
            10,
            "A",
            "B",
            "A",
            Box::new(link_first),
            Cohort::solo(),
            None,
            DtMethod::FirstParticipantSetsDt,
        )
        .unwrap();
        let mut second = CouplingScheme::new(
            10.0,
            None,
            None,
            10,
            "A",
            "B",
            "B",
            Box::new(link_second),
            Cohort::solo(),
            None,
            DtMethod::FirstParticipantSetsDt,
        )
        .unwrap();
        assert!(first.participant_sets_dt());
        assert!(!second.participant_sets_dt());
        // the receiving side may never set its own dt.
        assert!(second.set_current_dt(0.3).is_err());

        first.set_current_dt(0.3).unwrap();
        first.add_send_data(0, DenseVector::from_vec(vec![1.0]));
        first.add_receive_data(1, DenseVector::from_vec(vec![0.0]));
        second.add_receive_data(0, DenseVector::from_vec(vec![0.0]));
        second.add_send_data(1, DenseVector::from_vec(vec![1.0]));
        second.add_convergence_measure(0, false, Box::new(AbsoluteConvergenceMeasure::new(10.0).unwrap()));
        first.initialize().unwrap();
        second.initialize().unwrap();

        let second_thread = thread::spawn(move || {
            second.advance().unwrap();
            second
        });
        first.advance().unwrap();
        let second = second_thread.join().unwrap();

        assert_eq!(second.current_dt(), 0.3);
    }

    #[test]
    fn check_completeness_rejects_unacknowledged_actions() {
        let (mut first, _second) = scheme_pair(None);
        first.require_action(Action::WriteIterationCheckpoint);
        assert!(first.check_completeness_required_actions().is_err());
        first.fulfilled_action(Action::WriteIterationCheckpoint);
        assert!(first.check_completeness_required_actions().is_ok());
    }
}
