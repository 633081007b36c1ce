//! Qubit objects: parameter holders that also know how to measure
//! themselves.
//!
//! A [`Qubit`] groups its parameters into *operations* (e.g. `RO`,
//! `mw_control`). Each operation maps sequencer argument names to qubit
//! parameters, and [`Qubit::get_operation_dict`] resolves those to current
//! values for pulse compilation.

pub mod hamiltonian;
pub mod transmon;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{AppResult, McError};
use crate::instrument::Instrument;
use crate::parameter::{ParamValue, Parameter, Validator};

pub use hamiltonian::{qubit_freq_dac, qubit_freq_flux, transmon_transitions};
pub use transmon::{FindFrequency, FrequencyOverrides, Transmon};

/// `"{operation} {qubit}"` → argument name → value.
pub type OperationDict = BTreeMap<String, BTreeMap<String, ParamValue>>;

/// Parameter holder with named operations.
pub struct Qubit {
    instrument: Instrument,
    msmt_suffix: String,
    operations: BTreeMap<String, BTreeMap<String, String>>,
}

impl Qubit {
    /// Qubit without parameters or operations.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            msmt_suffix: format!("_{}", name),
            instrument: Instrument::new(name),
            operations: BTreeMap::new(),
        }
    }

    /// Qubit name, used in operation keys.
    #[must_use]
    pub fn name(&self) -> &str {
        self.instrument.name()
    }

    /// Appended to measurement labels.
    pub fn msmt_suffix(&self) -> &str {
        &self.msmt_suffix
    }

    /// Parameters of this qubit.
    #[must_use]
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub(crate) fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    /// Operation name → argument name → parameter name.
    pub fn operations(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.operations
    }

    /// Register an operation with no arguments yet. Re-adding clears it.
    pub fn add_operation(&mut self, operation: &str) {
        self.operations.insert(operation.to_string(), BTreeMap::new());
    }

    /// Use an existing parameter as `argument` of `operation`.
    pub fn link_param_to_operation(
        &mut self,
        operation: &str,
        parameter: &str,
        argument: &str,
    ) -> AppResult<()> {
        if !self.instrument.has_parameter(parameter) {
            return Err(McError::UnknownParameter(format!(
                "{} needs to be added first",
                parameter
            )));
        }
        let args = self
            .operations
            .get_mut(operation)
            .ok_or_else(|| McError::UnknownOperation(operation.to_string()))?;
        args.insert(argument.to_string(), parameter.to_string());
        Ok(())
    }

    /// Create a parameter and link it to `operation` in one step.
    pub fn add_pulse_parameter(
        &mut self,
        operation: &str,
        parameter: &str,
        argument: &str,
        initial: impl Into<ParamValue>,
        validator: Validator,
    ) -> AppResult<Arc<Parameter>> {
        if self.instrument.has_parameter(parameter) {
            return Err(McError::DuplicateParameter(parameter.to_string()));
        }
        if !self.operations.contains_key(operation) {
            return Err(McError::UnknownOperation(operation.to_string()));
        }
        let handle = self
            .instrument
            .add_parameter(Parameter::new(parameter, initial).with_validator(validator))?;
        self.link_param_to_operation(operation, parameter, argument)?;
        Ok(handle)
    }

    /// Current argument values of every operation, keyed `"{op} {qubit}"`.
    pub fn get_operation_dict(&self) -> AppResult<OperationDict> {
        let mut dict = OperationDict::new();
        for (operation, args) in &self.operations {
            let mut entry = BTreeMap::new();
            entry.insert(
                "target_qubit".to_string(),
                ParamValue::Str(self.name().to_string()),
            );
            for (argument, parameter) in args {
                entry.insert(argument.clone(), self.instrument.get(parameter)?);
            }
            dict.insert(format!("{} {}", operation, self.name()), entry);
        }
        Ok(dict)
    }
}
