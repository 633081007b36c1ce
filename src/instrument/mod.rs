//! Instruments as named parameter holders, and the station grouping them.
//!
//! An [`Instrument`] owns a set of shared [`Parameter`]s. Cloning an
//! instrument clones the handles, not the values, so a [`Station`] built
//! from clones always snapshots live values.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{AppResult, McError};
use crate::parameter::{ParamValue, Parameter};

pub mod dummy;
pub mod duplexer;
pub mod transport;

pub use dummy::DummyParHolder;
pub use duplexer::Duplexer;
pub use transport::{MockTransport, TcpTransport, Transport};

/// Named collection of parameters.
#[derive(Clone, Debug)]
pub struct Instrument {
    name: String,
    parameters: BTreeMap<String, Arc<Parameter>>,
}

impl Instrument {
    /// Empty instrument.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Instrument name, also its key in a station.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a parameter and return its shared handle.
    ///
    /// # Errors
    ///
    /// `McError::DuplicateParameter` if the name is already taken.
    pub fn add_parameter(&mut self, parameter: Parameter) -> AppResult<Arc<Parameter>> {
        let name = parameter.name().to_string();
        if self.parameters.contains_key(&name) {
            return Err(McError::DuplicateParameter(name));
        }
        let handle = Arc::new(parameter);
        self.parameters.insert(name, handle.clone());
        Ok(handle)
    }

    /// True when `name` is registered.
    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Shared handle to a parameter.
    pub fn parameter(&self, name: &str) -> AppResult<Arc<Parameter>> {
        self.parameters
            .get(name)
            .cloned()
            .ok_or_else(|| McError::UnknownParameter(format!("{}.{}", self.name, name)))
    }

    /// Cached value of a parameter.
    pub fn get(&self, name: &str) -> AppResult<ParamValue> {
        Ok(self.parameter(name)?.get())
    }

    /// Cached value as a float, `None` when unset or non-numeric.
    pub fn get_f64(&self, name: &str) -> AppResult<Option<f64>> {
        Ok(self.get(name)?.as_f64())
    }

    /// Validate and set a parameter.
    pub async fn set(&self, name: &str, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        self.parameter(name)?.set(value).await
    }

    /// Parameter names in sorted order.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.keys().map(String::as_str).collect()
    }

    /// JSON snapshot of every parameter's cached value and unit.
    pub fn snapshot(&self) -> Value {
        let parameters: Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    json!({
                        "value": p.get(),
                        "unit": p.unit(),
                        "label": p.label(),
                    }),
                )
            })
            .collect();
        json!({ "name": self.name, "parameters": parameters })
    }
}

/// Collection of instruments whose state is saved with every dataset.
#[derive(Clone, Debug, Default)]
pub struct Station {
    components: BTreeMap<String, Instrument>,
}

impl Station {
    /// Station without components.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instrument (a clone sharing its parameters).
    pub fn add_component(&mut self, instrument: &Instrument) -> AppResult<()> {
        if self.components.contains_key(instrument.name()) {
            return Err(McError::Configuration(format!(
                "Station already has a component named '{}'",
                instrument.name()
            )));
        }
        self.components
            .insert(instrument.name().to_string(), instrument.clone());
        Ok(())
    }

    /// Instrument registered under `name`.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&Instrument> {
        self.components.get(name)
    }

    /// Number of instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True when no instrument was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Snapshot of every instrument, keyed by name.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let instruments: Map<String, Value> = self
            .components
            .iter()
            .map(|(name, inst)| (name.clone(), inst.snapshot()))
            .collect();
        json!({ "instruments": instruments })
    }
}
