//! Parameter - declarative instrument parameter management
//!
//! A `Parameter` keeps the last known value of an instrument setting and
//! synchronizes it with:
//! - Subscribers (via a `tokio::sync::watch` channel)
//! - Hardware devices (via async write/read callbacks)
//!
//! Parameters without hardware callbacks behave as manual parameters: they
//! just hold a validated value. Sweep functions and detectors wrap
//! parameters to move and read them during a measurement.
//!
//! # Example
//!
//! ```rust,ignore
//! use cqed_mc::parameter::{Parameter, Validator};
//!
//! let amp = Parameter::new("RO_amp", 0.1)
//!     .with_unit("V")
//!     .with_validator(Validator::numbers(0.0, 1.0))
//!     .with_hardware_write(move |val| {
//!         let awg = awg.clone();
//!         Box::pin(async move { awg.set_amplitude(val).await })
//!     });
//!
//! // Validates, writes to hardware, notifies subscribers
//! amp.set(0.25).await?;
//! ```

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{AppResult, McError};

// =============================================================================
// ParamValue
// =============================================================================

/// Dynamically typed parameter value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// No value yet.
    #[default]
    None,
    /// Boolean flag.
    Bool(bool),
    /// Integer, e.g. a sample count.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String, e.g. an enum choice.
    Str(String),
}

impl ParamValue {
    /// Numeric view; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer view; floats are accepted only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for [`ParamValue::None`].
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, ParamValue::None)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::None => write!(f, "None"),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParamValue::None, Into::into)
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Value constraints checked on every `set()`.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Validator {
    /// Accept everything, including `None`.
    #[default]
    Anything,
    /// Any finite number within the optional inclusive bounds.
    Numbers {
        /// Inclusive lower bound.
        min: Option<f64>,
        /// Inclusive upper bound.
        max: Option<f64>,
    },
    /// Integers within the optional inclusive bounds.
    Ints {
        /// Inclusive lower bound.
        min: Option<i64>,
        /// Inclusive upper bound.
        max: Option<i64>,
    },
    /// One of a fixed set of values.
    Enum(Vec<ParamValue>),
    /// Any string.
    Strings,
}

impl Validator {
    /// Bounded numeric validator.
    pub fn numbers(min: f64, max: f64) -> Self {
        Validator::Numbers {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Unbounded numeric validator.
    pub fn any_number() -> Self {
        Validator::Numbers {
            min: None,
            max: None,
        }
    }

    /// Unbounded integer validator.
    pub fn ints() -> Self {
        Validator::Ints {
            min: None,
            max: None,
        }
    }

    /// Enum validator from anything convertible to `ParamValue`.
    pub fn one_of<T: Into<ParamValue>>(choices: impl IntoIterator<Item = T>) -> Self {
        Validator::Enum(choices.into_iter().map(Into::into).collect())
    }

    /// Check `value` against this validator.
    pub fn validate(&self, parameter: &str, value: &ParamValue) -> AppResult<()> {
        let reject = |reason: String| McError::InvalidValue {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason,
        };

        match self {
            Validator::Anything => Ok(()),

            Validator::Numbers { min, max } => {
                let v = value
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| reject("expected a finite number".to_string()))?;
                if let Some(min) = min {
                    if v < *min {
                        return Err(reject(format!("must be >= {}", min)));
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        return Err(reject(format!("must be <= {}", max)));
                    }
                }
                Ok(())
            }

            Validator::Ints { min, max } => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| reject("expected an integer".to_string()))?;
                if let Some(min) = min {
                    if v < *min {
                        return Err(reject(format!("must be >= {}", min)));
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        return Err(reject(format!("must be <= {}", max)));
                    }
                }
                Ok(())
            }

            Validator::Enum(choices) => {
                if choices.iter().any(|c| c == value) {
                    Ok(())
                } else {
                    let names: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                    Err(reject(format!("must be one of [{}]", names.join(", "))))
                }
            }

            Validator::Strings => match value {
                ParamValue::Str(_) => Ok(()),
                _ => Err(reject("expected a string".to_string())),
            },
        }
    }
}

// =============================================================================
// Parameter
// =============================================================================

/// Async hardware write callback.
pub type HardwareWriter =
    Arc<dyn Fn(ParamValue) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Async hardware read callback.
pub type HardwareReader =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<ParamValue>> + Send + Sync>;

/// Named, validated value with optional hardware synchronization.
///
/// ```text
/// Parameter
///   ├─ value: watch::Sender<ParamValue>   (cache + subscriptions)
///   ├─ validator: Validator               (checked on set)
///   ├─ hardware_writer: Option<F>         (writes to device)
///   └─ hardware_reader: Option<F>         (reads from device)
/// ```
pub struct Parameter {
    name: String,
    label: String,
    unit: String,
    docstring: Option<String>,
    validator: Validator,
    read_only: bool,
    value: watch::Sender<ParamValue>,
    hardware_writer: Option<HardwareWriter>,
    hardware_reader: Option<HardwareReader>,
}

impl Parameter {
    /// Create a manual parameter holding `initial`.
    ///
    /// The initial value is not validated, so `None` is a legal starting
    /// point for parameters that are filled in later.
    pub fn new(name: impl Into<String>, initial: impl Into<ParamValue>) -> Self {
        let name = name.into();
        let (value, _) = watch::channel(initial.into());
        Self {
            label: name.clone(),
            name,
            unit: String::new(),
            docstring: None,
            validator: Validator::Anything,
            read_only: false,
            value,
            hardware_writer: None,
            hardware_reader: None,
        }
    }

    /// Human readable label; defaults to the name.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Unit shown in column headers.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Free-text description.
    pub fn with_docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = Some(docstring.into());
        self
    }

    /// Validator checked on every `set()`.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Reject `set()`; the value can only change through the hardware reader.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Connect hardware write function
    ///
    /// `set()` writes to hardware before updating the cached value. If the
    /// write fails, the cached value is left untouched.
    pub fn with_hardware_write(
        mut self,
        writer: impl Fn(ParamValue) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.hardware_writer = Some(Arc::new(writer));
        self
    }

    /// Connect hardware read function used by `get_latest()`.
    pub fn with_hardware_read(
        mut self,
        reader: impl Fn() -> BoxFuture<'static, anyhow::Result<ParamValue>> + Send + Sync + 'static,
    ) -> Self {
        self.hardware_reader = Some(Arc::new(reader));
        self
    }

    /// Unique name within its instrument.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Unit, empty when dimensionless.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Description set with `with_docstring`.
    #[must_use]
    pub fn docstring(&self) -> Option<&str> {
        self.docstring.as_deref()
    }

    /// Validator applied on `set()`.
    #[must_use]
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// True when `set()` is rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Last known value (no hardware access).
    pub fn get(&self) -> ParamValue {
        self.value.borrow().clone()
    }

    /// Read from hardware when a reader is connected, otherwise the cache.
    pub async fn get_latest(&self) -> anyhow::Result<ParamValue> {
        match &self.hardware_reader {
            Some(reader) => {
                let value = reader().await?;
                self.value.send_replace(value.clone());
                Ok(value)
            }
            None => Ok(self.get()),
        }
    }

    /// Set value (validates, writes to hardware if connected, notifies subscribers)
    pub async fn set(&self, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        let value = value.into();
        if self.read_only {
            return Err(McError::ReadOnly(self.name.clone()).into());
        }
        self.validator.validate(&self.name, &value)?;

        if let Some(writer) = &self.hardware_writer {
            writer(value.clone()).await?;
        }

        tracing::trace!(parameter = %self.name, value = %value, "parameter set");
        self.value.send_replace(value);
        Ok(())
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<ParamValue> {
        self.value.subscribe()
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("value", &self.get())
            .field("validator", &self.validator)
            .finish()
    }
}
