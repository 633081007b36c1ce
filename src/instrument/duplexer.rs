//! Driver for the QuTech duplexer (TNO).
//!
//! The duplexer routes `n_inputs` signals to `n_outputs` outputs. Every
//! input/output pair has a switch, a phase DAC and an attenuation DAC. The
//! device only accepts set commands over a raw SCPI socket; nothing can be
//! queried back, so the parameters below cache the last value written.
//!
//! ## Commands
//!
//! ```text
//! ch:in{i}:out{j}:sw {ON|OFF|EXT} \n
//! ch:in{i}:out{j}:ph: {mode} {value} \n
//! ch:in{i}:out{j}:att: {mode} {value} \n
//! ```
//!
//! `mode` is `raw` or `cal`; only raw DAC values are supported by the
//! firmware.

use futures::future::{BoxFuture, FutureExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::transport::{TcpTransport, Transport};
use super::Instrument;
use crate::error::{AppResult, McError};
use crate::parameter::{ParamValue, Parameter, Validator};
use crate::retry::RetryPolicy;

/// Full scale of the phase and attenuation DACs.
pub const DAC_MAX: f64 = 65536.0;

/// DAC steps per dB of attenuation.
const CAL_SLOPE: f64 = 2048.0;

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Channel layout and timing of a duplexer.
#[derive(Clone, Debug)]
pub struct DuplexerConfig {
    /// Number of inputs, numbered from 1.
    pub n_inputs: usize,
    /// Number of outputs, numbered from 1.
    pub n_outputs: usize,
    /// Pause after each command; the firmware drops commands sent faster.
    pub command_pause: Duration,
}

impl Default for DuplexerConfig {
    fn default() -> Self {
        Self {
            n_inputs: 4,
            n_outputs: 2,
            command_pause: Duration::from_millis(100),
        }
    }
}

/// Duplexer driver exposing one parameter per channel setting.
pub struct Duplexer {
    instrument: Instrument,
    calibration: Vec<f64>,
    config: DuplexerConfig,
}

impl Duplexer {
    /// Build a duplexer on top of an existing transport.
    ///
    /// `calibration` is the normalized gain per attenuation DAC value; it may
    /// be empty if `calculate_attenuation` is never used.
    pub fn new(
        name: impl Into<String>,
        transport: impl Transport + 'static,
        config: DuplexerConfig,
        calibration: Vec<f64>,
    ) -> AppResult<Self> {
        let boxed: Box<dyn Transport> = Box::new(transport);
        let transport: SharedTransport = Arc::new(Mutex::new(boxed));
        let mut instrument = Instrument::new(name);

        let mode = instrument.add_parameter(
            Parameter::new("mode", "raw")
                .with_label("Operating mode")
                .with_validator(Validator::one_of(["raw", "cal"])),
        )?;

        for inp in 1..=config.n_inputs {
            for outp in 1..=config.n_outputs {
                let prefix = format!("ch:in{}:out{}", inp, outp);

                instrument.add_parameter(
                    Parameter::new(format!("in{}_out{}_switch", inp, outp), ParamValue::None)
                        .with_validator(Validator::one_of(["ON", "OFF", "EXT"]))
                        .with_hardware_write(command_writer(
                            transport.clone(),
                            config.command_pause,
                            format!("{}:sw", prefix),
                            None,
                        )),
                )?;

                instrument.add_parameter(
                    Parameter::new(format!("in{}_out{}_phase", inp, outp), ParamValue::None)
                        .with_validator(Validator::numbers(0.0, DAC_MAX))
                        .with_hardware_write(command_writer(
                            transport.clone(),
                            config.command_pause,
                            format!("{}:ph:", prefix),
                            Some(mode.clone()),
                        )),
                )?;

                instrument.add_parameter(
                    Parameter::new(
                        format!("in{}_out{}_attenuation", inp, outp),
                        ParamValue::None,
                    )
                    .with_validator(Validator::numbers(0.0, DAC_MAX))
                    .with_hardware_write(command_writer(
                        transport.clone(),
                        config.command_pause,
                        format!("{}:att:", prefix),
                        Some(mode.clone()),
                    )),
                )?;
            }
        }

        tracing::info!(
            name = instrument.name(),
            inputs = config.n_inputs,
            outputs = config.n_outputs,
            "duplexer initialized"
        );

        Ok(Self {
            instrument,
            calibration,
            config,
        })
    }

    /// Connect over TCP. `address` is a VISA-style `TCPIP0::<host>` string.
    pub async fn connect(
        name: impl Into<String>,
        address: &str,
        config: DuplexerConfig,
        calibration: Vec<f64>,
    ) -> anyhow::Result<Self> {
        let resource = format!("{}::{}::SOCKET", address, super::transport::SCPI_SOCKET_PORT);
        let transport =
            TcpTransport::connect(&resource, Duration::from_secs(5), &RetryPolicy::default()).await?;
        Ok(Self::new(name, transport, config, calibration)?)
    }

    /// Switch, phase and attenuation parameters of every pair.
    #[must_use]
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Set the switch of one pair to `ON`, `OFF` or `EXT`.
    pub async fn set_switch(&self, input: usize, output: usize, state: &str) -> anyhow::Result<()> {
        self.instrument
            .set(&format!("in{}_out{}_switch", input, output), state)
            .await
    }

    /// Set the raw phase DAC of one pair.
    pub async fn set_phase(&self, input: usize, output: usize, value: f64) -> anyhow::Result<()> {
        self.instrument
            .set(&format!("in{}_out{}_phase", input, output), value)
            .await
    }

    /// Set the raw attenuation DAC of one pair.
    pub async fn set_attenuation(&self, input: usize, output: usize, value: f64) -> anyhow::Result<()> {
        self.instrument
            .set(&format!("in{}_out{}_attenuation", input, output), value)
            .await
    }

    /// Apply `set_switch` to every pair.
    pub async fn set_all_switches_to(&self, state: &str) -> anyhow::Result<()> {
        for (inp, outp) in self.channel_pairs() {
            self.set_switch(inp, outp, state).await?;
        }
        Ok(())
    }

    /// Apply `set_phase` to every pair.
    pub async fn set_all_phases_to(&self, value: f64) -> anyhow::Result<()> {
        for (inp, outp) in self.channel_pairs() {
            self.set_phase(inp, outp, value).await?;
        }
        Ok(())
    }

    /// Apply `set_attenuation` to every pair.
    pub async fn set_all_attenuations_to(&self, value: f64) -> anyhow::Result<()> {
        for (inp, outp) in self.channel_pairs() {
            self.set_attenuation(inp, outp, value).await?;
        }
        Ok(())
    }

    fn channel_pairs(&self) -> Vec<(usize, usize)> {
        (1..=self.config.n_inputs)
            .flat_map(|i| (1..=self.config.n_outputs).map(move |o| (i, o)))
            .collect()
    }

    /// DAC increment that scales the output power by `scaling_factor`.
    #[must_use]
    pub fn get_scaling_increment(scaling_factor: f64) -> f64 {
        CAL_SLOPE * 10.0 * scaling_factor.log10()
    }

    /// DAC value whose calibrated gain is closest to the current gain times
    /// `scaling_factor`.
    pub fn calculate_attenuation(&self, current_dac_value: usize, scaling_factor: f64) -> AppResult<usize> {
        let last = self
            .calibration
            .len()
            .checked_sub(1)
            .ok_or_else(|| McError::Instrument("Duplexer has no calibration data".to_string()))?;

        let index = if current_dac_value > last {
            tracing::warn!(
                current_dac_value,
                max = last,
                "attenuation DAC value outside calibration range, clamping"
            );
            last
        } else {
            current_dac_value
        };

        let target = self.calibration[index] * scaling_factor;
        let best = self
            .calibration
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
            .map(|(i, _)| i)
            .unwrap_or(index);
        Ok(best)
    }

    /// Normalized gain per attenuation DAC value.
    #[must_use]
    pub fn calibration(&self) -> &[f64] {
        &self.calibration
    }
}

/// Read a calibration table: one normalized gain per line, `#` comments allowed.
pub fn load_calibration(path: impl AsRef<Path>) -> AppResult<Vec<f64>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<f64>().map_err(|e| {
                McError::Instrument(format!(
                    "Invalid calibration entry '{}' in {}: {}",
                    line,
                    path.display(),
                    e
                ))
            })
        })
        .collect()
}

/// Hardware writer sending `{prefix} {value} \n`, with the operating mode
/// inserted before the value when `mode` is given.
fn command_writer(
    transport: SharedTransport,
    pause: Duration,
    prefix: String,
    mode: Option<Arc<Parameter>>,
) -> impl Fn(ParamValue) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
    move |value| {
        let transport = transport.clone();
        let prefix = prefix.clone();
        let mode = mode.clone();
        async move {
            let argument = match &mode {
                Some(mode) => mode_set_parser(&mode.get(), &value)?,
                None => value.to_string(),
            };
            let command = format!("{} {} \n", prefix, argument);
            transport.lock().await.write(&command).await?;
            if !pause.is_zero() {
                sleep(pause).await;
            }
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    }
}

fn mode_set_parser(mode: &ParamValue, value: &ParamValue) -> AppResult<String> {
    match mode.as_str() {
        Some("raw") => Ok(format!("raw {}", value)),
        Some("cal") => Err(McError::NotImplemented(
            "calibrated mode is not supported by the duplexer firmware".to_string(),
        )),
        _ => Err(McError::Instrument(format!("Unknown duplexer mode {}", mode))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockTransport;
    use std::io::Write;

    fn duplexer(mock: &MockTransport, calibration: Vec<f64>) -> Duplexer {
        let config = DuplexerConfig {
            command_pause: Duration::ZERO,
            ..Default::default()
        };
        Duplexer::new("dux", mock.clone(), config, calibration).unwrap()
    }

    #[tokio::test]
    async fn test_parameters_for_every_channel_pair() {
        let mock = MockTransport::new();
        let dux = duplexer(&mock, vec![]);
        // mode + 3 per pair
        assert_eq!(dux.instrument().parameter_names().len(), 1 + 3 * 4 * 2);
        assert!(dux.instrument().has_parameter("in4_out2_attenuation"));
        assert!(!dux.instrument().has_parameter("in5_out1_switch"));
    }

    #[tokio::test]
    async fn test_switch_phase_attenuation_commands() {
        let mock = MockTransport::new();
        let dux = duplexer(&mock, vec![]);

        dux.set_switch(1, 2, "ON").await.unwrap();
        dux.set_phase(3, 1, 1200.0).await.unwrap();
        dux.set_attenuation(2, 2, 30000.0).await.unwrap();

        assert_eq!(
            mock.sent().await,
            vec![
                "ch:in1:out2:sw ON \n",
                "ch:in3:out1:ph: raw 1200 \n",
                "ch:in2:out2:att: raw 30000 \n",
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_values_never_reach_hardware() {
        let mock = MockTransport::new();
        let dux = duplexer(&mock, vec![]);

        assert!(dux.set_switch(1, 1, "MAYBE").await.is_err());
        assert!(dux.set_phase(1, 1, 70000.0).await.is_err());
        assert!(mock.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_cal_mode_not_implemented() {
        let mock = MockTransport::new();
        let dux = duplexer(&mock, vec![]);
        dux.instrument().set("mode", "cal").await.unwrap();

        let err = dux.set_attenuation(1, 1, 10.0).await.unwrap_err();
        assert!(err.to_string().contains("Not implemented"));
        // Switch commands carry no mode and still work
        dux.set_switch(1, 1, "OFF").await.unwrap();
        assert_eq!(mock.sent().await, vec!["ch:in1:out1:sw OFF \n"]);
    }

    #[tokio::test]
    async fn test_set_all_switches() {
        let mock = MockTransport::new();
        let dux = duplexer(&mock, vec![]);
        dux.set_all_switches_to("EXT").await.unwrap();

        let sent = mock.sent().await;
        assert_eq!(sent.len(), 8);
        assert_eq!(sent[0], "ch:in1:out1:sw EXT \n");
        assert_eq!(sent[7], "ch:in4:out2:sw EXT \n");
        assert_eq!(
            dux.instrument().get("in3_out2_switch").unwrap(),
            ParamValue::from("EXT")
        );
    }

    #[test]
    fn test_scaling_increment() {
        assert_eq!(Duplexer::get_scaling_increment(1.0), 0.0);
        assert!((Duplexer::get_scaling_increment(10.0) - 20480.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_calculate_attenuation() {
        let mock = MockTransport::new();
        let cal = vec![1.0, 0.8, 0.6, 0.4, 0.2, 0.0];
        let dux = duplexer(&mock, cal);

        // Halving the gain at index 1 (0.8) lands on 0.4
        assert_eq!(dux.calculate_attenuation(1, 0.5).unwrap(), 3);
        // Out of range clamps to the last entry
        assert_eq!(dux.calculate_attenuation(99, 1.0).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_calculate_attenuation_without_calibration() {
        let mock = MockTransport::new();
        let dux = duplexer(&mock, vec![]);
        assert!(dux.calculate_attenuation(0, 1.0).is_err());
    }

    #[test]
    fn test_load_calibration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# normalized gain\n1.0\n0.5\n\n0.25").unwrap();
        assert_eq!(load_calibration(file.path()).unwrap(), vec![1.0, 0.5, 0.25]);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "1.0\nabc").unwrap();
        assert!(load_calibration(bad.path()).is_err());
    }
}
