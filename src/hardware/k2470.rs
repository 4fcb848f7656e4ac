//! Keithley 2470 SourceMeter Driver
//!
//! Reference: Keithley 2470 Reference Manual (SCPI command set)
//!
//! Protocol Overview:
//! - Format: SCPI over a raw LAN socket (port 5025)
//! - Terminator: LF (\n)
//! - Every write is verified by draining `:SYSTem:ERRor?`
//! - Query: `READ?` (one current measurement, in amperes)
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect--> Connected --configure--> Configured
//!                               ^                        |
//!                               |                   toggle_output
//!                             reset                      v
//!                               |          OutputEnabled <-> OutputDisabled
//!                               +------ any connected state
//! close: any state --> Disconnected
//! ```
//!
//! Bias voltage and output relay state live on the instrument; `output_enabled()`
//! always asks it rather than trusting the local state.
//!
//! # Example Usage
//!
//! ```no_run
//! use k2470_daq::{ConnectionParams, Keithley2470Driver};
//! use futures::TryStreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let smu = Keithley2470Driver::new(ConnectionParams::new("TCPIP0::192.168.1.50::INSTR", 5000));
//!     smu.connect().await?;
//!
//!     let report = smu.configure().await?;
//!     for (step, record) in report.errors() {
//!         eprintln!("step {step}: {record}");
//!     }
//!
//!     smu.toggle_output(true).await?;
//!     smu.set_bias(10.0).await?;
//!     let readings: Vec<_> = smu.readings(100).try_collect().await?;
//!     println!("{} readings", readings.len());
//!
//!     smu.toggle_output(false).await?;
//!     smu.close().await;
//!     Ok(())
//! }
//! ```

use crate::error::{DaqError, DaqResult};
use crate::hardware::transport::{Connector, Session, SystemConnector};
use crate::measurement::{Reading, READ_QUERY};
use crate::scpi::{CommandChannel, ErrorRecord, WriteReport};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const IDENTITY_QUERY: &str = "*IDN?";
const ABORT: &str = "ABORt";
const RESET: &str = "*RST";
const OUTPUT_QUERY: &str = ":OUTPut?";

/// Largest source voltage magnitude of the 2470.
pub const MAX_SOURCE_VOLTAGE: f64 = 1100.0;

/// Instrument lifecycle as mirrored by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum InstrumentState {
    /// No session.
    #[default]
    Disconnected,
    /// Session open and identified; configuration unknown.
    Connected,
    /// Configuration sequence sent.
    Configured,
    /// Output relay switched on by this driver.
    OutputEnabled,
    /// Output relay switched off by this driver.
    OutputDisabled,
}

const CONNECTED: &[InstrumentState] = &[
    InstrumentState::Connected,
    InstrumentState::Configured,
    InstrumentState::OutputEnabled,
    InstrumentState::OutputDisabled,
];

const SOURCING: &[InstrumentState] = &[
    InstrumentState::Configured,
    InstrumentState::OutputEnabled,
    InstrumentState::OutputDisabled,
];

/// The two values the driver needs from its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// VISA-style resource string.
    pub address: String,
    /// Applies to connecting and to every send/receive.
    pub timeout: Duration,
}

impl ConnectionParams {
    /// Parameters with the timeout given in milliseconds.
    pub fn new(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

/// Values used by [`Keithley2470Driver::configure`].
///
/// Defaults allow up to ~2100 readings/s on the 100 nA range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Integration time in power-line cycles.
    pub nplc: f64,
    /// Automatic reference/zero measurements between readings.
    pub auto_zero: bool,
    /// Measure the sourced voltage instead of reporting the programmed value.
    pub source_readback: bool,
    /// Fixed current measurement range in amperes (disables autorange).
    pub current_range: f64,
    /// Current compliance limit while sourcing voltage, in amperes.
    pub current_limit: f64,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            nplc: 0.1,
            auto_zero: true,
            source_readback: false,
            current_range: 100e-9,
            current_limit: 100e-9,
        }
    }
}

impl MeasurementSettings {
    /// Reject values outside what the instrument accepts.
    pub fn validate(&self) -> DaqResult<()> {
        check_range("nplc", self.nplc, 0.01, 10.0)?;
        check_range("current_range", self.current_range, 1e-9, 1.0)?;
        check_range("current_limit", self.current_limit, 1e-9, 1.05)?;
        Ok(())
    }

    /// The seven configuration commands, in the order they are sent.
    pub fn configure_sequence(&self) -> Vec<String> {
        vec![
            ":SYSTem:POSetup RST".to_string(),
            format!(":SENSe:CURRent:NPLCycles {}", self.nplc),
            format!(":SENSe:CURRent:AZERo:STATe {}", on_off(self.auto_zero)),
            format!(":SOURce:VOLTage:READ:BACK {}", on_off(self.source_readback)),
            format!(":SENSe:CURRent:RANGe {:E}", self.current_range),
            format!(":SOURce:VOLTage:ILIMit {:E}", self.current_limit),
            ":SENSe:AZERo:ONCE".to_string(),
        ]
    }
}

/// Driver-side tuning beyond the connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriverOptions {
    /// Wait after opening the link before the identity query.
    pub settle_after_open: Duration,
    /// Wait after each of the abort and reset commands.
    pub settle_after_reset: Duration,
    /// Values sent by the configuration sequence.
    pub measurement: MeasurementSettings,
}

/// Per-step outcome of [`Keithley2470Driver::configure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigureReport {
    /// One report per step, in order; step numbers start at 1.
    pub steps: Vec<WriteReport>,
}

impl ConfigureReport {
    /// `true` when no step reported instrument errors.
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(WriteReport::is_clean)
    }

    /// Steps that reported instrument errors, with their 1-based step numbers.
    pub fn failed_steps(&self) -> Vec<(usize, &WriteReport)> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, report)| !report.is_clean())
            .map(|(i, report)| (i + 1, report))
            .collect()
    }

    /// Every reported record tagged with the step that produced it.
    pub fn errors(&self) -> Vec<(usize, &ErrorRecord)> {
        self.failed_steps()
            .into_iter()
            .flat_map(|(step, report)| report.errors.iter().map(move |record| (step, record)))
            .collect()
    }

    /// Opt into treating the first flagged step as fatal.
    pub fn ensure_clean(self) -> DaqResult<Self> {
        match self.steps.iter().find(|report| !report.is_clean()) {
            Some(report) => Err(DaqError::InstrumentReported {
                command: report.command.clone(),
                records: report.errors.clone(),
            }),
            None => Ok(self),
        }
    }
}

#[derive(Default)]
struct DriverInner {
    state: InstrumentState,
    channel: Option<CommandChannel>,
    identity: Option<String>,
}

impl DriverInner {
    fn channel(
        &mut self,
        operation: &'static str,
        allowed: &[InstrumentState],
    ) -> DaqResult<&mut CommandChannel> {
        let state = self.state;
        if !allowed.contains(&state) {
            return Err(DaqError::InvalidState { operation, state });
        }
        self.channel
            .as_mut()
            .ok_or(DaqError::InvalidState { operation, state })
    }

    /// Pass `result` through, closing the session first if it says the link is gone.
    async fn check<T>(&mut self, result: DaqResult<T>) -> DaqResult<T> {
        let fatal = matches!(&result, Err(err) if err.is_fatal_to_session());
        if fatal {
            warn!(state = ?self.state, "Link lost; closing session");
            if let Some(mut channel) = self.channel.take() {
                channel.close().await;
            }
            self.identity = None;
            self.state = InstrumentState::Disconnected;
        }
        result
    }
}

/// Driver for the Keithley 2470 SourceMeter.
///
/// All operations take `&self`; the session lives behind an async mutex so at most
/// one command is in flight at a time, whoever the callers are.
pub struct Keithley2470Driver {
    params: ConnectionParams,
    options: DriverOptions,
    connector: Arc<dyn Connector>,
    inner: Mutex<DriverInner>,
}

impl Keithley2470Driver {
    /// Driver for a real instrument.
    pub fn new(params: ConnectionParams) -> Self {
        Self::with_connector(params, Arc::new(SystemConnector))
    }

    /// Driver that opens its link through `connector`.
    pub fn with_connector(params: ConnectionParams, connector: Arc<dyn Connector>) -> Self {
        Self {
            params,
            options: DriverOptions::default(),
            connector,
            inner: Mutex::new(DriverInner::default()),
        }
    }

    /// Replace the default driver options.
    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Address and timeout this driver connects with.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> InstrumentState {
        self.inner.lock().await.state
    }

    /// `*IDN?` reply from the last successful connect.
    pub async fn identity(&self) -> Option<String> {
        self.inner.lock().await.identity.clone()
    }

    /// Open the session and identify the instrument.
    #[instrument(skip(self), fields(address = %self.params.address))]
    pub async fn connect(&self) -> DaqResult<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != InstrumentState::Disconnected {
            return Err(DaqError::InvalidState {
                operation: "connect",
                state: inner.state,
            });
        }

        let session = Session::open(self.connector.as_ref(), &self.params.address, self.params.timeout).await?;
        settle(self.options.settle_after_open).await;

        let mut channel = CommandChannel::new(session);
        let identity = match channel.query(IDENTITY_QUERY).await {
            Ok(identity) if !identity.is_empty() => identity,
            outcome => {
                channel.close().await;
                let reason = match outcome {
                    Err(err) => format!("identity query failed: {err}"),
                    Ok(_) => "empty identity response".to_string(),
                };
                return Err(DaqError::Connection {
                    address: self.params.address.clone(),
                    reason,
                });
            }
        };

        info!(identity = %identity, "Connected to instrument");
        inner.channel = Some(channel);
        inner.identity = Some(identity.clone());
        inner.state = InstrumentState::Connected;
        Ok(identity)
    }

    /// Abort any running measurement and restore factory defaults.
    ///
    /// The driver drops to `Connected` before the commands go out, so a failure
    /// halfway never leaves it claiming a configuration the instrument may have lost.
    /// A lost link closes the session and leaves the driver `Disconnected`.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> DaqResult<Vec<WriteReport>> {
        let mut inner = self.inner.lock().await;
        inner.channel("reset", CONNECTED)?;
        inner.state = InstrumentState::Connected;

        let mut reports = Vec::with_capacity(2);
        for command in [ABORT, RESET] {
            let result = inner.channel("reset", CONNECTED)?.write(command).await;
            reports.push(inner.check(result).await?);
            settle(self.options.settle_after_reset).await;
        }
        info!("Instrument reset");
        Ok(reports)
    }

    /// Run the fixed configuration sequence.
    ///
    /// Not transactional: instrument errors on one step do not stop the next. Every
    /// step's report is returned. A transport failure aborts the sequence and leaves
    /// the driver in `Connected`, or `Disconnected` if the link is gone.
    #[instrument(skip(self))]
    pub async fn configure(&self) -> DaqResult<ConfigureReport> {
        let settings = self.options.measurement;
        let mut inner = self.inner.lock().await;
        inner.channel("configure", &[InstrumentState::Connected])?;
        settings.validate()?;

        let mut steps = Vec::with_capacity(7);
        for command in settings.configure_sequence() {
            let result = inner.channel("configure", &[InstrumentState::Connected])?.write(&command).await;
            steps.push(inner.check(result).await?);
        }
        inner.state = InstrumentState::Configured;

        let report = ConfigureReport { steps };
        if report.is_clean() {
            info!("Instrument configured");
        } else {
            let failed: Vec<usize> = report.failed_steps().iter().map(|(step, _)| *step).collect();
            warn!(failed_steps = ?failed, "Instrument configured with errors");
        }
        Ok(report)
    }

    /// Program the source voltage. Does not touch the output relay.
    #[instrument(skip(self))]
    pub async fn set_bias(&self, volts: f64) -> DaqResult<WriteReport> {
        let mut inner = self.inner.lock().await;
        inner.channel("set_bias", SOURCING)?;
        check_range("bias", volts, -MAX_SOURCE_VOLTAGE, MAX_SOURCE_VOLTAGE)?;
        let result = inner
            .channel("set_bias", SOURCING)?
            .write(&format!(":SOURce:VOLTage {volts:.6}"))
            .await;
        inner.check(result).await
    }

    /// Switch the output relay. Always sent, even if the relay is already in that state.
    #[instrument(skip(self))]
    pub async fn toggle_output(&self, enable: bool) -> DaqResult<WriteReport> {
        let mut inner = self.inner.lock().await;
        let result = inner
            .channel("toggle_output", SOURCING)?
            .write(&format!(":OUTPut {}", on_off(enable)))
            .await;
        let report = inner.check(result).await?;
        inner.state = if enable {
            InstrumentState::OutputEnabled
        } else {
            InstrumentState::OutputDisabled
        };
        Ok(report)
    }

    /// Ask the instrument whether the output relay is on.
    pub async fn output_enabled(&self) -> DaqResult<bool> {
        let mut inner = self.inner.lock().await;
        let result = inner.channel("output_enabled", CONNECTED)?.query(OUTPUT_QUERY).await;
        let reply = inner.check(result).await?;
        match reply.to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            _ => Err(DaqError::Parse {
                command: OUTPUT_QUERY.to_string(),
                response: reply,
            }),
        }
    }

    /// Take one current measurement.
    pub async fn read(&self) -> DaqResult<Reading> {
        let mut inner = self.inner.lock().await;
        let result = inner.channel("read", CONNECTED)?.query(READ_QUERY).await;
        let response = inner.check(result).await?;
        Reading::from_response(&response)
    }

    /// Lazily take up to `count` readings. The stream ends after the first error.
    ///
    /// Each item holds the session only for its own exchange, so other operations
    /// may interleave between readings.
    pub fn readings(&self, count: usize) -> impl Stream<Item = DaqResult<Reading>> + '_ {
        futures::stream::try_unfold(0usize, move |taken| async move {
            if taken >= count {
                return Ok(None);
            }
            let reading = self.read().await?;
            Ok(Some((reading, taken + 1)))
        })
    }

    /// Release the session. Idempotent and safe after any failure.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut channel) = inner.channel.take() {
            channel.close().await;
            info!("Disconnected from instrument");
        }
        inner.identity = None;
        inner.state = InstrumentState::Disconnected;
    }
}

async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> DaqResult<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(DaqError::OutOfRange { name, value, min, max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportFault;
    use crate::hardware::mock::MockInstrument;
    use tracing_test::traced_test;

    fn driver(instrument: &MockInstrument) -> Keithley2470Driver {
        driver_with_timeout(instrument, 5000)
    }

    fn driver_with_timeout(instrument: &MockInstrument, timeout_ms: u64) -> Keithley2470Driver {
        Keithley2470Driver::with_connector(
            ConnectionParams::new("TCPIP::192.0.2.5::INSTR", timeout_ms),
            Arc::new(instrument.clone()),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_configure_logs_failed_steps() {
        let instrument = MockInstrument::new();
        instrument.inject_errors(":SENSe:CURRent:AZERo:STATe ON", &["+1,\"Parameter error\""]);
        let smu = driver(&instrument);
        smu.connect().await.unwrap();

        let report = smu.configure().await.unwrap();

        assert_eq!(report.steps.len(), 7);
        assert_eq!(smu.state().await, InstrumentState::Configured);
        assert!(logs_contain("Instrument configured with errors"));
        assert!(logs_contain("Errors while writing :SENSe:CURRent:AZERo:STATe ON"));
    }

    #[tokio::test]
    async fn test_reset_drops_to_connected_even_on_failure() {
        let instrument = MockInstrument::new();
        let smu = driver_with_timeout(&instrument, 50);
        smu.connect().await.unwrap();
        smu.configure().await.unwrap();
        smu.toggle_output(true).await.unwrap();

        instrument.answer_late(":SYSTem:ERRor?");
        assert!(matches!(
            smu.reset().await,
            Err(DaqError::Transport { fault: TransportFault::Timeout(_), .. })
        ));
        assert_eq!(smu.state().await, InstrumentState::Connected);
        assert_eq!(instrument.close_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lost_link_disconnects() {
        let instrument = MockInstrument::new();
        let smu = driver(&instrument);
        smu.connect().await.unwrap();
        smu.configure().await.unwrap();

        instrument.fail_send_on(":OUTPut ON");
        let err = smu.toggle_output(true).await.unwrap_err();
        assert!(err.is_fatal_to_session());
        assert_eq!(smu.state().await, InstrumentState::Disconnected);
        assert_eq!(smu.identity().await, None);
        assert_eq!(instrument.close_count(), 1);
        assert!(logs_contain("Link lost; closing session"));

        assert!(matches!(
            smu.read().await,
            Err(DaqError::InvalidState { operation: "read", state: InstrumentState::Disconnected })
        ));
        smu.close().await;
        assert_eq!(instrument.close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let instrument = MockInstrument::new();
        let smu = driver(&instrument);
        smu.connect().await.unwrap();
        assert!(matches!(
            smu.connect().await,
            Err(DaqError::InvalidState { operation: "connect", state: InstrumentState::Connected })
        ));
        assert_eq!(instrument.open_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_identity_is_connection_error() {
        let instrument = MockInstrument::new().with_identity("");
        let smu = driver(&instrument);
        assert!(matches!(smu.connect().await, Err(DaqError::Connection { .. })));
        assert_eq!(smu.state().await, InstrumentState::Disconnected);
        assert_eq!(instrument.close_count(), 1);
    }

    #[tokio::test]
    async fn test_bias_out_of_range_sends_nothing() {
        let instrument = MockInstrument::new();
        let smu = driver(&instrument);
        smu.connect().await.unwrap();
        smu.configure().await.unwrap();
        instrument.clear_call_log();

        assert!(matches!(
            smu.set_bias(1500.0).await,
            Err(DaqError::OutOfRange { name: "bias", .. })
        ));
        assert!(smu.set_bias(f64::INFINITY).await.is_err());
        assert!(instrument.call_log().is_empty());

        let report = smu.set_bias(-12.5).await.unwrap();
        assert_eq!(report.command, ":SOURce:VOLTage -12.500000");
        assert_eq!(instrument.bias(), -12.5);
    }

    #[tokio::test]
    async fn test_output_enabled_asks_instrument() {
        let instrument = MockInstrument::new();
        let smu = driver(&instrument);
        smu.connect().await.unwrap();
        smu.configure().await.unwrap();

        assert!(!smu.output_enabled().await.unwrap());
        smu.toggle_output(true).await.unwrap();
        assert!(smu.output_enabled().await.unwrap());
    }

    #[test]
    fn test_default_configure_sequence() {
        assert_eq!(
            MeasurementSettings::default().configure_sequence(),
            vec![
                ":SYSTem:POSetup RST",
                ":SENSe:CURRent:NPLCycles 0.1",
                ":SENSe:CURRent:AZERo:STATe ON",
                ":SOURce:VOLTage:READ:BACK OFF",
                ":SENSe:CURRent:RANGe 1E-7",
                ":SOURce:VOLTage:ILIMit 1E-7",
                ":SENSe:AZERo:ONCE",
            ]
        );
    }

    #[test]
    fn test_custom_settings_sequence() {
        let settings = MeasurementSettings {
            nplc: 1.0,
            auto_zero: false,
            source_readback: true,
            current_range: 1e-6,
            current_limit: 1e-5,
        };
        let sequence = settings.configure_sequence();
        assert_eq!(sequence[1], ":SENSe:CURRent:NPLCycles 1");
        assert_eq!(sequence[2], ":SENSe:CURRent:AZERo:STATe OFF");
        assert_eq!(sequence[3], ":SOURce:VOLTage:READ:BACK ON");
        assert_eq!(sequence[4], ":SENSe:CURRent:RANGe 1E-6");
        assert_eq!(sequence[5], ":SOURce:VOLTage:ILIMit 1E-5");
    }

    #[test]
    fn test_settings_validation() {
        assert!(MeasurementSettings::default().validate().is_ok());

        let bad_nplc = MeasurementSettings {
            nplc: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            bad_nplc.validate(),
            Err(DaqError::OutOfRange { name: "nplc", .. })
        ));

        let bad_limit = MeasurementSettings {
            current_limit: f64::NAN,
            ..Default::default()
        };
        assert!(bad_limit.validate().is_err());
    }

    #[test]
    fn test_configure_report_numbers_steps_from_one() {
        let clean = |command: &str| WriteReport {
            command: command.to_string(),
            errors: vec![],
        };
        let report = ConfigureReport {
            steps: vec![
                clean("a"),
                clean("b"),
                WriteReport {
                    command: "c".to_string(),
                    errors: vec![ErrorRecord::parse("+1,\"Parameter error\"")],
                },
            ],
        };

        assert!(!report.is_clean());
        let errors = report.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 3);
        assert_eq!(errors[0].1.raw(), "+1,\"Parameter error\"");
        assert!(matches!(
            report.ensure_clean(),
            Err(DaqError::InstrumentReported { ref command, .. }) if command == "c"
        ));
    }
}
