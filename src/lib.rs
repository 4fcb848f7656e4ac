//! # Keithley 2470 DAQ Library
//!
//! This crate drives a Keithley 2470 SourceMeter (programmable voltage source and
//! picoammeter) over its SCPI command/response protocol. Every command sent to the
//! instrument is either a *verified write* (followed by an error-queue drain) or a
//! *diagnostic query* (which drains the error queue when the exchange fails), so
//! instrument-reported problems are always surfaced to the caller as data.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: The link layer and the instrument itself. `transport` owns the
//!   [`Session`](hardware::transport::Session) and the `Transport`/`Connector` traits,
//!   `address` parses VISA-style resource strings, `tcp` is the raw-socket link,
//!   `mock` is a scripted instrument for tests, and `k2470` is the driver state machine.
//!   `capabilities` exposes the driver through small capability traits.
//! - **`scpi`**: Protocol correctness. `command` models outbound commands,
//!   `error_queue` implements the bounded `:SYSTem:ERRor?` drain, and `channel`
//!   provides verified writes and diagnostic queries.
//! - **`measurement`**: `Reading` samples, ASCII value parsing and acquisition summaries.
//! - **`error`**: The `DaqError` taxonomy shared by every layer.
//! - **`config`**: Figment-based loading of connection and measurement settings.
//! - **`logging`**: `tracing-subscriber` initialisation.

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod scpi;

pub use error::{DaqError, DaqResult};
pub use hardware::k2470::{
    ConnectionParams, DriverOptions, InstrumentState, Keithley2470Driver, MeasurementSettings,
};
pub use measurement::Reading;
pub use scpi::{ErrorRecord, WriteReport};
