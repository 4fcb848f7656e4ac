//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/k2470.toml` (base configuration)
//! 2. Environment variables (prefixed with `K2470_`, sections separated by `__`)
//!
//! # Example
//! ```no_run
//! use k2470_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Instrument: {}", config.instrument.address);
//! # Ok::<(), k2470_daq::DaqError>(())
//! ```

use crate::error::{DaqError, DaqResult};
use crate::hardware::k2470::{ConnectionParams, DriverOptions, MeasurementSettings};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/k2470.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Connection and timing
    pub instrument: InstrumentConfig,
    /// Values sent by `configure`
    pub measurement: MeasurementSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "k2470".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Instrument connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA-style resource string, e.g. `TCPIP0::192.168.1.50::INSTR`
    #[serde(default)]
    pub address: String,
    /// Connect and per-exchange timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Wait after opening the link, in milliseconds
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Wait after each reset command, in milliseconds
    #[serde(default = "default_reset_settle")]
    pub reset_settle_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_ms: default_timeout(),
            settle_ms: default_settle(),
            reset_settle_ms: default_reset_settle(),
        }
    }
}

// Default value functions
fn default_timeout() -> u64 {
    5000
}

fn default_settle() -> u64 {
    2000
}

fn default_reset_settle() -> u64 {
    1000
}

impl AppConfig {
    /// Load configuration from `config/k2470.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `K2470_`.
    /// Example: `K2470_INSTRUMENT__ADDRESS=TCPIP::10.0.0.7::INSTR`
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("K2470_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.address.trim().is_empty() {
            return Err(DaqError::Configuration(
                "instrument.address must not be empty".to_string(),
            ));
        }

        if self.instrument.timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "instrument.timeout_ms must be greater than zero".to_string(),
            ));
        }

        self.measurement.validate()
    }

    /// Address and timeout for [`crate::Keithley2470Driver::new`].
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams::new(self.instrument.address.clone(), self.instrument.timeout_ms)
    }

    /// Settle delays and measurement settings for the driver.
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            settle_after_open: Duration::from_millis(self.instrument.settle_ms),
            settle_after_reset: Duration::from_millis(self.instrument.reset_settle_ms),
            measurement: self.measurement,
        }
    }
}
