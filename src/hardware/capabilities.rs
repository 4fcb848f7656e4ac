//! Atomic Hardware Capabilities
//!
//! Fine-grained traits for what a source/measure unit can do, so acquisition code can
//! be written against the capability instead of a concrete driver:
//!
//! - A picoammeter implements: `Readable`
//! - A voltage source implements: `BiasSource + OutputSwitch`
//! - A source/measure unit implements all three
//!
//! Each capability trait is async, `Send + Sync`, and reports failures as
//! `anyhow::Result`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn bias_and_sample<D>(device: &D, volts: f64, samples: usize) -> Result<Vec<f64>>
//! where
//!     D: BiasSource + OutputSwitch + Readable,
//! {
//!     device.set_output(true).await?;
//!     device.set_bias(volts).await?;
//!     let mut currents = Vec::with_capacity(samples);
//!     for _ in 0..samples {
//!         currents.push(device.read().await?);
//!     }
//!     device.set_output(false).await?;
//!     Ok(currents)
//! }
//! ```

use crate::hardware::k2470::Keithley2470Driver;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (ammeters, power meters, voltmeters).
///
/// # Contract
/// - `read()` performs one measurement and returns its value
/// - Units are device-specific (document in implementation)
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    async fn read(&self) -> Result<f64>;
}

/// Capability: Voltage Source
///
/// Programming the level does not switch the output on or off.
#[async_trait]
pub trait BiasSource: Send + Sync {
    /// Set the source level in volts.
    async fn set_bias(&self, volts: f64) -> Result<()>;
}

/// Capability: Output Relay
#[async_trait]
pub trait OutputSwitch: Send + Sync {
    /// Connect (`true`) or disconnect (`false`) the output.
    async fn set_output(&self, enabled: bool) -> Result<()>;

    /// Relay state as reported by the device.
    async fn is_output_enabled(&self) -> Result<bool>;
}

/// Reads measured current in amperes.
#[async_trait]
impl Readable for Keithley2470Driver {
    async fn read(&self) -> Result<f64> {
        Ok(Keithley2470Driver::read(self).await?.amperes)
    }
}

/// Instrument-reported errors from the write are treated as failures here.
#[async_trait]
impl BiasSource for Keithley2470Driver {
    async fn set_bias(&self, volts: f64) -> Result<()> {
        Keithley2470Driver::set_bias(self, volts).await?.ensure_clean()?;
        Ok(())
    }
}

#[async_trait]
impl OutputSwitch for Keithley2470Driver {
    async fn set_output(&self, enabled: bool) -> Result<()> {
        self.toggle_output(enabled).await?.ensure_clean()?;
        Ok(())
    }

    async fn is_output_enabled(&self) -> Result<bool> {
        Ok(self.output_enabled().await?)
    }
}
