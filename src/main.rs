//! CLI Entry Point for k2470
//!
//! Bench tool for a Keithley 2470 on the LAN:
//! - `identify`: connect and print the identity string
//! - `configure`: reset, run the configuration sequence and print the per-step error report
//! - `acquire`: bias the device under test, take N current readings and print statistics
//!
//! Results are printed to stdout as JSON; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! k2470 --config config/k2470.toml acquire --bias 10 --samples 500
//! K2470_INSTRUMENT__ADDRESS=TCPIP::192.168.1.50::INSTR k2470 identify
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use k2470_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use k2470_daq::measurement::{Reading, Summary};
use k2470_daq::{logging, DaqResult, Keithley2470Driver};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "k2470")]
#[command(about = "Keithley 2470 source/measure bench tool", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Resource string, overrides the configured address
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print the instrument identity
    Identify,

    /// Reset and configure the instrument, then report instrument errors per step
    Configure,

    /// Apply a bias and collect current readings
    Acquire {
        /// Source voltage in volts
        #[arg(long, allow_hyphen_values = true)]
        bias: f64,

        /// Number of readings
        #[arg(long, default_value = "100")]
        samples: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(address) = cli.address {
        config.instrument.address = address;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let driver = Keithley2470Driver::new(config.connection_params()).with_options(config.driver_options());

    let result = match cli.command {
        Commands::Identify => identify(&driver).await,
        Commands::Configure => configure(&driver).await,
        Commands::Acquire { bias, samples } => acquire(&driver, bias, samples).await,
    };

    driver.close().await;
    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn identify(driver: &Keithley2470Driver) -> Result<serde_json::Value> {
    let identity = driver.connect().await?;
    Ok(json!({
        "address": driver.params().address,
        "identity": identity,
    }))
}

async fn configure(driver: &Keithley2470Driver) -> Result<serde_json::Value> {
    driver.connect().await?;
    let reset = driver.reset().await?;
    let report = driver.configure().await?;

    let errors: Vec<_> = report
        .errors()
        .into_iter()
        .map(|(step, record)| json!({ "step": step, "error": record.raw() }))
        .collect();

    Ok(json!({
        "reset": reset,
        "steps": report.steps,
        "errors": errors,
        "state": driver.state().await,
    }))
}

async fn acquire(driver: &Keithley2470Driver, bias: f64, samples: usize) -> Result<serde_json::Value> {
    driver.connect().await?;
    driver.reset().await?;
    let report = driver.configure().await?;
    if !report.is_clean() {
        warn!(errors = report.errors().len(), "Configuration reported instrument errors");
    }

    driver.toggle_output(true).await?;
    let collected = bias_and_collect(driver, bias, samples).await;
    // Always switch the output off again, even after a failed acquisition.
    let switched_off = driver.toggle_output(false).await;
    let readings = collected?;
    switched_off?;

    let summary = Summary::from_readings(&readings);
    Ok(json!({
        "bias_volts": bias,
        "count": readings.len(),
        "mean_na": summary.map(|s| s.mean * 1e9),
        "std_dev_na": summary.map(|s| s.std_dev * 1e9),
        "min_na": summary.map(|s| s.min * 1e9),
        "max_na": summary.map(|s| s.max * 1e9),
    }))
}

async fn bias_and_collect(driver: &Keithley2470Driver, bias: f64, samples: usize) -> DaqResult<Vec<Reading>> {
    driver.set_bias(bias).await?;
    info!(bias, samples, "Acquiring");
    driver.readings(samples).try_collect().await
}
