//! Current readings.
//!
//! The instrument paces acquisition itself: each `READ?` triggers one measurement
//! whose duration follows the configured integration time (about 6 ms at 0.1 NPLC),
//! so the driver has no rate control of its own. A stream of readings is simply
//! repeated pulls; see [`Keithley2470Driver::readings`](crate::Keithley2470Driver::readings).

use crate::error::{DaqError, DaqResult};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Measurement query.
pub const READ_QUERY: &str = "READ?";

/// One current sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    /// Measured current in amperes.
    pub amperes: f64,
    /// Host time at which the response was parsed.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Reading stamped with the current time.
    pub fn new(amperes: f64) -> Self {
        Self {
            amperes,
            timestamp: Utc::now(),
        }
    }

    /// Build a reading from a `READ?` response; the first value is the current.
    pub fn from_response(response: &str) -> DaqResult<Self> {
        parse_ascii_values(READ_QUERY, response)?
            .first()
            .map(|&amperes| Self::new(amperes))
            .ok_or_else(|| DaqError::Parse {
                command: READ_QUERY.to_string(),
                response: response.to_string(),
            })
    }

    /// Current in nanoamperes.
    pub fn nanoamps(&self) -> f64 {
        self.amperes * 1e9
    }
}

/// Parse a comma-separated list of ASCII floats such as `+1.234E-09,+1.000E+01`.
pub fn parse_ascii_values(command: &str, response: &str) -> DaqResult<Vec<f64>> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|field| field.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| DaqError::Parse {
            command: command.to_string(),
            response: response.to_string(),
        })
}

/// Basic statistics over a set of readings, in amperes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    /// Number of readings.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// Smallest reading.
    pub min: f64,
    /// Largest reading.
    pub max: f64,
}

impl Summary {
    /// `None` for an empty slice.
    pub fn from_readings(readings: &[Reading]) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let count = readings.len();
        let n = count as f64;
        let mean = readings.iter().map(|r| r.amperes).sum::<f64>() / n;
        let variance = readings
            .iter()
            .map(|r| (r.amperes - mean).powi(2))
            .sum::<f64>()
            / n;
        let min = readings.iter().map(|r| r.amperes).fold(f64::INFINITY, f64::min);
        let max = readings.iter().map(|r| r.amperes).fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            count,
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
        })
    }
}
