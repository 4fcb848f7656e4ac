//! Custom error types for the driver.
//!
//! This module defines `DaqError`, the single error type returned by every layer of
//! the crate. It follows the three-way taxonomy of the instrument protocol:
//!
//! - **`Connection`**: the instrument could not be opened or did not identify itself.
//!   Fatal to the session.
//! - **`Transport`**: a timeout or link failure during a send/receive. Fatal to the
//!   in-flight operation, not necessarily to the session. It carries the attempted
//!   command, the timeout in force, the root cause (`TransportFault`) and, kept apart
//!   from the root cause, whatever a best-effort error-queue drain found afterwards
//!   (`Diagnostics`).
//! - Instrument-reported errors are *not* errors here. They are returned as
//!   [`ErrorRecord`] data alongside successful writes. `InstrumentReported` only
//!   exists for callers that opt into treating them as fatal.
//!
//! The remaining variants cover state-machine misuse, unparsable responses and
//! configuration problems.

use crate::hardware::k2470::InstrumentState;
use crate::scpi::ErrorRecord;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Root cause of a failed exchange on the link.
#[derive(Error, Debug)]
pub enum TransportFault {
    /// Nothing (or only part of a line) arrived within the session timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection.
    #[error("link closed by peer")]
    Closed,

    /// The session was closed locally before the exchange.
    #[error("session already closed")]
    SessionClosed,

    /// The reply was not UTF-8.
    #[error("response is not valid UTF-8")]
    Encoding,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of the best-effort error-queue drain that follows a transport failure.
#[derive(Debug, Default)]
pub enum Diagnostics {
    /// No drain was attempted (e.g. the session was already closed).
    #[default]
    NotAttempted,
    /// The drain completed; the records may be empty.
    Drained(Vec<ErrorRecord>),
    /// The drain itself failed after popping `records`. This never replaces the
    /// original failure.
    DrainFailed {
        /// Why the drain stopped.
        fault: TransportFault,
        /// Records read before it stopped, oldest first.
        records: Vec<ErrorRecord>,
    },
    /// The command was sent but the error-queue drain that verifies it broke off.
    /// The root cause is the drain's fault; these are the records read before it.
    VerificationInterrupted(Vec<ErrorRecord>),
}

impl Diagnostics {
    /// Records read from the instrument, whether or not the drain completed.
    pub fn records(&self) -> Option<&[ErrorRecord]> {
        match self {
            Diagnostics::NotAttempted => None,
            Diagnostics::Drained(records)
            | Diagnostics::DrainFailed { records, .. }
            | Diagnostics::VerificationInterrupted(records) => Some(records),
        }
    }
}

fn join_records(records: &[ErrorRecord]) -> String {
    records
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostics::NotAttempted => write!(f, "error queue not read"),
            Diagnostics::Drained(records) if records.is_empty() => write!(f, "error queue empty"),
            Diagnostics::Drained(records) => write!(f, "error queue: [{}]", join_records(records)),
            Diagnostics::DrainFailed { fault, records } if records.is_empty() => {
                write!(f, "could not retrieve errors from the instrument: {fault}")
            }
            Diagnostics::DrainFailed { fault, records } => write!(
                f,
                "could not retrieve all errors from the instrument: {fault}; read so far: [{}]",
                join_records(records)
            ),
            Diagnostics::VerificationInterrupted(records) => write!(
                f,
                "command sent, error-queue check interrupted; read so far: [{}]",
                join_records(records)
            ),
        }
    }
}

/// Error type shared by every layer of the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The instrument could not be opened or did not identify itself.
    #[error("Connection to '{address}' failed: {reason}")]
    Connection {
        /// Resource string that was dialled.
        address: String,
        /// What went wrong.
        reason: String,
    },

    /// A send or receive failed; see [`DaqError::is_fatal_to_session`].
    #[error(
        "Transport error on '{command}': {fault} (timeout {} ms); {diagnostics}",
        timeout.as_millis()
    )]
    Transport {
        /// Command whose exchange (or verification) failed.
        command: String,
        /// Timeout in force on the session.
        timeout: Duration,
        /// Root cause.
        #[source]
        fault: TransportFault,
        /// What the follow-up error-queue drain found.
        diagnostics: Diagnostics,
    },

    /// The resource string is not a supported VISA address.
    #[error("Invalid resource address '{address}': {reason}")]
    InvalidAddress {
        /// The rejected string.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The operation is not allowed in the driver's current state.
    #[error("Operation '{operation}' is not valid in state {state:?}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the driver was in.
        state: InstrumentState,
    },

    /// A value outside the instrument's limits; nothing was sent.
    #[error("{name} value {value} is out of range. Allowed range is [{min}, {max}]")]
    OutOfRange {
        /// Parameter name.
        name: &'static str,
        /// Rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// A reply could not be interpreted.
    #[error("Failed to parse response to '{command}': '{response}'")]
    Parse {
        /// Query that produced the reply.
        command: String,
        /// Reply text.
        response: String,
    },

    /// Instrument errors promoted to a failure by `ensure_clean`.
    #[error("Instrument reported {} error(s) for '{command}'", records.len())]
    InstrumentReported {
        /// Command that was flagged.
        command: String,
        /// Records drained after it.
        records: Vec<ErrorRecord>,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl DaqError {
    /// Diagnostics attached to a transport failure.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            DaqError::Transport { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// True for errors that leave the session unusable: the link is gone or broke at
    /// the socket level. Timeouts are not fatal; the session discards late replies.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            DaqError::Connection { .. } => true,
            DaqError::Transport { fault, .. } => matches!(
                fault,
                TransportFault::Closed | TransportFault::SessionClosed | TransportFault::Io(_)
            ),
            _ => false,
        }
    }
}
