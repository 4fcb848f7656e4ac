//! Bounded drain of the instrument's error queue.
//!
//! The instrument keeps a FIFO of error/event records which `:SYSTem:ERRor?` pops one
//! at a time, oldest first. A response with code `0` (`+0,"No error"`) means the queue
//! is empty and nothing genuine ever follows it. The driver never writes to the queue.
//!
//! A drain stops at the first code `0` or after [`MAX_DRAIN`] queries, whichever
//! comes first, so an instrument that never reports an empty queue cannot hold the
//! caller in a loop.

use crate::error::TransportFault;
use crate::hardware::transport::Session;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Error-queue head query.
pub const ERROR_QUEUE_QUERY: &str = ":SYSTem:ERRor?";

/// Maximum number of queue entries read per drain.
pub const MAX_DRAIN: usize = 30;

/// One entry of the instrument's error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// Leading numeric code, `None` when the reply did not start with one.
    pub code: Option<i32>,
    /// Message with surrounding quotes removed.
    pub message: String,
    raw: String,
}

/// SCPI error-code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Code 0: the queue is empty.
    NoError,
    /// -100..=-199: syntax or header problems.
    Command,
    /// -200..=-299: valid command that could not be executed (e.g. settings conflict).
    Execution,
    /// -300..=-399 and positive codes: instrument-specific errors and events.
    DeviceSpecific,
    /// -400..=-499: query protocol violations.
    Query,
    /// Any other code, or no parsable code.
    Unknown,
}

impl ErrorRecord {
    /// Parse a `<code>,"<message>"` reply. Never fails: an unparsable reply is kept
    /// as a record with no code so it is still reported.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (head, tail) = raw.split_once(',').unwrap_or((raw, ""));
        let code = head.trim().parse::<i32>().ok();
        let message = if code.is_some() { tail } else { raw };
        Self {
            code,
            message: message.trim().trim_matches('"').to_string(),
            raw: raw.to_string(),
        }
    }

    /// The reply exactly as the instrument sent it, trimmed.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True for the `0` record that terminates the queue.
    pub fn is_no_error(&self) -> bool {
        self.code == Some(0)
    }

    /// SCPI class of the code.
    pub fn class(&self) -> ErrorClass {
        match self.code {
            Some(0) => ErrorClass::NoError,
            Some(-199..=-100) => ErrorClass::Command,
            Some(-299..=-200) => ErrorClass::Execution,
            Some(-399..=-300) => ErrorClass::DeviceSpecific,
            Some(code) if code > 0 => ErrorClass::DeviceSpecific,
            Some(-499..=-400) => ErrorClass::Query,
            _ => ErrorClass::Unknown,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Reads the error queue until it reports empty or the bound is reached.
#[derive(Debug, Clone, Copy)]
pub struct ErrorQueueDrainer {
    max: usize,
}

impl Default for ErrorQueueDrainer {
    fn default() -> Self {
        Self { max: MAX_DRAIN }
    }
}

impl ErrorQueueDrainer {
    /// Drainer with a custom bound. A bound of zero reads nothing.
    pub fn with_max(max: usize) -> Self {
        Self { max }
    }

    /// Maximum number of reads per drain.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Pop queue entries oldest first. The terminating `0` record is not included.
    ///
    /// Reads are destructive, so a drain cut short by the link hands back what it
    /// already popped inside the [`DrainFailure`]. Talks to the session directly: a
    /// failed drain must not trigger another drain.
    pub async fn drain(&self, session: &mut Session) -> Result<Vec<ErrorRecord>, DrainFailure> {
        let mut records = Vec::new();
        for _ in 0..self.max {
            let reply = match session.exchange(ERROR_QUEUE_QUERY).await {
                Ok(reply) => reply,
                Err(fault) => return Err(DrainFailure { fault, records }),
            };
            let record = ErrorRecord::parse(&reply);
            if record.is_no_error() {
                return Ok(records);
            }
            debug!(record = %record, "Error-queue entry");
            records.push(record);
        }
        if self.max > 0 {
            warn!(
                limit = self.max,
                "Error queue still not empty after {} reads; stopping drain", self.max
            );
        }
        Ok(records)
    }
}

/// A drain that the link cut short.
#[derive(Debug)]
pub struct DrainFailure {
    /// Why the drain stopped.
    pub fault: TransportFault,
    /// Records popped before the failure, oldest first.
    pub records: Vec<ErrorRecord>,
}
