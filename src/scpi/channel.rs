//! Verified writes and diagnostic queries over a [`Session`].
//!
//! The channel is the only way the driver talks to the instrument:
//!
//! - [`CommandChannel::write`] sends a command and then drains the error queue exactly
//!   once. Non-zero records make the write *succeeded but flagged*: they are returned in
//!   the [`WriteReport`], never raised. Many instrument errors are recoverable (a value
//!   clipped to a limit, a setting ignored in the current function) and the caller
//!   decides what is fatal.
//! - [`CommandChannel::query`] sends a command and reads one line. If the exchange fails
//!   at the transport level the command is **not** retried. The error queue is drained
//!   best-effort and the outcome is attached to the original failure as
//!   [`Diagnostics`]; a failing drain never hides the original error, and records it
//!   popped before failing are kept.
//! - A write whose verifying drain breaks off is reported against the write itself,
//!   with the records read so far in [`Diagnostics::VerificationInterrupted`].
//!
//! A timed-out query does not desynchronise the channel: the session discards the
//! late reply before the next answer is read.

use crate::error::{DaqError, DaqResult, Diagnostics, TransportFault};
use crate::hardware::transport::Session;
use crate::scpi::command::{Command, CommandKind};
use crate::scpi::error_queue::{DrainFailure, ErrorQueueDrainer, ErrorRecord};
use serde::Serialize;
use tracing::{debug, error, warn};

/// Outcome of a verified write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Command as sent.
    pub command: String,
    /// Non-zero error-queue records drained right after the command, oldest first.
    pub errors: Vec<ErrorRecord>,
}

impl WriteReport {
    /// True when the instrument reported nothing.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Opt into treating instrument-reported errors as fatal.
    pub fn ensure_clean(self) -> DaqResult<Self> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(DaqError::InstrumentReported {
                command: self.command,
                records: self.errors,
            })
        }
    }
}

/// Result of [`CommandChannel::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A verified write.
    Written(WriteReport),
    /// Trimmed query reply.
    Answer(String),
}

/// Protocol-correct wrapper around an open session.
pub struct CommandChannel {
    session: Session,
    drainer: ErrorQueueDrainer,
}

impl CommandChannel {
    /// Channel with the default 30-entry drain bound.
    pub fn new(session: Session) -> Self {
        Self {
            session,
            drainer: ErrorQueueDrainer::default(),
        }
    }

    /// Use a drainer with a different bound.
    pub fn with_drainer(mut self, drainer: ErrorQueueDrainer) -> Self {
        self.drainer = drainer;
        self
    }

    /// Send `command` and verify it through one error-queue drain.
    pub async fn write(&mut self, command: &str) -> DaqResult<WriteReport> {
        if let Err(fault) = self.session.send(command).await {
            return Err(self.fail(command, fault).await);
        }
        debug!(command, "Sent write");

        let errors = match self.drainer.drain(&mut self.session).await {
            Ok(errors) => errors,
            Err(DrainFailure { fault, records }) => {
                error!(
                    command,
                    %fault,
                    recovered = records.len(),
                    "Error-queue drain failed after write"
                );
                return Err(self.transport_error(
                    command,
                    fault,
                    Diagnostics::VerificationInterrupted(records),
                ));
            }
        };

        if !errors.is_empty() {
            warn!(
                command,
                count = errors.len(),
                "Errors while writing {} to instrument: {:?}",
                command,
                errors.iter().map(ErrorRecord::raw).collect::<Vec<_>>()
            );
        }

        Ok(WriteReport {
            command: command.to_string(),
            errors,
        })
    }

    /// Send `command` and return its response line with surrounding whitespace removed.
    pub async fn query(&mut self, command: &str) -> DaqResult<String> {
        match self.session.exchange(command).await {
            Ok(reply) => {
                let reply = reply.trim().to_string();
                debug!(command, reply = %reply, "Query answered");
                Ok(reply)
            }
            Err(fault) => Err(self.fail(command, fault).await),
        }
    }

    /// Dispatch on the command kind.
    pub async fn execute(&mut self, command: &Command) -> DaqResult<Response> {
        match command.kind() {
            CommandKind::Write => self.write(command.text()).await.map(Response::Written),
            CommandKind::Query => self.query(command.text()).await.map(Response::Answer),
        }
    }

    /// Release the link. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.session.close().await;
    }

    async fn fail(&mut self, command: &str, fault: TransportFault) -> DaqError {
        error!(
            command,
            %fault,
            timeout_ms = self.session.timeout().as_millis() as u64,
            "Transport failure; check that the timeout is sufficiently long"
        );
        let diagnostics = self.diagnose(&fault).await;
        self.transport_error(command, fault, diagnostics)
    }

    async fn diagnose(&mut self, fault: &TransportFault) -> Diagnostics {
        if matches!(fault, TransportFault::SessionClosed) {
            return Diagnostics::NotAttempted;
        }
        match self.drainer.drain(&mut self.session).await {
            Ok(records) => {
                if records.is_empty() {
                    debug!("Error queue empty");
                } else {
                    for (i, record) in records.iter().enumerate() {
                        warn!(index = i, record = %record, "Latest errors from the instrument");
                    }
                }
                Diagnostics::Drained(records)
            }
            Err(DrainFailure { fault, records }) => {
                let recovered: Vec<&str> = records.iter().map(ErrorRecord::raw).collect();
                warn!(
                    drain_fault = %fault,
                    ?recovered,
                    "Could not retrieve all errors from the instrument"
                );
                Diagnostics::DrainFailed { fault, records }
            }
        }
    }

    fn transport_error(&self, command: &str, fault: TransportFault, diagnostics: Diagnostics) -> DaqError {
        DaqError::Transport {
            command: command.to_string(),
            timeout: self.session.timeout(),
            fault,
            diagnostics,
        }
    }
}
