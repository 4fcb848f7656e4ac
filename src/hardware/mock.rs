//! Scripted Keithley 2470 for testing
//!
//! [`MockInstrument`] plays the instrument side of the protocol without hardware. It
//! provides:
//! - An identity string, an output relay and a source level that follow the commands
//! - A FIFO error queue, with errors injectable per command
//! - An error queue that never reports empty (for bounded-drain checks)
//! - Queries answered only after the caller gave up (timeouts) and link failures
//! - Call logging for test verification
//!
//! `MockInstrument` is a cheap handle: clones share the same state, so a test can keep
//! one while the driver owns the transports it opens.
//!
//! # Example
//!
//! ```
//! use k2470_daq::hardware::mock::MockInstrument;
//! use k2470_daq::{ConnectionParams, Keithley2470Driver};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let instrument = MockInstrument::new();
//! let driver = Keithley2470Driver::with_connector(
//!     ConnectionParams::new("TCPIP::192.0.2.5::INSTR", 5000),
//!     Arc::new(instrument.clone()),
//! );
//! driver.connect().await.unwrap();
//! assert_eq!(instrument.call_log(), vec!["*IDN?".to_string()]);
//! # })
//! ```

use crate::error::TransportFault;
use crate::hardware::address::ResourceAddress;
use crate::hardware::transport::{Connector, Transport};
use crate::scpi::error_queue::ERROR_QUEUE_QUERY;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_IDENTITY: &str = "KEITHLEY INSTRUMENTS,MODEL 2470,04412345,1.7.0b";
const NO_ERROR: &str = "+0,\"No error\"";

enum Reply {
    Line(String),
    /// Withheld from the next receive, then delivered.
    Late(String),
    LinkDown,
}

#[derive(Default)]
struct MockState {
    identity: String,
    error_queue: VecDeque<String>,
    injected: HashMap<String, Vec<String>>,
    never_empty: Option<String>,
    error_queue_fails_after: Option<usize>,
    answer_late: HashSet<String>,
    fail_send_on: HashSet<String>,
    refuse_connections: bool,
    readings: VecDeque<String>,
    default_reading: f64,
    output: bool,
    bias: f64,
    replies: VecDeque<Reply>,
    call_log: Vec<String>,
    opens: usize,
    closes: usize,
}

/// Shared handle to a simulated instrument.
#[derive(Clone)]
pub struct MockInstrument {
    state: Arc<Mutex<MockState>>,
}

impl MockInstrument {
    /// Instrument with an empty error queue, output off and a 1.234 nA reading.
    pub fn new() -> Self {
        let state = MockState {
            identity: DEFAULT_IDENTITY.to_string(),
            default_reading: 1.234e-9,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Set the `*IDN?` reply.
    pub fn with_identity(self, identity: &str) -> Self {
        self.lock().identity = identity.to_string();
        self
    }

    /// Open a transport directly, bypassing address parsing.
    pub fn transport(&self) -> MockTransport {
        self.lock().opens += 1;
        MockTransport {
            instrument: self.clone(),
            closed: false,
        }
    }

    /// Queue error records to appear after `command` is received.
    pub fn inject_errors(&self, command: &str, records: &[&str]) {
        self.lock()
            .injected
            .entry(normalize(command))
            .or_default()
            .extend(records.iter().map(|r| r.to_string()));
    }

    /// Put a record in the error queue right now.
    pub fn push_error(&self, record: &str) {
        self.lock().error_queue.push_back(record.to_string());
    }

    /// Make every `:SYSTem:ERRor?` answer `record`, never `0`.
    pub fn never_empty_error_queue(&self, record: &str) {
        self.lock().never_empty = Some(record.to_string());
    }

    /// Make every `:SYSTem:ERRor?` fail at the link level.
    pub fn fail_error_queue(&self) {
        self.fail_error_queue_after(0);
    }

    /// Answer `reads` more `:SYSTem:ERRor?` queries, then fail the rest at the link level.
    pub fn fail_error_queue_after(&self, reads: usize) {
        self.lock().error_queue_fails_after = Some(reads);
    }

    /// Answer the next `command` too late: the receive waiting for it gets nothing,
    /// the reply comes with the one after.
    pub fn answer_late(&self, command: &str) {
        self.lock().answer_late.insert(normalize(command));
    }

    /// Fail the link when `command` is sent.
    pub fn fail_send_on(&self, command: &str) {
        self.lock().fail_send_on.insert(normalize(command));
    }

    /// Refuse every connection attempt.
    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    /// Queue a raw `READ?` reply; once exhausted the default reading is used.
    pub fn push_reading(&self, reply: &str) {
        self.lock().readings.push_back(reply.to_string());
    }

    /// Get a copy of the call log for verification
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Clear the call log
    pub fn clear_call_log(&self) {
        self.lock().call_log.clear();
    }

    /// Output relay state.
    pub fn output_enabled(&self) -> bool {
        self.lock().output
    }

    /// Programmed source level in volts.
    pub fn bias(&self) -> f64 {
        self.lock().bias
    }

    /// Transports opened so far.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Transports closed so far.
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockInstrument {
    async fn open(
        &self,
        _resource: &ResourceAddress,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportFault> {
        if self.lock().refuse_connections {
            return Err(TransportFault::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock instrument refused connection",
            )));
        }
        Ok(Box::new(self.transport()))
    }
}

/// Transport end of a [`MockInstrument`].
pub struct MockTransport {
    instrument: MockInstrument,
    closed: bool,
}

impl MockState {
    fn handle(&mut self, command: &str) -> Option<Reply> {
        let key = normalize(command);
        if let Some(records) = self.injected.get(&key) {
            self.error_queue.extend(records.iter().cloned());
        }

        match self.respond(&key) {
            Some(Reply::Line(line)) if self.answer_late.remove(&key) => Some(Reply::Late(line)),
            reply => reply,
        }
    }

    fn respond(&mut self, key: &str) -> Option<Reply> {
        let header = key.split_whitespace().next().unwrap_or_default();
        let argument = key[header.len()..].trim();
        match header {
            "*IDN?" => Some(Reply::Line(self.identity.clone())),
            h if h == normalize(ERROR_QUEUE_QUERY) => Some(self.next_error()),
            "READ?" => {
                let reply = self
                    .readings
                    .pop_front()
                    .unwrap_or_else(|| format!("{:e}", self.default_reading));
                Some(Reply::Line(reply))
            }
            ":OUTPUT?" => Some(Reply::Line(if self.output { "1" } else { "0" }.to_string())),
            ":OUTPUT" => {
                self.output = matches!(argument, "ON" | "1");
                None
            }
            ":SOURCE:VOLTAGE" => {
                if let Ok(volts) = argument.parse() {
                    self.bias = volts;
                }
                None
            }
            "*RST" => {
                self.output = false;
                self.bias = 0.0;
                None
            }
            h if h.ends_with('?') => Some(Reply::Line("0".to_string())),
            _ => None,
        }
    }

    fn next_error(&mut self) -> Reply {
        match self.error_queue_fails_after {
            Some(0) => return Reply::LinkDown,
            Some(n) => self.error_queue_fails_after = Some(n - 1),
            None => {}
        }
        if let Some(record) = &self.never_empty {
            return Reply::Line(record.clone());
        }
        Reply::Line(
            self.error_queue
                .pop_front()
                .unwrap_or_else(|| NO_ERROR.to_string()),
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: &str) -> Result<(), TransportFault> {
        if self.closed {
            return Err(TransportFault::SessionClosed);
        }
        let mut state = self.instrument.lock();
        state.call_log.push(text.to_string());
        if state.fail_send_on.contains(&normalize(text)) {
            return Err(TransportFault::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock link failure",
            )));
        }
        if let Some(reply) = state.handle(text) {
            state.replies.push_back(reply);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportFault> {
        let reply = {
            let mut state = self.instrument.lock();
            match state.replies.pop_front() {
                Some(Reply::Late(line)) => {
                    state.replies.push_front(Reply::Line(line));
                    None
                }
                other => other,
            }
        };
        match reply {
            Some(Reply::Line(line)) => Ok(format!("{line}\n")),
            Some(Reply::LinkDown) => Err(TransportFault::Closed),
            // The session timeout ends the wait.
            Some(Reply::Late(_)) | None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportFault> {
        if !self.closed {
            self.closed = true;
            self.instrument.lock().closes += 1;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "MockTransport".to_string()
    }
}

/// SCPI keywords are case-insensitive.
fn normalize(command: &str) -> String {
    command.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_and_default_error_queue() {
        let instrument = MockInstrument::new();
        let mut link = instrument.transport();

        link.send("*IDN?").await.unwrap();
        assert_eq!(link.receive().await.unwrap(), format!("{DEFAULT_IDENTITY}\n"));

        link.send(ERROR_QUEUE_QUERY).await.unwrap();
        assert_eq!(link.receive().await.unwrap(), format!("{NO_ERROR}\n"));
    }

    #[tokio::test]
    async fn test_injected_errors_are_fifo() {
        let instrument = MockInstrument::new();
        instrument.inject_errors(":OUTPut ON", &["-221,\"Settings conflict\"", "5074,\"Interlock\""]);
        let mut link = instrument.transport();

        link.send(":OUTPut ON").await.unwrap();
        for expected in ["-221,\"Settings conflict\"", "5074,\"Interlock\"", NO_ERROR] {
            link.send(ERROR_QUEUE_QUERY).await.unwrap();
            assert_eq!(link.receive().await.unwrap().trim(), expected);
        }
        assert!(instrument.output_enabled());
    }

    #[tokio::test]
    async fn test_state_follows_commands() {
        let instrument = MockInstrument::new();
        let mut link = instrument.transport();

        link.send(":SOURce:VOLTage 10.000000").await.unwrap();
        link.send(":OUTPut ON").await.unwrap();
        assert_eq!(instrument.bias(), 10.0);
        assert!(instrument.output_enabled());

        link.send("*RST").await.unwrap();
        assert!(!instrument.output_enabled());
        assert_eq!(instrument.bias(), 0.0);
    }

    #[tokio::test]
    async fn test_late_answer_arrives_with_the_next_receive() {
        let instrument = MockInstrument::new();
        instrument.answer_late("*IDN?");
        let mut link = instrument.transport();

        link.send("*IDN?").await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(20), link.receive()).await;
        assert!(first.is_err());

        link.send(":OUTPut?").await.unwrap();
        assert_eq!(link.receive().await.unwrap(), format!("{DEFAULT_IDENTITY}\n"));
        assert_eq!(link.receive().await.unwrap(), "0\n");

        // One-shot
        link.send("*IDN?").await.unwrap();
        assert_eq!(link.receive().await.unwrap(), format!("{DEFAULT_IDENTITY}\n"));
    }

    #[tokio::test]
    async fn test_error_queue_fails_after_countdown() {
        let instrument = MockInstrument::new();
        instrument.push_error("-222,\"Data out of range\"");
        instrument.fail_error_queue_after(1);
        let mut link = instrument.transport();

        link.send(ERROR_QUEUE_QUERY).await.unwrap();
        assert_eq!(link.receive().await.unwrap().trim(), "-222,\"Data out of range\"");
        link.send(ERROR_QUEUE_QUERY).await.unwrap();
        assert!(matches!(link.receive().await, Err(TransportFault::Closed)));
    }

    #[tokio::test]
    async fn test_send_failure_and_close() {
        let instrument = MockInstrument::new();
        instrument.fail_send_on("ABORt");
        let mut link = instrument.transport();

        assert!(matches!(link.send("ABORt").await, Err(TransportFault::Io(_))));
        link.close().await.unwrap();
        link.close().await.unwrap();
        assert_eq!(instrument.close_count(), 1);
        assert!(matches!(link.send("*IDN?").await, Err(TransportFault::SessionClosed)));
        assert_eq!(instrument.call_log(), vec!["ABORt".to_string()]);
    }
}
