//! Error-queue drain bounds and verified-write behaviour at the channel level

use k2470_daq::error::{Diagnostics, TransportFault};
use k2470_daq::hardware::mock::MockInstrument;
use k2470_daq::hardware::Session;
use k2470_daq::scpi::{CommandChannel, ErrorClass, ErrorQueueDrainer, ERROR_QUEUE_QUERY, MAX_DRAIN};
use k2470_daq::DaqError;
use std::time::Duration;

fn session(instrument: &MockInstrument, timeout: Duration) -> Session {
    Session::with_transport("TCPIP::192.0.2.5::INSTR", timeout, Box::new(instrument.transport()))
}

fn queries(instrument: &MockInstrument) -> usize {
    instrument
        .call_log()
        .iter()
        .filter(|c| *c == ERROR_QUEUE_QUERY)
        .count()
}

#[tokio::test]
async fn test_never_empty_queue_stops_at_bound() {
    let instrument = MockInstrument::new();
    instrument.never_empty_error_queue("-363,\"Input buffer overrun\"");
    let mut session = session(&instrument, Duration::from_secs(1));

    let records = ErrorQueueDrainer::default().drain(&mut session).await.unwrap();

    assert_eq!(MAX_DRAIN, 30);
    assert_eq!(records.len(), 30);
    assert_eq!(queries(&instrument), 30);
    assert!(records.iter().all(|r| r.class() == ErrorClass::DeviceSpecific));
}

#[tokio::test]
async fn test_drain_stops_at_first_zero() {
    let instrument = MockInstrument::new();
    for code in 1..=3 {
        instrument.push_error(&format!("-{}00,\"Error {code}\"", code));
    }
    let mut session = session(&instrument, Duration::from_secs(1));

    let records = ErrorQueueDrainer::default().drain(&mut session).await.unwrap();

    let codes: Vec<_> = records.iter().map(|r| r.code).collect();
    assert_eq!(codes, vec![Some(-100), Some(-200), Some(-300)]);
    // Three records plus the terminating empty reply.
    assert_eq!(queries(&instrument), 4);
}

#[tokio::test]
async fn test_long_queue_is_cut_at_bound() {
    let instrument = MockInstrument::new();
    for i in 0..45 {
        instrument.push_error(&format!("{},\"Event {i}\"", 1000 + i));
    }
    let mut session = session(&instrument, Duration::from_secs(1));
    let drainer = ErrorQueueDrainer::default();

    let first = drainer.drain(&mut session).await.unwrap();
    let rest = drainer.drain(&mut session).await.unwrap();

    assert_eq!(first.len(), 30);
    assert_eq!(first[0].code, Some(1000));
    assert_eq!(rest.len(), 15);
    assert_eq!(rest[0].code, Some(1030));
}

#[tokio::test]
async fn test_custom_bound() {
    let instrument = MockInstrument::new();
    instrument.never_empty_error_queue("1,\"Event\"");
    let channel_session = session(&instrument, Duration::from_secs(1));
    let mut channel = CommandChannel::new(channel_session).with_drainer(ErrorQueueDrainer::with_max(5));

    let report = channel.write(":SENSe:AZERo:ONCE").await.unwrap();

    assert_eq!(report.errors.len(), 5);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_write_with_never_empty_queue_terminates() {
    let instrument = MockInstrument::new();
    instrument.never_empty_error_queue("-221,\"Settings conflict\"");
    let mut channel = CommandChannel::new(session(&instrument, Duration::from_secs(1)));

    let report = channel.write(":OUTPut ON").await.unwrap();

    assert_eq!(report.errors.len(), MAX_DRAIN);
    assert_eq!(report.errors[0].class(), ErrorClass::Execution);
    assert!(matches!(
        report.ensure_clean(),
        Err(DaqError::InstrumentReported { records, .. }) if records.len() == MAX_DRAIN
    ));
}

#[tokio::test]
async fn test_failed_drain_after_write_is_transport_error() {
    let instrument = MockInstrument::new();
    instrument.fail_error_queue();
    let mut channel = CommandChannel::new(session(&instrument, Duration::from_secs(1)));

    let err = channel.write(":OUTPut ON").await.unwrap_err();

    match err {
        DaqError::Transport {
            command,
            fault,
            diagnostics,
            ..
        } => {
            assert_eq!(command, ":OUTPut ON");
            assert!(matches!(fault, TransportFault::Closed));
            assert!(matches!(diagnostics, Diagnostics::VerificationInterrupted(ref records) if records.is_empty()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The command itself went out.
    assert!(instrument.output_enabled());
}

#[tokio::test]
async fn test_drain_failure_keeps_records_already_read() {
    let instrument = MockInstrument::new();
    instrument.inject_errors(":SOURce:VOLTage 5000", &["-222,\"Data out of range\""]);
    instrument.fail_error_queue_after(1);
    let mut channel = CommandChannel::new(session(&instrument, Duration::from_secs(1)));

    let err = channel.write(":SOURce:VOLTage 5000").await.unwrap_err();

    assert!(err.to_string().contains("-222"));
    match err {
        DaqError::Transport {
            command,
            diagnostics: Diagnostics::VerificationInterrupted(records),
            ..
        } => {
            assert_eq!(command, ":SOURce:VOLTage 5000");
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].class(), ErrorClass::Execution);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(queries(&instrument), 2);
}
