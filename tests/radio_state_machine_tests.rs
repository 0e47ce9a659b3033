use embedded_hal::digital::OutputPin;
use sensornode::bus::Peripheral;
use sensornode::config::RadioConfig;
use sensornode::radio::{
    time_on_air_us, Operation, RadioError, RadioState, RadioStateMachine, TransferOutcome,
};
use sensornode::sim::{BusProbe, SimClock, SimFrame, SimPin, SimRadio};

struct Bench {
    clock: SimClock,
    probe: BusProbe,
    radio: RadioStateMachine<SimRadio>,
}

// Radio permanently selected; the state machine itself never touches the bus.
fn bench(max_frame_len: usize) -> Bench {
    let clock = SimClock::new();
    let probe = BusProbe::new();
    SimPin::new(Peripheral::Radio, probe.clone()).set_low().unwrap();
    let mut radio = RadioStateMachine::new(SimRadio::new(clock.clone(), probe.clone(), max_frame_len, 5000));
    radio.begin(&RadioConfig::default()).unwrap();
    Bench { clock, probe, radio }
}

#[test]
fn test_payload_within_limit_completes() {
    let mut b = bench(64);
    let payload = [0x42u8; 58];
    b.radio.start_transmit(&payload).unwrap();
    assert_eq!(b.radio.state(), RadioState::TransmitPending);
    assert_eq!(b.radio.poll_completion(), Err(nb::Error::WouldBlock));

    b.clock.advance_us(time_on_air_us(&RadioConfig::default(), payload.len()));
    assert_eq!(b.radio.poll_completion(), Ok(Operation::Transmit));
    assert_eq!(b.radio.finish_transmit(), Ok(TransferOutcome::Success));
    assert_eq!(b.radio.state(), RadioState::Idle);
    assert_eq!(b.radio.driver().transmitted(), &[payload.to_vec()]);
    assert!(b.probe.violations().is_empty());
}

#[test]
fn test_oversized_payload_never_reaches_hardware() {
    let mut b = bench(64);
    let result = b.radio.start_transmit(&[0u8; 300]);

    assert_eq!(result, Err(RadioError::PayloadTooLarge { len: 300, max: 64 }));
    assert_eq!(TransferOutcome::from(&result), TransferOutcome::PayloadTooLarge);
    assert_eq!(b.radio.state(), RadioState::Idle);
    assert_eq!(b.radio.driver().hardware_starts(), 0);
    assert_eq!(b.radio.stats().rejected_before_hardware, 1);

    b.clock.advance_us(10_000_000);
    assert!(!b.radio.completion_flag().is_set());
}

#[test]
fn test_second_start_while_pending_is_busy() {
    let mut b = bench(255);
    b.radio.start_transmit(b"first").unwrap();
    assert_eq!(
        b.radio.start_transmit(b"second"),
        Err(RadioError::Busy(RadioState::TransmitPending))
    );
    assert_eq!(b.radio.start_receive(), Err(RadioError::Busy(RadioState::TransmitPending)));
    assert_eq!(b.radio.driver().hardware_starts(), 1);
}

#[test]
fn test_finish_before_completion_refused() {
    let mut b = bench(255);
    b.radio.start_transmit(b"early").unwrap();
    assert_eq!(
        b.radio.finish_transmit(),
        Err(RadioError::NotComplete(RadioState::TransmitPending))
    );
    assert_eq!(b.radio.poll_completion(), Err(nb::Error::WouldBlock));
}

#[test]
fn test_completion_consumed_once() {
    let mut b = bench(255);
    b.radio.start_transmit(b"once").unwrap();
    b.clock.advance_us(5_000_000);

    assert_eq!(b.radio.poll_completion(), Ok(Operation::Transmit));
    // Observed state is sticky but the flag is gone.
    assert_eq!(b.radio.poll_completion(), Ok(Operation::Transmit));
    assert!(!b.radio.completion_flag().is_set());
    assert_eq!(b.radio.stats().completions_observed, 1);
}

#[test]
fn test_hardware_reported_transmit_failure() {
    let mut b = bench(255);
    b.radio.driver_mut().next_transmit_error = Some(RadioError::Timeout);
    b.radio.start_transmit(b"lost").unwrap();
    b.clock.advance_us(5_000_000);
    b.radio.poll_completion().unwrap();
    assert_eq!(b.radio.finish_transmit(), Ok(TransferOutcome::Timeout));
}

#[test]
fn test_poll_with_nothing_pending() {
    let mut b = bench(255);
    assert_eq!(
        b.radio.poll_completion(),
        Err(nb::Error::Other(RadioError::NothingPending))
    );
}

#[test]
fn test_reception_with_link_quality() {
    let mut b = bench(255);
    b.radio.driver_mut().push_inbound(SimFrame::new(&b"hello gateway"[..]));
    b.radio.start_receive().unwrap();
    b.clock.advance_us(1_000_000);

    assert_eq!(b.radio.poll_completion(), Ok(Operation::Receive));
    let reception = b.radio.read_data().unwrap();
    assert_eq!(reception.outcome, TransferOutcome::Success);
    assert_eq!(&reception.frame[..], b"hello gateway");
    let link = reception.link.unwrap();
    assert_eq!(link.rssi_dbm, -92.0);
    assert_eq!(link.snr_db, 8.5);
    assert_eq!(link.frequency_error_hz, 215.0);
}

#[test]
fn test_corrupted_reception() {
    let mut b = bench(255);
    b.radio.driver_mut().push_inbound(SimFrame::new(vec![1, 2, 3]).corrupted());
    b.radio.start_receive().unwrap();
    b.clock.advance_us(1_000_000);
    b.radio.poll_completion().unwrap();

    let reception = b.radio.read_data().unwrap();
    assert_eq!(reception.outcome, TransferOutcome::ChecksumMismatch);
    assert!(reception.frame.is_empty());
    assert!(reception.link.is_some());
}

#[test]
fn test_empty_receive_window() {
    let mut b = bench(255);
    b.radio.start_receive().unwrap();
    b.clock.advance_us(4_999_999);
    assert_eq!(b.radio.poll_completion(), Err(nb::Error::WouldBlock));
    b.clock.advance_us(1);
    b.radio.poll_completion().unwrap();

    let reception = b.radio.read_data().unwrap();
    assert_eq!(reception.outcome, TransferOutcome::Timeout);
    assert!(reception.link.is_none());
}

#[test]
fn test_expire_drops_late_completion() {
    let mut b = bench(255);
    b.radio.start_transmit(b"slow").unwrap();
    assert_eq!(b.radio.expire(), TransferOutcome::Timeout);
    b.clock.advance_us(5_000_000);

    assert_eq!(b.radio.state(), RadioState::Idle);
    assert!(!b.radio.completion_flag().is_set());
    assert_eq!(b.radio.driver().standbys(), 1);
    assert_eq!(b.radio.stats().hardware_timeouts, 1);
    // Ready for the next operation.
    b.radio.start_transmit(b"again").unwrap();
}

#[test]
fn test_time_on_air_grows_with_spreading_factor() {
    let sf7 = RadioConfig {
        spreading_factor: 7,
        ..RadioConfig::default()
    };
    let sf9 = RadioConfig::default();
    assert!(time_on_air_us(&sf7, 58) < time_on_air_us(&sf9, 58));
    // 106 payload symbols plus 12.25 preamble symbols of 4.096 ms.
    assert_eq!(time_on_air_us(&sf9, 58), 484_352);
}
