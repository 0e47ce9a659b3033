use sensornode::calibration::{CalibrationState, SleepPlan};
use sensornode::config::{NodeConfig, NodeRole, SchedulingMode};
use sensornode::hal::SensorError;
use sensornode::node::{NodeError, NodeParts};
use sensornode::radio::{RadioError, TransferOutcome};
use sensornode::scheduler::DutyCycleScheduler;
use sensornode::sim::{SimBoard, SimBoardOptions, SimFrame, SimPlatform};

const EXPECTED_RECORD: &[u8] = br#"[{"h":4512,"t":2150,"p":10132,"vcc":3300},{"node":"NS001"}]"#;

fn build_parts(
    config: &NodeConfig,
    options: &SimBoardOptions,
) -> (SimBoard, NodeParts<SimPlatform>) {
    SimBoard::build(config, options).unwrap()
}

fn booted(config: NodeConfig, options: SimBoardOptions) -> (SimBoard, DutyCycleScheduler<SimPlatform>) {
    let (board, parts) = build_parts(&config, &options);
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
    scheduler.boot().unwrap();
    (board, scheduler)
}

fn interrupt_config() -> NodeConfig {
    NodeConfig {
        mode: SchedulingMode::InterruptDriven,
        ..NodeConfig::default()
    }
}

fn receiver_config(mode: SchedulingMode) -> NodeConfig {
    NodeConfig {
        mode,
        role: NodeRole::Receiver,
        ..NodeConfig::default()
    }
}

#[test]
fn test_polling_transmitter_cycles() {
    let (board, mut scheduler) = booted(NodeConfig::default(), SimBoardOptions::default());
    let reports = scheduler.run(3).unwrap();

    assert_eq!(reports.len(), 3);
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report.cycle, i as u32 + 1);
        assert_eq!(report.vcc_mv, 3300);
        assert_eq!(report.payload, EXPECTED_RECORD);
        assert_eq!(report.started, Some(TransferOutcome::Success));
        assert_eq!(report.completed, Some(TransferOutcome::Success));
        // 8000 ticks measured against 7980 expected.
        assert_eq!(report.sleep, Some(SleepPlan::Sleep { ms: 10_017 }));
    }

    let stats = scheduler.stats();
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.transmissions_ok, 3);
    assert_eq!(stats.transmissions_failed, 0);
    assert_eq!(stats.sleeps, 3);
    assert_eq!(stats.total_sleep_ms, 3 * 10_017);

    let node = scheduler.node();
    assert_eq!(node.radio().driver().transmitted().len(), 3);
    assert_eq!(node.sensor().low_power_entries(), 3);
    assert_eq!(node.sleeper().sleeps(), 3);
    assert!(board.probe.violations().is_empty());
}

#[test]
fn test_sleep_corrected_for_fast_oscillator() {
    let mut config = NodeConfig::default();
    config.calibration.target_reference_ticks = 8000.0;
    let options = SimBoardOptions {
        timer_rate: 1.025,
        ..SimBoardOptions::default()
    };
    let (_board, mut scheduler) = booted(config, options);
    let report = scheduler.run(1).unwrap().remove(0);

    assert_eq!(report.sleep, Some(SleepPlan::Sleep { ms: 10_242 }));
    // The timer runs 2.5% fast; the real sleep, wake-up included, lands on
    // the requested interval.
    let wall_us = scheduler.node().sleeper().last_wall_us();
    assert!(wall_us.abs_diff(10_000_000) < 1_000, "slept {wall_us} us");
}

#[test]
fn test_missing_reference_clock_still_runs() {
    let options = SimBoardOptions {
        reference_available: false,
        ..SimBoardOptions::default()
    };
    let (_board, mut scheduler) = booted(NodeConfig::default(), options);
    assert_eq!(scheduler.node().calibrator().state(), CalibrationState::Degraded);

    let report = scheduler.run(1).unwrap().remove(0);
    assert_eq!(report.completed, Some(TransferOutcome::Success));
    assert_eq!(report.sleep, Some(SleepPlan::Sleep { ms: 9_992 }));
}

#[test]
fn test_calibration_disabled_uses_neutral_factor() {
    let mut config = NodeConfig::default();
    config.calibration.enabled = false;
    let (board, mut scheduler) = booted(config, SimBoardOptions::default());

    assert_eq!(scheduler.node().calibrator().state(), CalibrationState::NotRun);
    // Only the boot settle delay has elapsed.
    assert_eq!(board.clock.now_ms(), 1000);
    let report = scheduler.run(1).unwrap().remove(0);
    assert_eq!(report.sleep, Some(SleepPlan::Sleep { ms: 9_992 }));
}

#[test]
fn test_short_interval_skips_low_power() {
    let mut config = NodeConfig::default();
    config.sleep_interval_ms = 5;
    config.calibration.enabled = false;
    let (_board, mut scheduler) = booted(config, SimBoardOptions::default());

    let report = scheduler.run(1).unwrap().remove(0);
    assert_eq!(report.sleep, Some(SleepPlan::Skip { corrected_ms: -3 }));
    assert_eq!(scheduler.stats().skipped_sleeps, 1);
    assert_eq!(scheduler.node().sleeper().sleeps(), 0);
}

#[test]
fn test_sensor_init_failure_is_fatal() {
    let config = NodeConfig::default();
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.sensor.fail_begin = true;
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();

    assert!(matches!(
        scheduler.boot(),
        Err(NodeError::SensorInit(SensorError::NotResponding))
    ));
    assert!(matches!(scheduler.run_cycle(), Err(NodeError::NotBooted)));
}

#[test]
fn test_radio_init_failure_is_fatal() {
    let config = NodeConfig::default();
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.radio.fail_begin = true;
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();

    assert!(matches!(
        scheduler.boot(),
        Err(NodeError::RadioInit(RadioError::Driver(-2)))
    ));
    assert!(!scheduler.node().is_booted());
}

#[test]
fn test_sensor_read_failure_skips_transmit() {
    let config = NodeConfig::default();
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.sensor.failing_reads = 1;
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
    scheduler.boot().unwrap();

    let reports = scheduler.run(2).unwrap();
    assert!(reports[0].sample.is_none());
    assert!(reports[0].started.is_none());
    assert!(reports[0].sleep.is_some());
    assert_eq!(reports[1].completed, Some(TransferOutcome::Success));
    assert_eq!(scheduler.node().radio().driver().transmitted().len(), 1);
    // The sensor is put back to sleep even after a failed read.
    assert_eq!(scheduler.node().sensor().low_power_entries(), 2);
}

#[test]
fn test_oversized_payload_rejected_and_cycle_continues() {
    let mut config = NodeConfig::default();
    config.radio.max_frame_len = 32;
    let (_board, mut scheduler) = booted(config, SimBoardOptions::default());

    let report = scheduler.run(1).unwrap().remove(0);
    assert_eq!(report.started, Some(TransferOutcome::PayloadTooLarge));
    assert_eq!(report.completed, Some(TransferOutcome::PayloadTooLarge));
    assert!(report.sleep.is_some());
    assert_eq!(scheduler.node().radio().driver().hardware_starts(), 0);
    assert_eq!(scheduler.stats().transmissions_failed, 1);
}

#[test]
fn test_lost_interrupt_times_out_then_recovers() {
    let config = NodeConfig::default();
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.radio.drop_next_interrupt = true;
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
    scheduler.boot().unwrap();

    let reports = scheduler.run(2).unwrap();
    assert_eq!(reports[0].completed, Some(TransferOutcome::Timeout));
    assert_eq!(reports[1].completed, Some(TransferOutcome::Success));
    assert_eq!(scheduler.node().radio().driver().standbys(), 1);
    assert_eq!(scheduler.stats().transmissions_failed, 1);
    assert_eq!(scheduler.stats().transmissions_ok, 1);
}

#[test]
fn test_interrupt_driven_transmitter() {
    let (board, mut scheduler) = booted(interrupt_config(), SimBoardOptions::default());

    // First entry sleeps, then starts the first transmission.
    let first = scheduler.run_cycle().unwrap().unwrap();
    assert_eq!(first.completed, None);
    assert!(first.sleep.is_some());
    assert_eq!(first.started, Some(TransferOutcome::Success));

    // The radio is still on air right after the start.
    assert!(scheduler.run_cycle().unwrap().is_none());

    let reports = scheduler.run(2).unwrap();
    assert_eq!(reports[0].completed, Some(TransferOutcome::Success));
    assert_eq!(reports[1].completed, Some(TransferOutcome::Success));

    let stats = scheduler.stats();
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.transmissions_ok, 2);
    assert!(stats.idle_polls > 0);
    assert_eq!(scheduler.node().radio().driver().transmitted().len(), 3);
    assert!(board.probe.violations().is_empty());
    assert_eq!(board.probe.peak_selected(), 1);
}

#[test]
fn test_interrupt_driven_lost_completion_expires() {
    let config = interrupt_config();
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.radio.drop_next_interrupt = true;
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
    scheduler.boot().unwrap();

    let reports = scheduler.run(2).unwrap();
    assert_eq!(reports[1].completed, Some(TransferOutcome::Timeout));
    assert_eq!(reports[1].started, Some(TransferOutcome::Success));
    assert!(scheduler.stats().idle_polls >= 5000);
    assert_eq!(scheduler.stats().transmissions_failed, 1);
}

#[test]
fn test_interrupt_driven_rejected_start_does_not_wait() {
    let mut config = interrupt_config();
    config.radio.max_frame_len = 32;
    let (_board, mut scheduler) = booted(config, SimBoardOptions::default());

    let reports = scheduler.run(2).unwrap();
    assert_eq!(reports[0].started, Some(TransferOutcome::PayloadTooLarge));
    // Nothing was pending, so the next entry went straight on.
    assert_eq!(reports[1].completed, None);
    assert_eq!(scheduler.stats().idle_polls, 0);
    assert_eq!(scheduler.stats().transmissions_failed, 2);
}

#[test]
fn test_polling_receiver_outcomes() {
    let config = receiver_config(SchedulingMode::Polling);
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.radio.push_inbound(SimFrame::new(EXPECTED_RECORD));
    parts.radio.push_inbound(SimFrame::new(vec![0xde, 0xad]).corrupted());
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
    scheduler.boot().unwrap();

    let reports = scheduler.run(3).unwrap();

    assert_eq!(reports[0].completed, Some(TransferOutcome::Success));
    assert_eq!(reports[0].payload, EXPECTED_RECORD);
    let link = reports[0].link.unwrap();
    assert_eq!(link.rssi_dbm, -92.0);

    assert_eq!(reports[1].completed, Some(TransferOutcome::ChecksumMismatch));
    assert!(reports[1].link.is_some());

    // Nothing left on the air: the window elapses.
    assert_eq!(reports[2].completed, Some(TransferOutcome::Timeout));
    assert!(reports[2].link.is_none());

    let stats = scheduler.stats();
    assert_eq!(stats.receptions_ok, 1);
    assert_eq!(stats.receptions_failed, 2);
    assert_eq!(stats.sleeps, 3);
}

#[test]
fn test_interrupt_driven_receiver() {
    let config = receiver_config(SchedulingMode::InterruptDriven);
    let (_board, mut parts) = build_parts(&config, &SimBoardOptions::default());
    parts.radio.push_inbound(SimFrame::new(EXPECTED_RECORD));
    let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
    scheduler.boot().unwrap();

    let reports = scheduler.run(2).unwrap();
    assert_eq!(reports[0].started, Some(TransferOutcome::Success));
    assert_eq!(reports[0].completed, None);
    assert_eq!(reports[1].completed, Some(TransferOutcome::Success));
    assert_eq!(reports[1].payload, EXPECTED_RECORD);
    assert_eq!(scheduler.stats().receptions_ok, 1);
}

#[test]
fn test_recalibration_replaces_factor() {
    let (_board, mut scheduler) = booted(NodeConfig::default(), SimBoardOptions::default());
    let before = scheduler.node().calibrator().factor();
    scheduler.node_mut().recalibrate();
    assert_eq!(scheduler.node().calibrator().factor(), before);
    assert_eq!(scheduler.node().calibrator().state(), CalibrationState::Calibrated);
}

#[test]
fn test_cycle_report_serializes() {
    let (_board, mut scheduler) = booted(NodeConfig::default(), SimBoardOptions::default());
    let report = scheduler.run(1).unwrap().remove(0);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["cycle"], 1);
    assert_eq!(json["role"], "transmitter");
    assert_eq!(json["completed"], "Success");
    assert_eq!(json["sleep"]["Sleep"]["ms"], 10_017);
}
