//! Duty-cycle scheduler: sample, transmit, sleep, repeat.
//!
//! Two scheduling modes share the same steps:
//!
//! - [`SchedulingMode::Polling`]: one call to [`DutyCycleScheduler::run_cycle`]
//!   is one whole cycle; the completion flag is busy-polled inside it.
//! - [`SchedulingMode::InterruptDriven`]: `run_cycle` returns `Ok(None)` while
//!   the radio is still working. The entry that sees the completion finishes
//!   the transfer, sleeps, then samples and starts the next one. The very first
//!   entry behaves as if a completion had just been seen.
//!
//! A failed transfer is logged and counted; the next cycle is the retry.

use crate::calibration::SleepPlan;
use crate::config::{NodeConfig, NodeRole, SchedulingMode};
use crate::node::{Node, NodeError, NodeParts, Platform};
use crate::payload::SensorSample;
use crate::radio::{LinkQuality, Operation, RadioError, TransferOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u32,
    pub role: NodeRole,
    pub vcc_mv: i32,
    pub sample: Option<SensorSample>,
    /// Bytes handed to the radio (transmitter) or received (receiver).
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Immediate status of the operation started during this entry.
    pub started: Option<TransferOutcome>,
    /// Outcome of the operation that completed during this entry.
    pub completed: Option<TransferOutcome>,
    pub link: Option<LinkQuality>,
    pub sleep: Option<SleepPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u32,
    pub transmissions_ok: u32,
    pub transmissions_failed: u32,
    pub receptions_ok: u32,
    pub receptions_failed: u32,
    pub sleeps: u32,
    pub skipped_sleeps: u32,
    pub total_sleep_ms: u64,
    pub idle_polls: u32,
}

pub struct DutyCycleScheduler<P: Platform> {
    node: Node<P>,
    stats: SchedulerStats,
    // Time spent idling on the current pending operation (interrupt mode).
    waited_ms: u32,
}

impl<P: Platform> DutyCycleScheduler<P> {
    pub fn new(parts: NodeParts<P>, config: NodeConfig) -> Result<Self, NodeError> {
        Ok(Self {
            node: Node::new(parts, config)?,
            stats: SchedulerStats::default(),
            waited_ms: 0,
        })
    }

    pub fn boot(&mut self) -> Result<(), NodeError> {
        self.node.boot()?;
        info!(
            "Duty cycle ready: {:?} {:?}, every {} ms, correction {:.5}",
            self.node.config().role,
            self.node.config().mode,
            self.node.config().sleep_interval_ms,
            self.node.calibrator().factor().value()
        );
        Ok(())
    }

    /// One loop entry. `Ok(None)` means the radio is still busy (interrupt
    /// mode only); call [`DutyCycleScheduler::idle`] and come back.
    pub fn run_cycle(&mut self) -> Result<Option<CycleReport>, NodeError> {
        if !self.node.is_booted() {
            return Err(NodeError::NotBooted);
        }

        let config = self.node.config();
        let report = match (config.mode, config.role) {
            (SchedulingMode::Polling, NodeRole::Transmitter) => Some(self.transmit_polling()?),
            (SchedulingMode::Polling, NodeRole::Receiver) => Some(self.receive_polling()?),
            (SchedulingMode::InterruptDriven, role) => self.interrupt_entry(role)?,
        };

        if let Some(report) = &report {
            self.stats.cycles += 1;
            debug!("Cycle {} done: {:?}", report.cycle, report.completed);
        }
        Ok(report)
    }

    /// Run until `cycles` reports have been produced.
    pub fn run(&mut self, cycles: u32) -> Result<Vec<CycleReport>, NodeError> {
        let mut reports = Vec::with_capacity(cycles as usize);
        while reports.len() < cycles as usize {
            match self.run_cycle()? {
                Some(report) => reports.push(report),
                None => self.idle(),
            }
        }
        Ok(reports)
    }

    pub fn idle(&mut self) {
        self.node.idle();
        self.stats.idle_polls += 1;
        self.waited_ms = self
            .waited_ms
            .saturating_add(self.node.config().poll_interval_ms);
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn node(&self) -> &Node<P> {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node<P> {
        &mut self.node
    }

    fn transmit_polling(&mut self) -> Result<CycleReport, NodeError> {
        let mut report = self.new_report();
        self.sample_and_transmit(&mut report)?;

        match report.started {
            Some(TransferOutcome::Success) => {
                let timeout = self.node.config().transmit_timeout_ms;
                let outcome = match self.node.wait_for_completion(timeout) {
                    Ok(Operation::Transmit) => self.node.finish_transmit()?,
                    Ok(Operation::Receive) => TransferOutcome::OtherFailure,
                    Err(RadioError::Timeout) => self.node.expire_radio()?,
                    Err(e) => TransferOutcome::from(&e),
                };
                self.record_transmit(outcome);
                report.completed = Some(outcome);
            }
            Some(rejected) => {
                self.record_transmit(rejected);
                report.completed = Some(rejected);
            }
            None => {}
        }

        report.sleep = Some(self.sleep());
        Ok(report)
    }

    fn receive_polling(&mut self) -> Result<CycleReport, NodeError> {
        let mut report = self.new_report();
        report.vcc_mv = self.node.read_supply();

        let started = self.node.start_receive()?;
        report.started = Some(started);
        if started.is_success() {
            let config = self.node.config();
            let guard_ms = config.receive_window_ms.saturating_add(config.transmit_timeout_ms);
            match self.node.wait_for_completion(guard_ms) {
                Ok(_) => self.read_reception(&mut report)?,
                Err(RadioError::Timeout) => {
                    let outcome = self.node.expire_radio()?;
                    self.record_receive(outcome);
                    report.completed = Some(outcome);
                }
                Err(e) => {
                    let outcome = TransferOutcome::from(&e);
                    self.record_receive(outcome);
                    report.completed = Some(outcome);
                }
            }
        } else {
            self.record_receive(started);
        }

        report.sleep = Some(self.sleep());
        Ok(report)
    }

    fn interrupt_entry(&mut self, role: NodeRole) -> Result<Option<CycleReport>, NodeError> {
        let mut report = self.new_report();

        match self.node.poll_radio() {
            Err(nb::Error::WouldBlock) => {
                let config = self.node.config();
                let limit = match role {
                    NodeRole::Transmitter => config.transmit_timeout_ms,
                    NodeRole::Receiver => config.receive_window_ms.saturating_add(config.transmit_timeout_ms),
                };
                if self.waited_ms < limit {
                    return Ok(None);
                }
                warn!("Radio gave no completion within {} ms", limit);
                let outcome = self.node.expire_radio()?;
                self.record_for_role(role, outcome);
                report.completed = Some(outcome);
            }
            Ok(Operation::Transmit) => {
                let outcome = self.node.finish_transmit()?;
                self.record_transmit(outcome);
                report.completed = Some(outcome);
            }
            Ok(Operation::Receive) => self.read_reception(&mut report)?,
            // First entry, or the previous start was rejected.
            Err(nb::Error::Other(_)) => {}
        }

        report.sleep = Some(self.sleep());

        match role {
            NodeRole::Transmitter => {
                self.sample_and_transmit(&mut report)?;
                // A rejected start will never complete; count it now.
                if let Some(rejected) = report.started.filter(|s| !s.is_success()) {
                    self.record_transmit(rejected);
                }
            }
            NodeRole::Receiver => {
                report.vcc_mv = self.node.read_supply();
                let started = self.node.start_receive()?;
                report.started = Some(started);
                if !started.is_success() {
                    self.record_receive(started);
                }
            }
        }

        self.waited_ms = 0;
        Ok(Some(report))
    }

    /// Steps 1-3: supply, sensor, sensor to sleep, encode, start transmit.
    fn sample_and_transmit(&mut self, report: &mut CycleReport) -> Result<(), NodeError> {
        report.vcc_mv = self.node.read_supply();
        report.sample = self.node.sample_environment()?;

        let Some(sample) = report.sample else {
            return Ok(());
        };
        let Some(payload) = self.node.encode(&sample, report.vcc_mv) else {
            return Ok(());
        };

        let started = self.node.start_transmit(&payload)?;
        debug!("Sending packet of {} bytes: {:?}", payload.len(), started);
        report.payload = payload.to_vec();
        report.started = Some(started);
        Ok(())
    }

    fn read_reception(&mut self, report: &mut CycleReport) -> Result<(), NodeError> {
        let reception = self.node.read_data()?;
        self.record_receive(reception.outcome);
        if let Some(link) = reception.link {
            info!(
                "Received {} bytes, RSSI {:.1} dBm, SNR {:.2} dB, frequency error {:.0} Hz",
                reception.frame.len(),
                link.rssi_dbm,
                link.snr_db,
                link.frequency_error_hz
            );
        }
        report.payload = reception.frame.to_vec();
        report.link = reception.link;
        report.completed = Some(reception.outcome);
        Ok(())
    }

    fn sleep(&mut self) -> SleepPlan {
        let plan = self.node.sleep();
        match plan {
            SleepPlan::Sleep { ms } => {
                self.stats.sleeps += 1;
                self.stats.total_sleep_ms += u64::from(ms);
            }
            SleepPlan::Skip { .. } => self.stats.skipped_sleeps += 1,
        }
        plan
    }

    fn record_for_role(&mut self, role: NodeRole, outcome: TransferOutcome) {
        match role {
            NodeRole::Transmitter => self.record_transmit(outcome),
            NodeRole::Receiver => self.record_receive(outcome),
        }
    }

    fn record_transmit(&mut self, outcome: TransferOutcome) {
        if outcome.is_success() {
            self.stats.transmissions_ok += 1;
            info!("Packet successfully transmitted");
        } else {
            self.stats.transmissions_failed += 1;
            warn!("Transmission failed: {:?}", outcome);
        }
    }

    fn record_receive(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Success => self.stats.receptions_ok += 1,
            TransferOutcome::Timeout => {
                self.stats.receptions_failed += 1;
                info!("Receive window elapsed without a packet");
            }
            TransferOutcome::ChecksumMismatch => {
                self.stats.receptions_failed += 1;
                warn!("Packet received with CRC error");
            }
            other => {
                self.stats.receptions_failed += 1;
                warn!("Reception failed: {:?}", other);
            }
        }
    }

    fn new_report(&self) -> CycleReport {
        CycleReport {
            cycle: self.stats.cycles + 1,
            role: self.node.config().role,
            vcc_mv: 0,
            sample: None,
            payload: Vec::new(),
            started: None,
            completed: None,
            link: None,
            sleep: None,
        }
    }
}
