//! SX127x-like radio on virtual time.
//!
//! A transmission raises the DIO interrupt after its LoRa time on air. A
//! receive raises it once the next queued inbound frame has been on air, or at
//! the end of the receive window when nothing is queued.

use super::clock::{IrqHandle, SimClock};
use super::pins::BusProbe;
use crate::bus::Peripheral;
use crate::completion::CompletionSignal;
use crate::config::RadioConfig;
use crate::hal::RadioDriver;
use crate::radio::{time_on_air_us, RadioError};
use std::collections::VecDeque;
use tracing::trace;

// RadioLib's RADIOLIB_ERR_CHIP_NOT_FOUND.
const ERR_CHIP_NOT_FOUND: i16 = -2;
const ERR_UNKNOWN: i16 = -1;

/// A packet on the air, as the simulated radio will hear it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimFrame {
    pub bytes: Vec<u8>,
    pub rssi_dbm: f32,
    pub snr_db: f32,
    pub frequency_error_hz: f32,
    pub corrupted: bool,
}

impl SimFrame {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            rssi_dbm: -92.0,
            snr_db: 8.5,
            frequency_error_hz: 215.0,
            corrupted: false,
        }
    }

    pub fn corrupted(mut self) -> Self {
        self.corrupted = true;
        self
    }
}

#[derive(Debug)]
enum InFlight {
    Transmit,
    Receive(Option<SimFrame>),
}

#[derive(Debug)]
pub struct SimRadio {
    clock: SimClock,
    probe: BusProbe,
    signal: Option<CompletionSignal>,
    config: Option<RadioConfig>,
    max_frame_len: usize,
    receive_window_ms: u32,
    pub fail_begin: bool,
    /// Verdict `finish_transmit` reports for the next transmission.
    pub next_transmit_error: Option<RadioError>,
    /// Swallow the interrupt of the next started operation.
    pub drop_next_interrupt: bool,
    inbound: VecDeque<SimFrame>,
    in_flight: Option<InFlight>,
    last_rx: Option<SimFrame>,
    irq: Option<IrqHandle>,
    transmitted: Vec<Vec<u8>>,
    hardware_starts: u32,
    standbys: u32,
}

impl SimRadio {
    pub fn new(clock: SimClock, probe: BusProbe, max_frame_len: usize, receive_window_ms: u32) -> Self {
        Self {
            clock,
            probe,
            signal: None,
            config: None,
            max_frame_len,
            receive_window_ms,
            fail_begin: false,
            next_transmit_error: None,
            drop_next_interrupt: false,
            inbound: VecDeque::new(),
            in_flight: None,
            last_rx: None,
            irq: None,
            transmitted: Vec::new(),
            hardware_starts: 0,
            standbys: 0,
        }
    }

    /// Queue a packet for a later receive.
    pub fn push_inbound(&mut self, frame: SimFrame) {
        self.inbound.push_back(frame);
    }

    /// Every frame that made it into the FIFO, in order.
    pub fn transmitted(&self) -> &[Vec<u8>] {
        &self.transmitted
    }

    /// Transmit and receive starts that reached the hardware.
    pub fn hardware_starts(&self) -> u32 {
        self.hardware_starts
    }

    pub fn standbys(&self) -> u32 {
        self.standbys
    }

    fn configured(&self) -> Result<&RadioConfig, RadioError> {
        self.config.as_ref().ok_or(RadioError::Driver(ERR_CHIP_NOT_FOUND))
    }

    fn arm_interrupt(&mut self, after_us: u64) {
        if self.drop_next_interrupt {
            self.drop_next_interrupt = false;
            trace!("Interrupt of this operation will be lost");
            return;
        }
        if let Some(signal) = &self.signal {
            self.irq = Some(self.clock.schedule_irq(after_us, signal.clone()));
        }
    }

    fn disarm_interrupt(&mut self) {
        if let Some(handle) = self.irq.take() {
            self.clock.cancel_irq(handle);
        }
    }
}

impl RadioDriver for SimRadio {
    fn begin(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        self.probe.require(Peripheral::Radio, "radio begin");
        if self.fail_begin {
            return Err(RadioError::Driver(ERR_CHIP_NOT_FOUND));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn register_completion(&mut self, signal: CompletionSignal) {
        self.signal = Some(signal);
    }

    fn start_transmit(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        self.probe.require(Peripheral::Radio, "fifo write");
        let airtime_us = time_on_air_us(self.configured()?, payload.len());
        if payload.len() > self.max_frame_len {
            return Err(RadioError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        self.disarm_interrupt();
        self.hardware_starts += 1;
        self.transmitted.push(payload.to_vec());
        self.in_flight = Some(InFlight::Transmit);
        self.arm_interrupt(airtime_us);
        trace!("On air for {} us", airtime_us);
        Ok(())
    }

    fn finish_transmit(&mut self) -> Result<(), RadioError> {
        self.probe.require(Peripheral::Radio, "finish transmit");
        match self.in_flight.take() {
            Some(InFlight::Transmit) => self.next_transmit_error.take().map_or(Ok(()), Err),
            _ => Err(RadioError::Driver(ERR_UNKNOWN)),
        }
    }

    fn start_receive(&mut self) -> Result<(), RadioError> {
        self.probe.require(Peripheral::Radio, "start receive");
        let after_us = match self.inbound.front() {
            Some(frame) => time_on_air_us(self.configured()?, frame.bytes.len()),
            None => {
                self.configured()?;
                u64::from(self.receive_window_ms) * 1000
            }
        };
        self.disarm_interrupt();
        self.hardware_starts += 1;
        self.in_flight = Some(InFlight::Receive(self.inbound.pop_front()));
        self.arm_interrupt(after_us);
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        self.probe.require(Peripheral::Radio, "fifo read");
        match self.in_flight.take() {
            Some(InFlight::Receive(Some(frame))) => {
                let result = if frame.corrupted {
                    Err(RadioError::ChecksumMismatch)
                } else {
                    let len = frame.bytes.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame.bytes[..len]);
                    Ok(len)
                };
                self.last_rx = Some(frame);
                result
            }
            Some(InFlight::Receive(None)) => Err(RadioError::Timeout),
            _ => Err(RadioError::Driver(ERR_UNKNOWN)),
        }
    }

    fn rssi(&mut self) -> f32 {
        self.last_rx.as_ref().map_or(0.0, |f| f.rssi_dbm)
    }

    fn snr(&mut self) -> f32 {
        self.last_rx.as_ref().map_or(0.0, |f| f.snr_db)
    }

    fn frequency_error(&mut self) -> f32 {
        self.last_rx.as_ref().map_or(0.0, |f| f.frequency_error_hz)
    }

    fn standby(&mut self) -> Result<(), RadioError> {
        self.probe.require(Peripheral::Radio, "standby");
        self.disarm_interrupt();
        self.in_flight = None;
        self.standbys += 1;
        Ok(())
    }
}
