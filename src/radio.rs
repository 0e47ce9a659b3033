//! Non-blocking radio transmit/receive state machine.
//!
//! ```text
//! Idle -> TransmitPending -> TransmitComplete -> Idle
//! Idle -> ReceivePending  -> ReceiveComplete  -> Idle
//! ```
//!
//! `start_*` only initiate the hardware. Completion is learnt by polling the
//! [`CompletionFlag`] the driver's interrupt raises; only then may
//! `finish_transmit` / `read_data` touch the radio again. Bus selection is the
//! caller's job: every method that reaches the driver must run with the radio
//! selected.

use crate::completion::CompletionFlag;
use crate::config::RadioConfig;
use crate::hal::RadioDriver;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest frame any supported radio accepts (SX127x FIFO).
pub const MAX_FRAME_LEN: usize = 255;

pub type Frame = Vec<u8, MAX_FRAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    Idle,
    TransmitPending,
    TransmitComplete,
    ReceivePending,
    ReceiveComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Transmit,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("radio operation timed out")]
    Timeout,
    #[error("received frame failed CRC check")]
    ChecksumMismatch,
    #[error("radio busy in state {0:?}")]
    Busy(RadioState),
    #[error("operation has not completed (state {0:?})")]
    NotComplete(RadioState),
    #[error("no radio operation pending")]
    NothingPending,
    #[error("radio driver error code {0}")]
    Driver(i16),
}

/// Result of one transmit or receive attempt. Carries no retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    Success,
    Timeout,
    ChecksumMismatch,
    PayloadTooLarge,
    OtherFailure,
}

impl TransferOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, TransferOutcome::Success)
    }
}

impl From<&RadioError> for TransferOutcome {
    fn from(error: &RadioError) -> Self {
        match error {
            RadioError::PayloadTooLarge { .. } => TransferOutcome::PayloadTooLarge,
            RadioError::Timeout => TransferOutcome::Timeout,
            RadioError::ChecksumMismatch => TransferOutcome::ChecksumMismatch,
            RadioError::Busy(_)
            | RadioError::NotComplete(_)
            | RadioError::NothingPending
            | RadioError::Driver(_) => TransferOutcome::OtherFailure,
        }
    }
}

impl<T> From<&Result<T, RadioError>> for TransferOutcome {
    fn from(result: &Result<T, RadioError>) -> Self {
        match result {
            Ok(_) => TransferOutcome::Success,
            Err(e) => TransferOutcome::from(e),
        }
    }
}

/// Packet metadata read after a reception.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkQuality {
    pub rssi_dbm: f32,
    pub snr_db: f32,
    pub frequency_error_hz: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    pub outcome: TransferOutcome,
    pub frame: Frame,
    /// Present whenever the radio saw a packet, even a corrupted one.
    pub link: Option<LinkQuality>,
}

/// Counters for checking the flag discipline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RadioStats {
    pub transmits_started: u32,
    pub receives_started: u32,
    pub completions_observed: u32,
    pub rejected_before_hardware: u32,
    pub hardware_timeouts: u32,
}

#[derive(Debug)]
pub struct RadioStateMachine<R> {
    driver: R,
    flag: CompletionFlag,
    state: RadioState,
    stats: RadioStats,
}

impl<R: RadioDriver> RadioStateMachine<R> {
    /// Wrap `driver` and register the completion signal with it.
    pub fn new(mut driver: R) -> Self {
        let (flag, signal) = CompletionFlag::new();
        driver.register_completion(signal);
        Self {
            driver,
            flag,
            state: RadioState::Idle,
            stats: RadioStats::default(),
        }
    }

    pub fn begin(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        self.driver.begin(config)?;
        self.state = RadioState::Idle;
        self.flag.clear();
        Ok(())
    }

    /// Begin an asynchronous transmission and return immediately.
    ///
    /// Oversized payloads are rejected before the hardware is touched.
    pub fn start_transmit(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        self.ensure_idle()?;

        let max = self.driver.max_frame_len().min(MAX_FRAME_LEN);
        if payload.len() > max {
            self.stats.rejected_before_hardware += 1;
            return Err(RadioError::PayloadTooLarge { len: payload.len(), max });
        }

        self.flag.clear();
        self.driver.start_transmit(payload)?;
        self.state = RadioState::TransmitPending;
        self.stats.transmits_started += 1;
        debug!("Transmit of {} bytes started", payload.len());
        Ok(())
    }

    /// Begin listening and return immediately.
    pub fn start_receive(&mut self) -> Result<(), RadioError> {
        self.ensure_idle()?;
        self.flag.clear();
        self.driver.start_receive()?;
        self.state = RadioState::ReceivePending;
        self.stats.receives_started += 1;
        debug!("Receive started");
        Ok(())
    }

    /// Check for completion of the pending operation.
    ///
    /// Consumes the completion flag at most once per operation. Returns
    /// `WouldBlock` while the interrupt has not fired yet.
    pub fn poll_completion(&mut self) -> nb::Result<Operation, RadioError> {
        match self.state {
            RadioState::Idle => Err(nb::Error::Other(RadioError::NothingPending)),
            RadioState::TransmitComplete => Ok(Operation::Transmit),
            RadioState::ReceiveComplete => Ok(Operation::Receive),
            RadioState::TransmitPending | RadioState::ReceivePending => {
                if !self.flag.take() {
                    return Err(nb::Error::WouldBlock);
                }
                self.stats.completions_observed += 1;
                let op = if self.state == RadioState::TransmitPending {
                    self.state = RadioState::TransmitComplete;
                    Operation::Transmit
                } else {
                    self.state = RadioState::ReceiveComplete;
                    Operation::Receive
                };
                debug!("{:?} completion observed", op);
                Ok(op)
            }
        }
    }

    /// Clean up a completed transmission and report how it went.
    pub fn finish_transmit(&mut self) -> Result<TransferOutcome, RadioError> {
        if self.state != RadioState::TransmitComplete {
            return Err(RadioError::NotComplete(self.state));
        }
        let result = self.driver.finish_transmit();
        self.state = RadioState::Idle;
        if let Err(e) = &result {
            warn!("Transmission failed: {}", e);
        }
        Ok(TransferOutcome::from(&result))
    }

    /// Fetch a completed reception together with its link metadata.
    pub fn read_data(&mut self) -> Result<Reception, RadioError> {
        if self.state != RadioState::ReceiveComplete {
            return Err(RadioError::NotComplete(self.state));
        }

        let mut buf = [0u8; MAX_FRAME_LEN];
        let result = self.driver.read_data(&mut buf);
        self.state = RadioState::Idle;

        let outcome = TransferOutcome::from(&result);
        // A driver may report more than it wrote; keep what fits the buffer.
        let frame = match result {
            Ok(len) => Frame::from_slice(&buf[..len.min(MAX_FRAME_LEN)]).unwrap_or_default(),
            Err(_) => Frame::new(),
        };

        // Metadata is meaningful for good and corrupted packets, not for an
        // empty receive window.
        let link = match outcome {
            TransferOutcome::Success | TransferOutcome::ChecksumMismatch => Some(LinkQuality {
                rssi_dbm: self.driver.rssi(),
                snr_db: self.driver.snr(),
                frequency_error_hz: self.driver.frequency_error(),
            }),
            _ => None,
        };

        if let Err(e) = &result {
            warn!("Reception failed: {}", e);
        }

        Ok(Reception { outcome, frame, link })
    }

    /// The pending operation ran past its hardware timeout: put the radio in
    /// standby, drop any late completion and return to idle.
    pub fn expire(&mut self) -> TransferOutcome {
        if let Err(e) = self.driver.standby() {
            warn!("Standby after timeout failed: {}", e);
        }
        self.flag.clear();
        self.state = RadioState::Idle;
        self.stats.hardware_timeouts += 1;
        TransferOutcome::Timeout
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, RadioState::TransmitPending | RadioState::ReceivePending)
    }

    pub fn completion_flag(&self) -> &CompletionFlag {
        &self.flag
    }

    pub fn stats(&self) -> RadioStats {
        self.stats
    }

    pub fn driver(&self) -> &R {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut R {
        &mut self.driver
    }

    fn ensure_idle(&self) -> Result<(), RadioError> {
        if self.state == RadioState::Idle {
            Ok(())
        } else {
            Err(RadioError::Busy(self.state))
        }
    }
}

/// LoRa time on air in microseconds for a `payload_len`-byte packet (SX127x
/// datasheet, explicit header).
pub fn time_on_air_us(config: &RadioConfig, payload_len: usize) -> u64 {
    let sf = f64::from(config.spreading_factor);
    let bw_hz = f64::from(config.bandwidth_khz) * 1000.0;
    let symbol_us = (2f64.powi(i32::from(config.spreading_factor)) / bw_hz) * 1_000_000.0;

    // Low data rate optimisation is mandated above 16 ms symbols.
    let de = if symbol_us > 16_000.0 { 1.0 } else { 0.0 };
    let crc = if config.crc { 1.0 } else { 0.0 };
    let cr = f64::from(config.coding_rate.saturating_sub(4));

    let preamble_us = (f64::from(config.preamble_length) + 4.25) * symbol_us;
    let numerator = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + 16.0 * crc;
    let denominator = 4.0 * (sf - 2.0 * de);
    let payload_symbols = 8.0 + ((numerator / denominator).ceil() * (cr + 4.0)).max(0.0);

    (preamble_us + payload_symbols * symbol_us).round() as u64
}
