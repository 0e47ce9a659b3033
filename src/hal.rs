//! Collaborator interfaces the duty-cycle core talks to.
//!
//! Everything behind these traits is thin I/O: register-level sensor access,
//! the radio's physical layer, the RTC and the low-power entry sequence. The
//! core never touches hardware directly, so the same scheduler runs against a
//! real board or against [`crate::sim`].
//!
//! Busy-waits use [`embedded_hal::delay::DelayNs`] and chip-select lines use
//! [`embedded_hal::digital::OutputPin`] (see [`crate::bus::ActiveLow`]).

use crate::completion::CompletionSignal;
use crate::config::RadioConfig;
use crate::payload::SensorSample;
use crate::radio::RadioError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor did not respond, check wiring")]
    NotResponding,
    #[error("sensor bus transfer failed: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReferenceClockError {
    #[error("reference clock unavailable")]
    Unavailable,
}

/// Temperature / humidity / pressure sensor sharing the bus with the radio.
///
/// Every method performs bus transactions, so callers must hold the sensor's
/// chip-select for the duration of the call.
pub trait EnvironmentalSensor {
    fn begin(&mut self) -> Result<(), SensorError>;
    fn read_sample(&mut self) -> Result<SensorSample, SensorError>;
    /// Put the sensor in its lowest-power mode until the next forced read.
    fn enter_low_power(&mut self) -> Result<(), SensorError>;
}

/// Non-blocking packet radio.
///
/// `start_*` return as soon as the hardware has latched the operation. The
/// driver raises the registered [`CompletionSignal`] exactly once per started
/// operation, from interrupt context, and does nothing else there.
pub trait RadioDriver {
    fn begin(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    /// Largest frame the hardware FIFO accepts, in bytes.
    fn max_frame_len(&self) -> usize;

    /// Install the completion callback. Called once at boot.
    fn register_completion(&mut self, signal: CompletionSignal);

    fn start_transmit(&mut self, payload: &[u8]) -> Result<(), RadioError>;

    /// Clean up after a finished transmission: transmitter off, RF switch
    /// powered down. Reports the hardware's verdict on the transfer.
    fn finish_transmit(&mut self) -> Result<(), RadioError>;

    fn start_receive(&mut self) -> Result<(), RadioError>;

    /// Copy the received frame into `buf`, returning its length.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, RadioError>;

    /// RSSI of the last received packet, dBm.
    fn rssi(&mut self) -> f32;
    /// SNR of the last received packet, dB.
    fn snr(&mut self) -> f32;
    /// Frequency error of the last received packet, Hz.
    fn frequency_error(&mut self) -> f32;

    /// Abort whatever the radio is doing and return to standby.
    fn standby(&mut self) -> Result<(), RadioError>;
}

/// Accurate reference clock (RTC) used only during calibration.
pub trait ReferenceClock {
    /// Reset the tick counter to zero and start counting.
    fn start(&mut self) -> Result<(), ReferenceClockError>;
    /// Ticks elapsed since [`ReferenceClock::start`]; one tick is nominally 1 ms.
    fn elapsed_ticks(&mut self) -> Result<u32, ReferenceClockError>;
}

/// Deep-sleep entry on the uncalibrated low-power timer.
pub trait LowPowerSleep {
    /// Halt the main clock domain for `ms` low-power timer milliseconds.
    /// Returns at the instruction after the call once the timer fires.
    fn sleep_ms(&mut self, ms: u32);
}

/// Internal voltage reference, telemetry only.
pub trait SupplyMonitor {
    fn read_vref_mv(&mut self) -> i32;
}
