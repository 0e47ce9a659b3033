//! Low-power timer calibration.
//!
//! Boards without a 32 kHz crystal clock their RTC and low-power timer from
//! the internal RC oscillator, which can be several percent off. At boot we
//! busy-wait a fixed interval on the (accurate) system timer while the RTC
//! counts, and derive how many RTC milliseconds one real millisecond is worth.
//! Every deep sleep afterwards is scaled by that factor.

use crate::hal::ReferenceClock;
use embedded_hal::delay::DelayNs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Busy-wait used when the caller does not configure one.
pub const DEFAULT_BUSY_WAIT_MS: u32 = 8000;

/// Multiplier from requested sleep time to low-power timer time. Always > 0.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64")]
pub struct CorrectionFactor(f64);

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("correction factor {0} must be finite and positive")]
pub struct InvalidCorrectionFactor(pub f64);

impl CorrectionFactor {
    pub const NEUTRAL: Self = Self(1.0);

    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value > 0.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn from_sample(sample: &CalibrationSample) -> Option<Self> {
        if !(sample.nominal_duration_ms.is_finite() && sample.nominal_duration_ms > 0.0) {
            return None;
        }
        Self::new(f64::from(sample.measured_duration_ms) / sample.nominal_duration_ms)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// `round(requested_ms * factor) - fixed_offset_ms`.
    ///
    /// The offset is the wake-up latency: time the device spends awake inside
    /// the sleep call, so it comes off the timer value. The result goes
    /// negative when the offset exceeds the scaled request; see [`SleepPlan`].
    pub fn corrected_sleep_duration(self, requested_ms: u32, fixed_offset_ms: u32) -> i64 {
        let scaled = (f64::from(requested_ms) * self.0).round() as i64;
        scaled - i64::from(fixed_offset_ms)
    }

    pub fn plan_sleep(self, requested_ms: u32, fixed_offset_ms: u32) -> SleepPlan {
        SleepPlan::from_corrected(self.corrected_sleep_duration(requested_ms, fixed_offset_ms))
    }
}

impl TryFrom<f64> for CorrectionFactor {
    type Error = InvalidCorrectionFactor;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidCorrectionFactor(value))
    }
}

impl Default for CorrectionFactor {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// One calibration measurement; lives only until the factor is derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Reference ticks the busy-wait should have produced on an ideal clock.
    pub nominal_duration_ms: f64,
    /// Reference ticks actually counted over the busy-wait.
    pub measured_duration_ms: u32,
}

/// What to do with a corrected sleep duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SleepPlan {
    Sleep { ms: u32 },
    /// Corrected duration was zero or negative; do not enter low power.
    Skip { corrected_ms: i64 },
}

impl SleepPlan {
    pub fn from_corrected(corrected_ms: i64) -> Self {
        match u32::try_from(corrected_ms) {
            Ok(ms) if ms > 0 => SleepPlan::Sleep { ms },
            Ok(_) => SleepPlan::Skip { corrected_ms },
            // Beyond u32 range: clamp rather than skip.
            Err(_) if corrected_ms > 0 => SleepPlan::Sleep { ms: u32::MAX },
            Err(_) => SleepPlan::Skip { corrected_ms },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationState {
    NotRun,
    Calibrated,
    /// Reference clock missing or the measurement was unusable; factor is neutral.
    Degraded,
}

#[derive(Debug)]
pub struct ClockCalibrator<C> {
    clock: C,
    busy_wait_ms: u32,
    factor: CorrectionFactor,
    state: CalibrationState,
}

impl<C: ReferenceClock> ClockCalibrator<C> {
    pub fn new(clock: C) -> Self {
        Self::with_busy_wait(clock, DEFAULT_BUSY_WAIT_MS)
    }

    pub fn with_busy_wait(clock: C, busy_wait_ms: u32) -> Self {
        Self {
            clock,
            busy_wait_ms,
            factor: CorrectionFactor::NEUTRAL,
            state: CalibrationState::NotRun,
        }
    }

    /// Measure the reference clock over the busy-wait and store the factor.
    ///
    /// Blocks for the whole busy-wait. Never fails: a missing reference clock
    /// or an unusable measurement leaves the factor at 1.0. Calling it again
    /// later recalibrates.
    pub fn calibrate<D: DelayNs>(&mut self, delay: &mut D, target_reference_ticks: f64) {
        let measured = match self.measure(delay) {
            Ok(ticks) => ticks,
            Err(e) => {
                warn!("Calibration skipped ({}), using neutral correction", e);
                self.degrade();
                return;
            }
        };

        let sample = CalibrationSample {
            nominal_duration_ms: target_reference_ticks,
            measured_duration_ms: measured,
        };

        match CorrectionFactor::from_sample(&sample) {
            Some(factor) => {
                self.factor = factor;
                self.state = CalibrationState::Calibrated;
                info!(
                    "RTC time correction: {:.5} ({} ticks over {} expected)",
                    factor.value(),
                    sample.measured_duration_ms,
                    sample.nominal_duration_ms
                );
            }
            None => {
                warn!(
                    "Unusable calibration sample {:?}, using neutral correction",
                    sample
                );
                self.degrade();
            }
        }
    }

    fn measure<D: DelayNs>(&mut self, delay: &mut D) -> Result<u32, crate::hal::ReferenceClockError> {
        self.clock.start()?;
        delay.delay_ms(self.busy_wait_ms);
        self.clock.elapsed_ticks()
    }

    fn degrade(&mut self) {
        self.factor = CorrectionFactor::NEUTRAL;
        self.state = CalibrationState::Degraded;
    }

    pub fn factor(&self) -> CorrectionFactor {
        self.factor
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn busy_wait_ms(&self) -> u32 {
        self.busy_wait_ms
    }

    pub fn corrected_sleep_duration(&self, requested_ms: u32, fixed_offset_ms: u32) -> i64 {
        self.factor.corrected_sleep_duration(requested_ms, fixed_offset_ms)
    }

    pub fn plan_sleep(&self, requested_ms: u32, fixed_offset_ms: u32) -> SleepPlan {
        self.factor.plan_sleep(requested_ms, fixed_offset_ms)
    }

    pub fn reference_clock(&self) -> &C {
        &self.clock
    }
}
