//! Deterministic simulated board.
//!
//! Runs the real node and scheduler against virtual time so a full duty cycle,
//! drifting oscillator included, can be exercised on a desktop. All parts share
//! one [`SimClock`]; the [`BusProbe`] records every chip-select edge and flags
//! any device access made without exclusive selection.

pub mod clock;
pub mod pins;
pub mod radio;
pub mod sensor;

pub use clock::{SimClock, SimDelay, SimReferenceClock, SimSleep};
pub use pins::{BusProbe, LineEvent, SimPin, SimPinError};
pub use radio::{SimFrame, SimRadio};
pub use sensor::{SimSensor, SimSupply};

use crate::bus::{ActiveLow, Peripheral};
use crate::config::NodeConfig;
use crate::node::{NodeParts, Platform};
use crate::payload::{JsonPayloadEncoder, SensorSample};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SimBoardError {
    #[error(transparent)]
    Pin(#[from] SimPinError),
    #[error("timer rate {0} must be finite and positive")]
    InvalidTimerRate(f64),
}

/// Oscillator speed relative to real time. Anything but a finite positive
/// rate would stop or reverse the simulated timers.
pub fn validate_timer_rate(rate: f64) -> Result<f64, SimBoardError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(SimBoardError::InvalidTimerRate(rate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimPlatform;

impl Platform for SimPlatform {
    type Sensor = SimSensor;
    type Radio = SimRadio;
    type SensorCs = ActiveLow<SimPin>;
    type RadioCs = ActiveLow<SimPin>;
    type Clock = SimReferenceClock;
    type Delay = SimDelay;
    type Sleep = SimSleep;
    type Supply = SimSupply;
    type Encoder = JsonPayloadEncoder;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimBoardOptions {
    /// RC oscillator speed relative to real time. 1.025 runs 2.5% fast.
    pub timer_rate: f64,
    pub reference_available: bool,
    /// Real time spent waking from deep sleep.
    pub wake_latency_ms: u32,
    pub sample: SensorSample,
    pub vref_mv: i32,
}

impl Default for SimBoardOptions {
    fn default() -> Self {
        Self {
            timer_rate: 1.0,
            reference_available: true,
            wake_latency_ms: 8,
            sample: SensorSample {
                temperature_c: 21.5,
                humidity_rh: 45.12,
                pressure_pa: 101_320.0,
            },
            vref_mv: 3300,
        }
    }
}

/// Handles the test or CLI keeps after the parts move into the node.
#[derive(Debug, Clone)]
pub struct SimBoard {
    pub clock: SimClock,
    pub probe: BusProbe,
}

impl SimBoard {
    pub fn build(
        config: &NodeConfig,
        options: &SimBoardOptions,
    ) -> Result<(Self, NodeParts<SimPlatform>), SimBoardError> {
        let timer_rate = validate_timer_rate(options.timer_rate)?;
        let clock = SimClock::new();
        let probe = BusProbe::new();

        let reference_clock = if options.reference_available {
            SimReferenceClock::new(clock.clone(), timer_rate)
        } else {
            SimReferenceClock::absent(clock.clone())
        };

        let parts = NodeParts {
            sensor: SimSensor::new(probe.clone(), options.sample),
            radio: SimRadio::new(
                clock.clone(),
                probe.clone(),
                config.radio.max_frame_len,
                config.receive_window_ms,
            ),
            sensor_cs: ActiveLow::new(SimPin::new(Peripheral::Sensor, probe.clone()))?,
            radio_cs: ActiveLow::new(SimPin::new(Peripheral::Radio, probe.clone()))?,
            reference_clock,
            delay: SimDelay::new(clock.clone()),
            sleeper: SimSleep::new(clock.clone(), timer_rate, options.wake_latency_ms),
            supply: SimSupply { vref_mv: options.vref_mv },
            encoder: JsonPayloadEncoder,
        };

        Ok((Self { clock, probe }, parts))
    }
}
