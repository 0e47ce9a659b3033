//! The node context: every peripheral the duty cycle touches, owned in one
//! place and lent to each step, plus the boot sequence.
//!
//! Each step here is one bracketed bus interaction. How steps are sequenced
//! into a cycle is [`crate::scheduler`]'s business.

use crate::bus::{BusArbitrator, BusError, ChipSelect, Peripheral};
use crate::calibration::{ClockCalibrator, SleepPlan};
use crate::config::{ConfigError, NodeConfig};
use crate::hal::{EnvironmentalSensor, LowPowerSleep, RadioDriver, ReferenceClock, SensorError, SupplyMonitor};
use crate::payload::{Payload, PayloadEncoder, SensorSample};
use crate::radio::{Operation, RadioError, RadioStateMachine, Reception, TransferOutcome};
use embedded_hal::delay::DelayNs;
use thiserror::Error;
use tracing::{debug, info, warn};

// Lets the supply and debug UART settle before anything else runs.
const BOOT_SETTLE_MS: u32 = 1000;

/// Immediate result of a `start_*` call: `Success` means the hardware took it.
pub type ImmediateStatus = TransferOutcome;

/// Failures that stop the node. Per-transfer problems are [`TransferOutcome`]s.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("sensor initialisation failed: {0}")]
    SensorInit(SensorError),
    #[error("radio initialisation failed: {0}")]
    RadioInit(RadioError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("node has not been booted")]
    NotBooted,
}

/// Concrete peripheral types of a board.
pub trait Platform {
    type Sensor: EnvironmentalSensor;
    type Radio: RadioDriver;
    type SensorCs: ChipSelect;
    type RadioCs: ChipSelect;
    type Clock: ReferenceClock;
    type Delay: DelayNs;
    type Sleep: LowPowerSleep;
    type Supply: SupplyMonitor;
    type Encoder: PayloadEncoder;
}

pub struct NodeParts<P: Platform> {
    pub sensor: P::Sensor,
    pub radio: P::Radio,
    pub sensor_cs: P::SensorCs,
    pub radio_cs: P::RadioCs,
    pub reference_clock: P::Clock,
    pub delay: P::Delay,
    pub sleeper: P::Sleep,
    pub supply: P::Supply,
    pub encoder: P::Encoder,
}

pub struct Node<P: Platform> {
    config: NodeConfig,
    sensor: P::Sensor,
    radio: RadioStateMachine<P::Radio>,
    bus: BusArbitrator<P::SensorCs, P::RadioCs>,
    calibrator: ClockCalibrator<P::Clock>,
    delay: P::Delay,
    sleeper: P::Sleep,
    supply: P::Supply,
    encoder: P::Encoder,
    booted: bool,
}

impl<P: Platform> Node<P> {
    pub fn new(parts: NodeParts<P>, config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let busy_wait_ms = config.calibration.busy_wait_ms;
        Ok(Self {
            sensor: parts.sensor,
            radio: RadioStateMachine::new(parts.radio),
            bus: BusArbitrator::new(parts.sensor_cs, parts.radio_cs),
            calibrator: ClockCalibrator::with_busy_wait(parts.reference_clock, busy_wait_ms),
            delay: parts.delay,
            sleeper: parts.sleeper,
            supply: parts.supply,
            encoder: parts.encoder,
            config,
            booted: false,
        })
    }

    /// Bring the node up. Any error here is fatal: a field device with a
    /// half-initialised radio is no use to anyone.
    pub fn boot(&mut self) -> Result<(), NodeError> {
        self.bus.deselect_all()?;
        self.delay.delay_ms(BOOT_SETTLE_MS);

        if self.config.calibration.enabled {
            info!(
                "Calibrating low-power timer over {} ms",
                self.config.calibration.busy_wait_ms
            );
            self.calibrator
                .calibrate(&mut self.delay, self.config.calibration.target_reference_ticks);
        } else {
            info!("Calibration disabled, using neutral correction");
        }

        info!("[sensor] Initializing ...");
        let sensor = &mut self.sensor;
        self.bus
            .with(Peripheral::Sensor, || sensor.begin())?
            .map_err(NodeError::SensorInit)?;
        info!("[sensor] Initialized");

        info!("[radio] Initializing ...");
        let radio = &mut self.radio;
        let radio_config = &self.config.radio;
        self.bus
            .with(Peripheral::Radio, || radio.begin(radio_config))?
            .map_err(NodeError::RadioInit)?;
        info!(
            "[radio] Initialized at {} MHz, SF{}, BW {} kHz",
            radio_config.frequency_mhz, radio_config.spreading_factor, radio_config.bandwidth_khz
        );

        self.booted = true;
        Ok(())
    }

    pub fn read_supply(&mut self) -> i32 {
        self.supply.read_vref_mv()
    }

    /// Read the sensor, then put it to sleep. Each is its own bus transaction.
    ///
    /// A failed read is logged and yields `None`; the cycle carries on.
    pub fn sample_environment(&mut self) -> Result<Option<SensorSample>, NodeError> {
        let sensor = &mut self.sensor;
        let sample = match self.bus.with(Peripheral::Sensor, || sensor.read_sample())? {
            Ok(sample) => {
                debug!(
                    "Temperature: {:.2} C, humidity: {:.2} %, pressure: {:.0} Pa",
                    sample.temperature_c, sample.humidity_rh, sample.pressure_pa
                );
                Some(sample)
            }
            Err(e) => {
                warn!("Sensor read failed: {}", e);
                None
            }
        };

        let sensor = &mut self.sensor;
        if let Err(e) = self.bus.with(Peripheral::Sensor, || sensor.enter_low_power())? {
            warn!("Sensor did not enter low power: {}", e);
        }

        Ok(sample)
    }

    pub fn encode(&self, sample: &SensorSample, vcc_mv: i32) -> Option<Payload> {
        match self.encoder.encode(sample, vcc_mv, &self.config.node_id) {
            Ok(payload) => {
                debug!("Payload: {}", String::from_utf8_lossy(&payload));
                Some(payload)
            }
            Err(e) => {
                warn!("Payload encoding failed: {}", e);
                None
            }
        }
    }

    /// Issue a non-blocking transmit and release the radio right away.
    ///
    /// The radio latches the frame and finishes on its own, so the select is
    /// not held across the transfer.
    pub fn start_transmit(&mut self, payload: &[u8]) -> Result<ImmediateStatus, NodeError> {
        self.ensure_booted()?;
        let radio = &mut self.radio;
        let result = self.bus.with(Peripheral::Radio, || radio.start_transmit(payload))?;
        if let Err(e) = &result {
            warn!("Transmit not started: {}", e);
        }
        Ok(TransferOutcome::from(&result))
    }

    pub fn start_receive(&mut self) -> Result<ImmediateStatus, NodeError> {
        self.ensure_booted()?;
        let radio = &mut self.radio;
        let result = self.bus.with(Peripheral::Radio, || radio.start_receive())?;
        if let Err(e) = &result {
            warn!("Receive not started: {}", e);
        }
        Ok(TransferOutcome::from(&result))
    }

    /// Non-blocking completion check. Touches no bus.
    pub fn poll_radio(&mut self) -> nb::Result<Operation, RadioError> {
        self.radio.poll_completion()
    }

    /// Busy-poll for completion, giving up after `timeout_ms`.
    pub fn wait_for_completion(&mut self, timeout_ms: u32) -> Result<Operation, RadioError> {
        let step = self.config.poll_interval_ms;
        let mut waited = 0u32;
        loop {
            match self.radio.poll_completion() {
                Ok(op) => return Ok(op),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {
                    if waited >= timeout_ms {
                        return Err(RadioError::Timeout);
                    }
                    self.delay.delay_ms(step);
                    waited = waited.saturating_add(step);
                }
            }
        }
    }

    pub fn finish_transmit(&mut self) -> Result<TransferOutcome, NodeError> {
        let radio = &mut self.radio;
        let result = self.bus.with(Peripheral::Radio, || radio.finish_transmit())?;
        Ok(result.unwrap_or_else(|e| {
            warn!("finish_transmit refused: {}", e);
            TransferOutcome::from(&e)
        }))
    }

    pub fn read_data(&mut self) -> Result<Reception, NodeError> {
        let radio = &mut self.radio;
        let result = self.bus.with(Peripheral::Radio, || radio.read_data())?;
        Ok(result.unwrap_or_else(|e| {
            warn!("read_data refused: {}", e);
            Reception {
                outcome: TransferOutcome::from(&e),
                frame: crate::radio::Frame::new(),
                link: None,
            }
        }))
    }

    /// Give up on the pending operation after its hardware timeout.
    pub fn expire_radio(&mut self) -> Result<TransferOutcome, NodeError> {
        let radio = &mut self.radio;
        Ok(self.bus.with(Peripheral::Radio, || radio.expire())?)
    }

    /// Deep-sleep for the configured interval, corrected for clock drift.
    pub fn sleep(&mut self) -> SleepPlan {
        let plan = self.calibrator.plan_sleep(
            self.config.sleep_interval_ms,
            self.config.wake_latency_offset_ms,
        );
        match plan {
            SleepPlan::Sleep { ms } => {
                debug!("Sleeping {} ms", ms);
                self.sleeper.sleep_ms(ms);
            }
            SleepPlan::Skip { corrected_ms } => {
                debug!("Corrected sleep {} ms, skipping low power", corrected_ms);
            }
        }
        plan
    }

    /// Short wait between loop entries while the radio works.
    pub fn idle(&mut self) {
        self.delay.delay_ms(self.config.poll_interval_ms);
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn calibrator(&self) -> &ClockCalibrator<P::Clock> {
        &self.calibrator
    }

    /// Run calibration again, e.g. after a large temperature swing.
    pub fn recalibrate(&mut self) {
        self.calibrator
            .calibrate(&mut self.delay, self.config.calibration.target_reference_ticks);
    }

    pub fn radio(&self) -> &RadioStateMachine<P::Radio> {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut RadioStateMachine<P::Radio> {
        &mut self.radio
    }

    pub fn bus(&self) -> &BusArbitrator<P::SensorCs, P::RadioCs> {
        &self.bus
    }

    pub fn sensor(&self) -> &P::Sensor {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut P::Sensor {
        &mut self.sensor
    }

    pub fn sleeper(&self) -> &P::Sleep {
        &self.sleeper
    }

    fn ensure_booted(&self) -> Result<(), NodeError> {
        if self.booted {
            Ok(())
        } else {
            Err(NodeError::NotBooted)
        }
    }
}
