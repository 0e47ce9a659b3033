//! Simulated environmental sensor and supply monitor.
//!
//! The sensor returns a fixed sample and checks it is selected on the bus for
//! every access. Failures are injected through its public knobs.

use super::pins::BusProbe;
use crate::bus::Peripheral;
use crate::hal::{EnvironmentalSensor, SensorError, SupplyMonitor};
use crate::payload::SensorSample;

/// BME280-style sensor returning a fixed sample.
#[derive(Debug)]
pub struct SimSensor {
    probe: BusProbe,
    pub sample: SensorSample,
    pub fail_begin: bool,
    /// Number of upcoming reads that fail.
    pub failing_reads: u32,
    begin_calls: u32,
    reads: u32,
    low_power_entries: u32,
}

impl SimSensor {
    pub fn new(probe: BusProbe, sample: SensorSample) -> Self {
        Self {
            probe,
            sample,
            fail_begin: false,
            failing_reads: 0,
            begin_calls: 0,
            reads: 0,
            low_power_entries: 0,
        }
    }

    pub fn begin_calls(&self) -> u32 {
        self.begin_calls
    }

    pub fn reads(&self) -> u32 {
        self.reads
    }

    pub fn low_power_entries(&self) -> u32 {
        self.low_power_entries
    }
}

impl EnvironmentalSensor for SimSensor {
    fn begin(&mut self) -> Result<(), SensorError> {
        self.probe.require(Peripheral::Sensor, "sensor begin");
        self.begin_calls += 1;
        if self.fail_begin {
            return Err(SensorError::NotResponding);
        }
        Ok(())
    }

    fn read_sample(&mut self) -> Result<SensorSample, SensorError> {
        self.probe.require(Peripheral::Sensor, "sensor read");
        self.reads += 1;
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(SensorError::Bus("no ack on measurement register".into()));
        }
        Ok(self.sample)
    }

    fn enter_low_power(&mut self) -> Result<(), SensorError> {
        self.probe.require(Peripheral::Sensor, "sensor sleep");
        self.low_power_entries += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimSupply {
    pub vref_mv: i32,
}

impl SupplyMonitor for SimSupply {
    fn read_vref_mv(&mut self) -> i32 {
        self.vref_mv
    }
}
