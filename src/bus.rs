//! Shared SPI bus arbitration.
//!
//! The sensor and the radio share SCK/MISO/MOSI and each has its own
//! active-low chip-select. Only one may be selected at a time. The arbitrator
//! owns both lines, so the deselect-before-select order is enforced here and
//! nowhere else.

use embedded_hal::digital::OutputPin;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Peripheral {
    Sensor,
    Radio,
}

impl Peripheral {
    pub fn other(self) -> Self {
        match self {
            Peripheral::Sensor => Peripheral::Radio,
            Peripheral::Radio => Peripheral::Sensor,
        }
    }
}

/// Which peripheral currently owns the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BusSelection {
    #[default]
    None,
    Sensor,
    Radio,
}

impl From<Peripheral> for BusSelection {
    fn from(peripheral: Peripheral) -> Self {
        match peripheral {
            Peripheral::Sensor => BusSelection::Sensor,
            Peripheral::Radio => BusSelection::Radio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("chip-select line of the {0:?} did not switch")]
    Pin(Peripheral),
    /// Both lines asserted at once. A programming error, never recoverable.
    #[error("bus contention: both chip-selects asserted")]
    Contention,
}

/// One chip-select line.
pub trait ChipSelect {
    type Error: core::fmt::Debug;

    fn assert_line(&mut self) -> Result<(), Self::Error>;
    fn deassert_line(&mut self) -> Result<(), Self::Error>;
    fn is_asserted(&self) -> bool;
}

/// Active-low chip-select on a GPIO output: low selects, high releases.
#[derive(Debug)]
pub struct ActiveLow<P> {
    pin: P,
    asserted: bool,
}

impl<P: OutputPin> ActiveLow<P> {
    /// Takes the pin and drives it high (deselected).
    pub fn new(mut pin: P) -> Result<Self, P::Error> {
        pin.set_high()?;
        Ok(Self { pin, asserted: false })
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }

    pub fn into_inner(self) -> P {
        self.pin
    }
}

impl<P: OutputPin> ChipSelect for ActiveLow<P> {
    type Error = P::Error;

    fn assert_line(&mut self) -> Result<(), Self::Error> {
        self.pin.set_low()?;
        self.asserted = true;
        Ok(())
    }

    fn deassert_line(&mut self) -> Result<(), Self::Error> {
        self.pin.set_high()?;
        self.asserted = false;
        Ok(())
    }

    fn is_asserted(&self) -> bool {
        self.asserted
    }
}

#[derive(Debug)]
pub struct BusArbitrator<S, R> {
    sensor_cs: S,
    radio_cs: R,
    selection: BusSelection,
    switch_count: u32,
}

impl<S: ChipSelect, R: ChipSelect> BusArbitrator<S, R> {
    pub fn new(sensor_cs: S, radio_cs: R) -> Self {
        Self {
            sensor_cs,
            radio_cs,
            selection: BusSelection::None,
            switch_count: 0,
        }
    }

    /// Give the bus to `peripheral`.
    ///
    /// The other line is always released first, then this one asserted. If
    /// the release fails the requested line is left alone.
    pub fn select(&mut self, peripheral: Peripheral) -> Result<(), BusError> {
        if self.selection == BusSelection::from(peripheral) && self.line_asserted(peripheral) {
            return Ok(());
        }

        self.deassert(peripheral.other())?;
        if self.line_asserted(peripheral.other()) {
            error!("{:?} still selected after release", peripheral.other());
            return Err(BusError::Contention);
        }

        self.assert(peripheral)?;
        self.selection = BusSelection::from(peripheral);
        self.switch_count = self.switch_count.wrapping_add(1);
        trace!("bus -> {:?}", peripheral);

        debug_assert!(
            !(self.sensor_cs.is_asserted() && self.radio_cs.is_asserted()),
            "both chip-selects asserted after selecting {:?}",
            peripheral
        );
        Ok(())
    }

    /// Release `peripheral` if it holds the bus.
    pub fn deselect(&mut self, peripheral: Peripheral) -> Result<(), BusError> {
        self.deassert(peripheral)?;
        if self.selection == BusSelection::from(peripheral) {
            self.selection = BusSelection::None;
        }
        Ok(())
    }

    /// Release both lines. Both are attempted even if the first fails.
    pub fn deselect_all(&mut self) -> Result<(), BusError> {
        let sensor = self.deassert(Peripheral::Sensor);
        let radio = self.deassert(Peripheral::Radio);
        self.selection = BusSelection::None;
        sensor.and(radio)
    }

    /// Scoped acquisition: selected now, released when the guard drops.
    pub fn acquire(&mut self, peripheral: Peripheral) -> Result<BusGuard<'_, S, R>, BusError> {
        self.select(peripheral)?;
        Ok(BusGuard {
            bus: self,
            peripheral,
            released: false,
        })
    }

    /// Run `f` with `peripheral` selected, releasing on every exit path.
    pub fn with<T>(&mut self, peripheral: Peripheral, f: impl FnOnce() -> T) -> Result<T, BusError> {
        let guard = self.acquire(peripheral)?;
        let value = f();
        guard.release()?;
        Ok(value)
    }

    pub fn selection(&self) -> BusSelection {
        self.selection
    }

    /// Number of successful selects since construction.
    pub fn switch_count(&self) -> u32 {
        self.switch_count
    }

    pub fn line_asserted(&self, peripheral: Peripheral) -> bool {
        match peripheral {
            Peripheral::Sensor => self.sensor_cs.is_asserted(),
            Peripheral::Radio => self.radio_cs.is_asserted(),
        }
    }

    pub fn sensor_line(&self) -> &S {
        &self.sensor_cs
    }

    pub fn radio_line(&self) -> &R {
        &self.radio_cs
    }

    fn assert(&mut self, peripheral: Peripheral) -> Result<(), BusError> {
        let result = match peripheral {
            Peripheral::Sensor => self.sensor_cs.assert_line().map_err(|e| format!("{e:?}")),
            Peripheral::Radio => self.radio_cs.assert_line().map_err(|e| format!("{e:?}")),
        };
        result.map_err(|e| {
            error!("Failed to assert {:?} chip-select: {}", peripheral, e);
            BusError::Pin(peripheral)
        })
    }

    fn deassert(&mut self, peripheral: Peripheral) -> Result<(), BusError> {
        let result = match peripheral {
            Peripheral::Sensor => self.sensor_cs.deassert_line().map_err(|e| format!("{e:?}")),
            Peripheral::Radio => self.radio_cs.deassert_line().map_err(|e| format!("{e:?}")),
        };
        result.map_err(|e| {
            error!("Failed to release {:?} chip-select: {}", peripheral, e);
            BusError::Pin(peripheral)
        })
    }
}

/// Holds a peripheral selected; releases it on drop.
pub struct BusGuard<'a, S: ChipSelect, R: ChipSelect> {
    bus: &'a mut BusArbitrator<S, R>,
    peripheral: Peripheral,
    released: bool,
}

impl<S: ChipSelect, R: ChipSelect> BusGuard<'_, S, R> {
    pub fn peripheral(&self) -> Peripheral {
        self.peripheral
    }

    /// Release now and report whether the line actually switched.
    pub fn release(mut self) -> Result<(), BusError> {
        self.released = true;
        self.bus.deselect(self.peripheral)
    }
}

impl<S: ChipSelect, R: ChipSelect> Drop for BusGuard<'_, S, R> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.bus.deselect(self.peripheral) {
                error!("Releasing {:?} on drop failed: {}", self.peripheral, e);
            }
        }
    }
}
