//! Chip-select GPIOs and a probe that watches the shared bus.

use crate::bus::Peripheral;
use embedded_hal::digital::{ErrorKind, ErrorType, OutputPin};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SimPinError {
    /// The line did not follow the write.
    #[error("{0:?} chip-select stuck")]
    Stuck(Peripheral),
}

impl embedded_hal::digital::Error for SimPinError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    pub peripheral: Peripheral,
    pub selected: bool,
}

#[derive(Debug, Default)]
struct ProbeState {
    // Indexed by `slot`; true while the line is low.
    selected: [bool; 2],
    stuck: [bool; 2],
    events: Vec<LineEvent>,
    peak_selected: usize,
    violations: Vec<String>,
}

fn slot(peripheral: Peripheral) -> usize {
    match peripheral {
        Peripheral::Sensor => 0,
        Peripheral::Radio => 1,
    }
}

/// Logic-analyser view of both chip-select lines.
#[derive(Debug, Clone, Default)]
pub struct BusProbe {
    inner: Rc<RefCell<ProbeState>>,
}

impl BusProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn drive(&self, peripheral: Peripheral, selected: bool) -> Result<(), SimPinError> {
        let mut state = self.inner.borrow_mut();
        if state.stuck[slot(peripheral)] {
            return Err(SimPinError::Stuck(peripheral));
        }
        state.selected[slot(peripheral)] = selected;
        state.events.push(LineEvent { peripheral, selected });
        let now = state.selected.iter().filter(|s| **s).count();
        state.peak_selected = state.peak_selected.max(now);
        Ok(())
    }

    /// Called by a simulated device on every bus access it makes. Records a
    /// violation unless `peripheral` alone is selected.
    pub fn require(&self, peripheral: Peripheral, what: &str) {
        let mut state = self.inner.borrow_mut();
        let own = state.selected[slot(peripheral)];
        let other = state.selected[slot(peripheral.other())];
        if !own || other {
            let violation = format!("{what} with sensor={} radio={}", state.selected[0], state.selected[1]);
            error!("Bus violation: {}", violation);
            state.violations.push(violation);
        }
    }

    pub fn is_selected(&self, peripheral: Peripheral) -> bool {
        self.inner.borrow().selected[slot(peripheral)]
    }

    /// Most lines ever low at the same time.
    pub fn peak_selected(&self) -> usize {
        self.inner.borrow().peak_selected
    }

    pub fn events(&self) -> Vec<LineEvent> {
        self.inner.borrow().events.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.inner.borrow().violations.clone()
    }

    /// Make writes to `peripheral`'s line fail from now on.
    pub fn set_stuck(&self, peripheral: Peripheral, stuck: bool) {
        self.inner.borrow_mut().stuck[slot(peripheral)] = stuck;
    }
}

/// A chip-select output pin wired to the probe.
#[derive(Debug, Clone)]
pub struct SimPin {
    peripheral: Peripheral,
    probe: BusProbe,
}

impl SimPin {
    pub fn new(peripheral: Peripheral, probe: BusProbe) -> Self {
        Self { peripheral, probe }
    }
}

impl ErrorType for SimPin {
    type Error = SimPinError;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.probe.drive(self.peripheral, true)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.probe.drive(self.peripheral, false)
    }
}
