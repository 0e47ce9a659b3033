//! Virtual time for the simulated board.
//!
//! Nothing advances on its own: busy-waits and deep sleeps move the clock
//! forward, and any radio interrupt that falls due on the way is delivered by
//! raising its completion signal, just as the DIO line would.

use crate::completion::CompletionSignal;
use crate::hal::{LowPowerSleep, ReferenceClock, ReferenceClockError};
use embedded_hal::delay::DelayNs;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqHandle(u32);

#[derive(Debug)]
struct PendingIrq {
    handle: IrqHandle,
    due_us: u64,
    signal: CompletionSignal,
}

#[derive(Debug, Default)]
struct ClockState {
    now_us: u64,
    next_handle: u32,
    pending: Vec<PendingIrq>,
    delivered: u32,
}

/// Shared handle to the board's wall clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    inner: Rc<RefCell<ClockState>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_us(&self) -> u64 {
        self.inner.borrow().now_us
    }

    pub fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }

    /// Move time forward, delivering every interrupt that falls due.
    pub fn advance_us(&self, us: u64) {
        let due = {
            let mut state = self.inner.borrow_mut();
            state.now_us = state.now_us.saturating_add(us);
            let now = state.now_us;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.pending.drain(..).partition(|irq| irq.due_us <= now);
            state.pending = pending;
            state.delivered += due.len() as u32;
            due
        };
        for irq in due {
            irq.signal.raise();
        }
    }

    pub fn schedule_irq(&self, after_us: u64, signal: CompletionSignal) -> IrqHandle {
        let mut state = self.inner.borrow_mut();
        let handle = IrqHandle(state.next_handle);
        state.next_handle = state.next_handle.wrapping_add(1);
        let due_us = state.now_us.saturating_add(after_us);
        state.pending.push(PendingIrq { handle, due_us, signal });
        handle
    }

    pub fn cancel_irq(&self, handle: IrqHandle) {
        self.inner
            .borrow_mut()
            .pending
            .retain(|irq| irq.handle != handle);
    }

    pub fn pending_irqs(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn delivered_irqs(&self) -> u32 {
        self.inner.borrow().delivered
    }
}

/// System-timer busy-wait. Accurate by construction.
#[derive(Debug, Clone)]
pub struct SimDelay {
    clock: SimClock,
    remainder_ns: u32,
}

impl SimDelay {
    pub fn new(clock: SimClock) -> Self {
        Self { clock, remainder_ns: 0 }
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        let total = u64::from(self.remainder_ns) + u64::from(ns);
        self.remainder_ns = (total % 1000) as u32;
        self.clock.advance_us(total / 1000);
    }

    fn delay_us(&mut self, us: u32) {
        self.clock.advance_us(u64::from(us));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.clock.advance_us(u64::from(ms) * 1000);
    }
}

/// RTC clocked from the RC oscillator. Counts `rate` ticks per real millisecond.
#[derive(Debug)]
pub struct SimReferenceClock {
    clock: SimClock,
    rate: f64,
    available: bool,
    started_at_us: Option<u64>,
}

impl SimReferenceClock {
    pub fn new(clock: SimClock, rate: f64) -> Self {
        Self {
            clock,
            rate,
            available: true,
            started_at_us: None,
        }
    }

    /// An RTC that never starts, as on a board without the LSE/LSI wired up.
    pub fn absent(clock: SimClock) -> Self {
        Self {
            available: false,
            ..Self::new(clock, 1.0)
        }
    }
}

impl ReferenceClock for SimReferenceClock {
    fn start(&mut self) -> Result<(), ReferenceClockError> {
        if !self.available {
            return Err(ReferenceClockError::Unavailable);
        }
        self.started_at_us = Some(self.clock.now_us());
        Ok(())
    }

    fn elapsed_ticks(&mut self) -> Result<u32, ReferenceClockError> {
        let started = self.started_at_us.ok_or(ReferenceClockError::Unavailable)?;
        let elapsed_ms = (self.clock.now_us() - started) as f64 / 1000.0;
        Ok((elapsed_ms * self.rate).floor() as u32)
    }
}

/// Deep sleep on the low-power timer, which runs off the same RC oscillator
/// as the RTC. Waking up costs `wake_latency_ms` of real time.
#[derive(Debug)]
pub struct SimSleep {
    clock: SimClock,
    rate: f64,
    wake_latency_ms: u32,
    sleeps: u32,
    requested_ms: u64,
    last_wall_us: u64,
}

impl SimSleep {
    pub fn new(clock: SimClock, rate: f64, wake_latency_ms: u32) -> Self {
        Self {
            clock,
            rate,
            wake_latency_ms,
            sleeps: 0,
            requested_ms: 0,
            last_wall_us: 0,
        }
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps
    }

    /// Sum of the timer durations passed to `sleep_ms`.
    pub fn requested_ms(&self) -> u64 {
        self.requested_ms
    }

    /// Real time the last sleep took, wake-up included.
    pub fn last_wall_us(&self) -> u64 {
        self.last_wall_us
    }
}

impl LowPowerSleep for SimSleep {
    fn sleep_ms(&mut self, ms: u32) {
        let timer_us = f64::from(ms) * 1000.0 / self.rate;
        let wake_us = u64::from(self.wake_latency_ms) * 1000;
        let wall_us = (timer_us.round() as u64).saturating_add(wake_us);
        self.sleeps += 1;
        self.requested_ms += u64::from(ms);
        self.last_wall_us = wall_us;
        self.clock.advance_us(wall_us);
    }
}
