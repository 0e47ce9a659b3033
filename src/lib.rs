//! # Sensor Node Duty Cycle
//!
//! Duty-cycle controller for a battery-powered LoRa environmental sensor node:
//! wake, sample, transmit, deep-sleep, repeat.
//!
//! ## Features
//!
//! - **Sleep calibration**: boot-time measurement of the RC-clocked low-power
//!   timer against the system timer, applied to every deep sleep
//! - **Shared-bus arbitration**: sensor and radio never selected together
//! - **Non-blocking radio**: start, poll a completion flag raised from the
//!   interrupt, then finish or read
//! - **Two scheduling modes**: busy-polling or interrupt-driven loop entries
//! - **Simulation**: a deterministic virtual-time board for desktop runs
//!
//! ## Quick Start
//!
//! ```rust
//! use sensornode::config::NodeConfig;
//! use sensornode::scheduler::DutyCycleScheduler;
//! use sensornode::sim::{SimBoard, SimBoardOptions};
//!
//! let config = NodeConfig::default();
//! let (_board, parts) = SimBoard::build(&config, &SimBoardOptions::default()).unwrap();
//! let mut scheduler = DutyCycleScheduler::new(parts, config).unwrap();
//! scheduler.boot().unwrap();
//!
//! let reports = scheduler.run(2).unwrap();
//! assert_eq!(reports.len(), 2);
//! ```
//!
//! ## Architecture
//!
//! - [`hal`] - Traits for the sensor, radio, clocks and sleep
//! - [`calibration`] - Correction factor and corrected sleep durations
//! - [`bus`] - Chip-select arbitration
//! - [`completion`] - Interrupt-to-main-loop flag
//! - [`radio`] - Transmit/receive state machine
//! - [`node`] - Peripheral ownership and boot
//! - [`scheduler`] - The duty cycle itself
//! - [`sim`] - Simulated board

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod bus;
pub mod calibration;
pub mod completion;
pub mod config;
pub mod hal;
pub mod node;
pub mod payload;
pub mod radio;
pub mod scheduler;
pub mod sim;

// Re-export main public types for convenience
pub use calibration::{ClockCalibrator, CorrectionFactor, SleepPlan};
pub use config::NodeConfig;
pub use node::{Node, NodeError, NodeParts, Platform};
pub use radio::{RadioStateMachine, TransferOutcome};
pub use scheduler::{CycleReport, DutyCycleScheduler};
