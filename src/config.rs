//! Node configuration: sleep interval, scheduling mode and role, radio
//! parameters and calibration settings. Loaded from JSON with serde defaults
//! and checked by [`NodeConfig::validate`] before the node is built.

use crate::calibration::DEFAULT_BUSY_WAIT_MS;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const MAX_NODE_ID_LEN: usize = 16;

// Deep sleep between cycles. Sending and waiting for completion add to the
// real period on top of this.
const DEFAULT_SLEEP_INTERVAL_MS: u32 = 10_000;
const DEFAULT_WAKE_LATENCY_OFFSET_MS: u32 = 8;
// Ideal is the busy-wait length; lowering it lengthens the effective sleep.
const DEFAULT_TARGET_REFERENCE_TICKS: f64 = 7980.0;
const MIN_BUSY_WAIT_MS: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Busy-poll the completion flag inside the cycle.
    #[default]
    Polling,
    /// Return to the caller while the radio works; pick up the completion on
    /// a later loop entry.
    InterruptDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Transmitter,
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub frequency_mhz: f32,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    /// Denominator of the 4/x coding rate.
    pub coding_rate: u8,
    pub sync_word: u8,
    pub output_power_dbm: i8,
    pub preamble_length: u16,
    /// 0 selects automatic gain control.
    pub gain: u8,
    pub max_frame_len: usize,
    pub crc: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 915.0,
            bandwidth_khz: 125.0,
            spreading_factor: 9,
            coding_rate: 7,
            sync_word: 0x12,
            output_power_dbm: 17,
            preamble_length: 8,
            gain: 0,
            max_frame_len: crate::radio::MAX_FRAME_LEN,
            crc: true,
        }
    }
}

const LORA_BANDWIDTHS_KHZ: [f32; 10] = [7.8, 10.4, 15.6, 20.8, 31.25, 41.7, 62.5, 125.0, 250.0, 500.0];

impl RadioConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(137.0..=1020.0).contains(&self.frequency_mhz) {
            return Err(invalid(format!("frequency {} MHz out of range", self.frequency_mhz)));
        }
        if !LORA_BANDWIDTHS_KHZ
            .iter()
            .any(|bw| (bw - self.bandwidth_khz).abs() < 0.01)
        {
            return Err(invalid(format!("unsupported bandwidth {} kHz", self.bandwidth_khz)));
        }
        if !(6..=12).contains(&self.spreading_factor) {
            return Err(invalid(format!("spreading factor {} out of range 6-12", self.spreading_factor)));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(invalid(format!("coding rate 4/{} out of range", self.coding_rate)));
        }
        if !(2..=20).contains(&self.output_power_dbm) {
            return Err(invalid(format!("output power {} dBm out of range 2-20", self.output_power_dbm)));
        }
        if self.preamble_length < 6 {
            return Err(invalid("preamble shorter than 6 symbols".into()));
        }
        if self.gain > 6 {
            return Err(invalid(format!("gain {} out of range 0-6", self.gain)));
        }
        if self.max_frame_len == 0 || self.max_frame_len > crate::radio::MAX_FRAME_LEN {
            return Err(invalid(format!("max frame length {} out of range", self.max_frame_len)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub enabled: bool,
    /// Length of the boot-time busy-wait on the system timer.
    pub busy_wait_ms: u32,
    /// Reference ticks expected over the busy-wait.
    pub target_reference_ticks: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            busy_wait_ms: DEFAULT_BUSY_WAIT_MS,
            target_reference_ticks: DEFAULT_TARGET_REFERENCE_TICKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: ArrayString<MAX_NODE_ID_LEN>,
    pub sleep_interval_ms: u32,
    pub wake_latency_offset_ms: u32,
    pub mode: SchedulingMode,
    pub role: NodeRole,
    pub poll_interval_ms: u32,
    pub transmit_timeout_ms: u32,
    pub receive_window_ms: u32,
    pub calibration: CalibrationConfig,
    pub radio: RadioConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut node_id = ArrayString::new();
        node_id.push_str("NS001");
        Self {
            node_id,
            sleep_interval_ms: DEFAULT_SLEEP_INTERVAL_MS,
            wake_latency_offset_ms: DEFAULT_WAKE_LATENCY_OFFSET_MS,
            mode: SchedulingMode::default(),
            role: NodeRole::default(),
            poll_interval_ms: 1,
            transmit_timeout_ms: 5000,
            receive_window_ms: 5000,
            calibration: CalibrationConfig::default(),
            radio: RadioConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(invalid("node id is empty".into()));
        }
        if self.sleep_interval_ms == 0 {
            return Err(invalid("sleep interval must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll interval must be positive".into()));
        }
        if self.transmit_timeout_ms == 0 || self.receive_window_ms == 0 {
            return Err(invalid("radio timeouts must be positive".into()));
        }
        let cal = &self.calibration;
        if cal.enabled {
            if cal.busy_wait_ms < MIN_BUSY_WAIT_MS {
                return Err(invalid(format!(
                    "calibration busy-wait {} ms too short to be stable",
                    cal.busy_wait_ms
                )));
            }
            if !(cal.target_reference_ticks.is_finite() && cal.target_reference_ticks > 0.0) {
                return Err(invalid("calibration target must be positive".into()));
            }
        }
        self.radio.validate()
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_field_firmware() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id.as_str(), "NS001");
        assert_eq!(config.sleep_interval_ms, 10_000);
        assert_eq!(config.calibration.busy_wait_ms, 8000);
        assert_eq!(config.calibration.target_reference_ticks, 7980.0);
        assert_eq!(config.radio.spreading_factor, 9);
        assert_eq!(config.radio.sync_word, 0x12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = NodeConfig::from_json(
            r#"{"node_id":"GH-07","mode":"interrupt_driven","radio":{"spreading_factor":7}}"#,
        )
        .unwrap();
        assert_eq!(config.node_id.as_str(), "GH-07");
        assert_eq!(config.mode, SchedulingMode::InterruptDriven);
        assert_eq!(config.radio.spreading_factor, 7);
        assert_eq!(config.radio.bandwidth_khz, 125.0);
        assert_eq!(config.role, NodeRole::Transmitter);
    }

    #[test]
    fn test_rejects_bad_radio_parameters() {
        let mut config = NodeConfig::default();
        config.radio.spreading_factor = 13;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::default();
        config.radio.bandwidth_khz = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_calibration() {
        let mut config = NodeConfig::default();
        config.calibration.busy_wait_ms = 50;
        assert!(config.validate().is_err());

        config.calibration.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            NodeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
