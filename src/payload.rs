//! Sensor sample and the wire record built from it.
//!
//! The record is a small JSON array the gateway already understands:
//!
//! ```text
//! [{"h":4512,"t":2150,"p":10132,"vcc":3300},{"node":"NS001"}]
//! ```
//!
//! Humidity and temperature are hundredths, pressure is pascal / 10.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_PAYLOAD_LEN: usize = 256;

const_assert!(MAX_PAYLOAD_LEN >= crate::radio::MAX_FRAME_LEN);

pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub temperature_c: f32,
    pub humidity_rh: f32,
    pub pressure_pa: f32,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("encoded record is {len} bytes, buffer holds {max}")]
    TooLarge { len: usize, max: usize },
}

/// Turns a sample into bytes for the radio.
pub trait PayloadEncoder {
    fn encode(&self, sample: &SensorSample, vcc_mv: i32, node_id: &str) -> Result<Payload, PayloadError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadEncoder;

#[derive(Serialize)]
struct Reading {
    h: u16,
    t: i16,
    p: u16,
    vcc: i32,
}

#[derive(Serialize)]
struct NodeTag<'a> {
    node: &'a str,
}

impl PayloadEncoder for JsonPayloadEncoder {
    fn encode(&self, sample: &SensorSample, vcc_mv: i32, node_id: &str) -> Result<Payload, PayloadError> {
        // Float-to-int casts saturate, which is what we want at sensor limits.
        let reading = Reading {
            h: (sample.humidity_rh * 100.0).round() as u16,
            t: (sample.temperature_c * 100.0).round() as i16,
            p: (sample.pressure_pa / 10.0).round() as u16,
            vcc: vcc_mv,
        };
        let text = serde_json::to_vec(&(reading, NodeTag { node: node_id }))?;

        Payload::from_slice(&text).map_err(|()| PayloadError::TooLarge {
            len: text.len(),
            max: MAX_PAYLOAD_LEN,
        })
    }
}
