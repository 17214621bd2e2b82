use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use simd_json::prelude::*;
use simd_json::BorrowedValue;

use crate::error::TrackingError;

/// One IMU reading as sent by the tracker boards:
/// `{"type":"IMU","cam_id":"A","rot_x":..,"rot_y":..,"rot_z":..,"loc_x":..,"loc_y":..,"loc_z":..,"timestamp":..}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImuSample {
    pub cam_id: Option<String>,
    /// Degrees. Present only if all three axes were.
    pub rotation: Option<[f64; 3]>,
    pub location: Option<[f64; 3]>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Imu(ImuSample),
    /// Valid JSON with some other (or no) `type`.
    Other { kind: Option<String> },
}

/// Parses a text message. simd-json works in place, so the text is copied
/// into a scratch buffer first.
pub fn parse_message(text: &str) -> Result<InboundMessage, TrackingError> {
    let mut bytes = text.as_bytes().to_vec();
    let tape = simd_json::to_borrowed_value(&mut bytes)?;

    let kind = tape.get("type").and_then(|v| v.as_str());
    match kind {
        Some("IMU") => Ok(InboundMessage::Imu(ImuSample {
            cam_id: tape
                .get("cam_id")
                .and_then(|v| v.as_str())
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            rotation: axes(&tape, ["rot_x", "rot_y", "rot_z"]),
            location: axes(&tape, ["loc_x", "loc_y", "loc_z"]),
            timestamp: tape.get("timestamp").and_then(|v| v.as_u64()),
        })),
        other => Ok(InboundMessage::Other {
            kind: other.map(str::to_string),
        }),
    }
}

fn axes(tape: &BorrowedValue<'_>, keys: [&str; 3]) -> Option<[f64; 3]> {
    let mut out = [0.0; 3];
    for (slot, key) in out.iter_mut().zip(keys) {
        *slot = number(tape.get(key)?)?;
    }
    Some(out)
}

// Boards send numbers, hand-written test clients sometimes send strings.
fn number(value: &BorrowedValue<'_>) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Greeting pushed to newly connected clients.
#[derive(Debug, Serialize)]
pub struct TestMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: &'a str,
    pub timestamp: u64,
}

impl<'a> TestMessage<'a> {
    pub fn new(message: &'a str, now: SystemTime) -> Self {
        let timestamp = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind: "test",
            message,
            timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String, TrackingError> {
        Ok(simd_json::to_string(self)?)
    }
}
