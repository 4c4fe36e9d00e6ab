//! # Telemetry Messages
//!
//! The simulator talks in event frames of the form `42["<event>",{...}]`. Inbound frames carry
//! vehicle telemetry, outbound frames carry the steering command plus some diagnostic paths for
//! display.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Prefix of every frame that carries an event.
const EVENT_PREFIX: &str = "42";

/// Name of the inbound telemetry event.
pub const TELEMETRY_EVENT: &str = "telemetry";

/// Name of the outbound steering event.
pub const STEER_EVENT: &str = "steer";

/// Name of the outbound event handing control back to the simulator.
pub const MANUAL_EVENT: &str = "manual";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Vehicle telemetry as reported by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Waypoint x coordinates in the map frame.
    ///
    /// Units: meters
    pub ptsx: Vec<f64>,

    /// Waypoint y coordinates in the map frame.
    ///
    /// Units: meters
    pub ptsy: Vec<f64>,

    /// Vehicle x position in the map frame.
    ///
    /// Units: meters
    pub x: f64,

    /// Vehicle y position in the map frame.
    ///
    /// Units: meters
    pub y: f64,

    /// Vehicle heading in the map frame.
    ///
    /// Units: radians
    pub psi: f64,

    /// Vehicle speed.
    ///
    /// Units: miles per hour
    pub speed: f64,

    /// Last steering command applied, normalised to [-1, 1].
    pub steering_angle: f64,

    /// Last throttle command applied, normalised to [-1, 1].
    pub throttle: f64,
}

/// Steering command sent back to the simulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteerCmd {
    /// Normalised steering, [-1, 1].
    pub steering_angle: f64,

    /// Normalised throttle (negative is braking), [-1, 1].
    pub throttle: f64,

    /// Predicted trajectory x coordinates, vehicle frame.
    pub mpc_x: Vec<f64>,

    /// Predicted trajectory y coordinates, vehicle frame.
    pub mpc_y: Vec<f64>,

    /// Reference waypoint x coordinates, vehicle frame.
    pub next_x: Vec<f64>,

    /// Reference waypoint y coordinates, vehicle frame.
    pub next_y: Vec<f64>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// An event decoded from an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// Telemetry for one control cycle.
    Telemetry(Telemetry),

    /// The frame carried no data, the simulator is in manual mode.
    Manual,

    /// An event this software doesn't handle.
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TelemParseError {
    #[error("The frame has no event payload")]
    NoPayload,

    #[error("Could not parse the frame payload: {0}")]
    JsonError(serde_json::Error),

    #[error("The frame payload is not an [event, data] array")]
    NotAnEvent,

    #[error("Could not deserialise the telemetry data: {0}")]
    TelemetryError(serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TelemFormatError {
    #[error("Could not serialise the steering command: {0}")]
    SerialiseError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Parse an inbound frame.
///
/// Returns `Ok(None)` for frames which aren't events (anything not starting with `42`), which
/// are to be ignored.
pub fn parse_frame(frame: &str) -> Result<Option<SimEvent>, TelemParseError> {
    let frame = frame.trim();

    if frame.len() <= EVENT_PREFIX.len() || !frame.starts_with(EVENT_PREFIX) {
        return Ok(None);
    }

    // A null anywhere in the frame means the simulator has no data for us
    if frame.contains("null") {
        return Ok(Some(SimEvent::Manual));
    }

    let payload = extract_payload(&frame[EVENT_PREFIX.len()..]).ok_or(TelemParseError::NoPayload)?;

    let value: Value = serde_json::from_str(payload).map_err(TelemParseError::JsonError)?;

    let (event, data) = match value {
        Value::Array(mut items) if !items.is_empty() => {
            let data = if items.len() > 1 {
                items.swap_remove(1)
            } else {
                Value::Null
            };
            match &items[0] {
                Value::String(s) => (s.clone(), data),
                _ => return Err(TelemParseError::NotAnEvent),
            }
        }
        _ => return Err(TelemParseError::NotAnEvent),
    };

    if event == TELEMETRY_EVENT {
        let telem: Telemetry =
            serde_json::from_value(data).map_err(TelemParseError::TelemetryError)?;
        Ok(Some(SimEvent::Telemetry(telem)))
    } else {
        Ok(Some(SimEvent::Other(event)))
    }
}

/// Format a steering command frame.
pub fn format_steer(cmd: &SteerCmd) -> Result<String, TelemFormatError> {
    let data = serde_json::to_string(cmd).map_err(TelemFormatError::SerialiseError)?;

    Ok(format!("{}[\"{}\",{}]", EVENT_PREFIX, STEER_EVENT, data))
}

/// Format the frame which hands control back to the simulator.
pub fn format_manual() -> String {
    format!("{}[\"{}\",{{}}]", EVENT_PREFIX, MANUAL_EVENT)
}

/// Cut the JSON array out of the frame body, from the first `[` to the last `}]`.
fn extract_payload(body: &str) -> Option<&str> {
    let start = body.find('[')?;
    let end = body.rfind("}]")?;

    if end < start {
        return None;
    }

    Some(&body[start..end + 2])
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
