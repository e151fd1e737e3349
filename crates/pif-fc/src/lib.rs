pub mod doctor;
pub mod mav;
pub mod probe;
pub mod safety;
pub mod state;

use serde::Deserialize;

pub use mav::FcLink;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    /// MAVLink endpoint. `udpin:0.0.0.0:14540` listens for a PX4 SITL instance;
    /// `serial:/dev/ttyACM0:57600` talks to a USB-attached autopilot.
    /// MAVSDK-style `udpin://host:port` is accepted too.
    pub address: String,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (autopilot side). 1/1 is PX4's default.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Companion heartbeat rate.
    pub send_heartbeat_hz: f32,

    /// Vehicle heartbeat silence after which the link reports disconnected.
    pub heartbeat_timeout_ms: u64,

    /// Require seeing the autopilot heartbeat before sending actions.
    pub require_heartbeat: bool,

    /// COMMAND_ACK / PARAM_VALUE wait per attempt.
    pub command_timeout_ms: u64,
    pub command_retries: u8,

    /// Offboard needs a continuous setpoint stream; the latest setpoint is
    /// re-sent at this rate.
    pub setpoint_rate_hz: f32,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            address: "udpin:0.0.0.0:14540".into(),
            sys_id: 245,
            comp_id: 190,
            target_sys: 1,
            target_comp: 1,
            send_heartbeat_hz: 1.0,
            heartbeat_timeout_ms: 3000,
            require_heartbeat: true,
            command_timeout_ms: 1500,
            command_retries: 3,
            setpoint_rate_hz: 20.0,
        }
    }
}

/// Accepts both the mavlink crate's `udpin:host:port` and the
/// `udpin://host:port` URL form ground-station tools print.
pub fn normalize_address(address: &str) -> String {
    match address.split_once("://") {
        Some((scheme, rest)) => format!("{}:{}", scheme, rest),
        None => address.to_string(),
    }
}
