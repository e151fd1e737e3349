use async_trait::async_trait;
use tokio::sync::watch;

use crate::telemetry::{BatteryState, FlightMode, Health, PositionNed, PositionNedYaw};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error("link not connected")]
    NotConnected,

    #[error("connect {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("{command} rejected by vehicle: {result}")]
    Rejected { command: String, result: String },

    #[error("no acknowledgement for {0}")]
    AckTimeout(String),

    #[error("parameter {0} not acknowledged")]
    ParamNotAcked(String),

    #[error("refusing {0}: no heartbeat seen yet")]
    NoHeartbeat(&'static str),
}

/// Flight-control client as seen by the mission core.
///
/// Streams are `watch` channels: a receiver always sees the latest value and
/// never a backlog, which is what convergence polling needs.
#[async_trait]
pub trait VehicleLink: Send + Sync {
    async fn connect(&self, address: &str) -> Result<(), LinkError>;

    fn connection_state(&self) -> watch::Receiver<bool>;

    fn health(&self) -> watch::Receiver<Health>;

    fn position_stream(&self) -> watch::Receiver<Option<PositionNed>>;

    fn flight_mode_stream(&self) -> watch::Receiver<FlightMode>;

    fn battery_stream(&self) -> watch::Receiver<Option<BatteryState>>;

    async fn set_parameter(&self, name: &str, value: f32) -> Result<(), LinkError>;

    async fn set_telemetry_rate(&self, hz: f64) -> Result<(), LinkError>;

    async fn send_position_command(&self, setpoint: PositionNedYaw) -> Result<(), LinkError>;

    async fn arm(&self) -> Result<(), LinkError>;

    async fn land(&self) -> Result<(), LinkError>;

    async fn return_to_launch(&self) -> Result<(), LinkError>;

    /// Leave offboard control; the vehicle holds position.
    async fn stop_autonomous_control(&self) -> Result<(), LinkError>;
}
