pub mod link;
pub mod telemetry;

pub use link::{LinkError, VehicleLink};
pub use telemetry::{BatteryState, FlightMode, Health, PositionNed, PositionNedYaw};
