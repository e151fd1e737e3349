use serde::{Deserialize, Serialize};

/// Position in the vehicle-local NED frame, meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionNed {
    pub north_m: f32,
    pub east_m: f32,
    pub down_m: f32,
}

impl PositionNed {
    pub const ORIGIN: PositionNed = PositionNed { north_m: 0.0, east_m: 0.0, down_m: 0.0 };

    pub fn new(north_m: f32, east_m: f32, down_m: f32) -> Self {
        Self { north_m, east_m, down_m }
    }

    /// Euclidean distance over all three axes.
    pub fn distance_to(&self, other: &PositionNed) -> f32 {
        let dn = self.north_m - other.north_m;
        let de = self.east_m - other.east_m;
        let dd = self.down_m - other.down_m;
        (dn * dn + de * de + dd * dd).sqrt()
    }
}

/// Position setpoint plus heading. Yaw is in degrees, 0 = north, clockwise positive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionNedYaw {
    pub north_m: f32,
    pub east_m: f32,
    pub down_m: f32,
    pub yaw_deg: f32,
}

impl PositionNedYaw {
    pub fn new(north_m: f32, east_m: f32, down_m: f32, yaw_deg: f32) -> Self {
        Self { north_m, east_m, down_m, yaw_deg }
    }

    pub fn position(&self) -> PositionNed {
        PositionNed::new(self.north_m, self.east_m, self.down_m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlightMode {
    #[default]
    Unknown,
    Manual,
    Altitude,
    Position,
    Stabilized,
    Acro,
    Offboard,
    Hold,
    Mission,
    Takeoff,
    ReturnToLaunch,
    Land,
}

impl FlightMode {
    /// True for the one mode in which our setpoints drive the vehicle.
    pub fn grants_autonomous_control(&self) -> bool {
        matches!(self, FlightMode::Offboard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Health {
    pub global_position_ok: bool,
    pub home_position_ok: bool,
}

impl Health {
    pub fn ready_for_flight(&self) -> bool {
        self.global_position_ok && self.home_position_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatteryState {
    /// Percent 0-100
    pub remaining_pct: f32,
    pub voltage_v: Option<f32>,
    pub current_a: Option<f32>,
}

impl BatteryState {
    pub fn with_remaining(remaining_pct: f32) -> Self {
        Self { remaining_pct, voltage_v: None, current_a: None }
    }
}
