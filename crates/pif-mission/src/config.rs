use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Waypoint source: CSV with a header line, then north,east,down per row.
    pub mission_path: String,

    /// Convergence radius for waypoints, meters.
    pub threshold_m: f32,
    /// Convergence radius for the final hover over home, meters.
    pub home_threshold_m: f32,
    /// Hover altitude over home before landing (NED down, negative is up).
    pub home_down_m: f32,

    pub telemetry_rate_hz: f64,
    pub velocity: VelocityLimits,

    pub connect_timeout_s: u64,
    pub health_timeout_s: u64,
    /// Per-waypoint convergence bound. 0 waits forever.
    pub convergence_timeout_s: u64,

    pub handoff_poll_ms: u64,
    pub poll_interval_ms: u64,

    pub hover_settle_s: u64,
    pub land_settle_s: u64,

    pub battery: BatteryConfig,
}

/// PX4 multicopter velocity caps, m/s.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VelocityLimits {
    pub xy_max: f32,
    pub z_up_max: f32,
    pub z_down_max: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub warn_pct: f32,
    pub critical_pct: f32,
    pub poll_interval_s: u64,
    /// Pause after reaching home on the emergency branch.
    pub stabilize_s: u64,
    /// Bound on the emergency wait for home.
    pub rtl_timeout_s: u64,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            mission_path: "coordinates.csv".into(),
            threshold_m: 0.15,
            home_threshold_m: 0.5,
            home_down_m: -1.0,
            telemetry_rate_hz: 10.0,
            velocity: VelocityLimits::default(),
            connect_timeout_s: 30,
            health_timeout_s: 120,
            convergence_timeout_s: 120,
            handoff_poll_ms: 1000,
            poll_interval_ms: 20,
            hover_settle_s: 5,
            land_settle_s: 10,
            battery: BatteryConfig::default(),
        }
    }
}

impl Default for VelocityLimits {
    fn default() -> Self {
        Self { xy_max: 1.0, z_up_max: 1.0, z_down_max: 1.0 }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self { warn_pct: 20.0, critical_pct: 10.0, poll_interval_s: 5, stabilize_s: 5, rtl_timeout_s: 300 }
    }
}

impl VelocityLimits {
    /// (param name, value) pairs as PX4 names them.
    pub fn params(&self) -> [(&'static str, f32); 3] {
        [
            ("MPC_XY_VEL_MAX", self.xy_max),
            ("MPC_Z_VEL_MAX_UP", self.z_up_max),
            ("MPC_Z_VEL_MAX_DN", self.z_down_max),
        ]
    }
}

impl MissionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_s)
    }

    pub fn convergence_timeout(&self) -> Option<Duration> {
        (self.convergence_timeout_s > 0).then(|| Duration::from_secs(self.convergence_timeout_s))
    }

    pub fn handoff_poll(&self) -> Duration {
        Duration::from_millis(self.handoff_poll_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hover_settle(&self) -> Duration {
        Duration::from_secs(self.hover_settle_s)
    }

    pub fn land_settle(&self) -> Duration {
        Duration::from_secs(self.land_settle_s)
    }
}

impl BatteryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_secs(self.stabilize_s)
    }

    pub fn rtl_timeout(&self) -> Option<Duration> {
        (self.rtl_timeout_s > 0).then(|| Duration::from_secs(self.rtl_timeout_s))
    }
}
