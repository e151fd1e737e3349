use std::time::{Duration, Instant};

use pif_proto::FlightMode;

#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub address: Option<String>,
    pub connected: bool,
    pub last_heartbeat: Option<Instant>,
    pub mode: FlightMode,
    pub armed: bool,
    pub last_msg: Option<&'static str>,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// Heartbeat seen and younger than `timeout`.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.hb_age().map(|age| age <= timeout).unwrap_or(false)
    }
}
