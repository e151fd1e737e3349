use std::collections::HashMap;
use std::time::{Duration, Instant};

use pif_proto::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleAction {
    Arm,
    Land,
    ReturnToLaunch,
    Hold,
}

impl VehicleAction {
    fn name(&self) -> &'static str {
        match self {
            VehicleAction::Arm => "ARM",
            VehicleAction::Land => "LAND",
            VehicleAction::ReturnToLaunch => "RTL",
            VehicleAction::Hold => "HOLD",
        }
    }

    /// Actions that must not be re-fired in a burst.
    fn is_rate_limited(&self) -> bool {
        matches!(self, VehicleAction::Land | VehicleAction::ReturnToLaunch)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Send,
    /// Same action was accepted less than `min_interval` ago.
    Duplicate,
}

/// Gatekeeper for high-level actions sent to the autopilot.
#[derive(Debug)]
pub struct ActionGuard {
    require_heartbeat: bool,
    min_interval: Duration,
    last_sent: HashMap<VehicleAction, Instant>,
}

impl ActionGuard {
    pub fn new(require_heartbeat: bool, min_interval: Duration) -> Self {
        Self { require_heartbeat, min_interval, last_sent: HashMap::new() }
    }

    pub fn check(&self, action: VehicleAction, heartbeat_seen: bool) -> Result<Verdict, LinkError> {
        if self.require_heartbeat && !heartbeat_seen {
            return Err(LinkError::NoHeartbeat(action.name()));
        }
        if action.is_rate_limited() {
            if let Some(t) = self.last_sent.get(&action) {
                if t.elapsed() < self.min_interval {
                    return Ok(Verdict::Duplicate);
                }
            }
        }
        Ok(Verdict::Send)
    }

    /// Call once the autopilot has accepted the action. Failed attempts are
    /// never recorded, so a retry always goes out.
    pub fn record(&mut self, action: VehicleAction) {
        self.last_sent.insert(action, Instant::now());
    }
}
