use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use pif_proto::{LinkError, PositionNedYaw, VehicleLink};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Position(PositionNedYaw),
    Arm,
    Land,
    ReturnToLaunch,
    StopAutonomousControl,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Position(_) => "position",
            Command::Arm => "arm",
            Command::Land => "land",
            Command::ReturnToLaunch => "return-to-launch",
            Command::StopAutonomousControl => "stop-offboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Navigation,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    /// An emergency command owns the vehicle; navigation traffic is dropped.
    Suppressed,
}

/// Single entry point for vehicle commands.
///
/// Commands are sent one at a time under an async mutex, so a navigation
/// setpoint and the emergency RTL never interleave on the transport. After an
/// emergency command has gone out, navigation-priority commands are dropped
/// for the rest of the mission.
pub struct CommandGate {
    link: Arc<dyn VehicleLink>,
    preempted: Mutex<bool>,
}

impl CommandGate {
    pub fn new(link: Arc<dyn VehicleLink>) -> Self {
        Self { link, preempted: Mutex::new(false) }
    }

    pub async fn is_preempted(&self) -> bool {
        *self.preempted.lock().await
    }

    pub async fn send(&self, priority: Priority, cmd: Command) -> Result<Dispatch, LinkError> {
        let mut preempted = self.preempted.lock().await;
        if *preempted && priority == Priority::Navigation {
            debug!("suppressed {} command: emergency in progress", cmd.name());
            return Ok(Dispatch::Suppressed);
        }

        let res = match cmd {
            Command::Position(sp) => self.link.send_position_command(sp).await,
            Command::Arm => self.link.arm().await,
            Command::Land => self.link.land().await,
            Command::ReturnToLaunch => self.link.return_to_launch().await,
            Command::StopAutonomousControl => self.link.stop_autonomous_control().await,
        };

        match res {
            Ok(()) => {
                if priority == Priority::Emergency && !*preempted {
                    warn!("{} took over the vehicle; navigation commands suppressed", cmd.name());
                    *preempted = true;
                }
                Ok(Dispatch::Sent)
            }
            Err(e) => Err(e),
        }
    }
}
