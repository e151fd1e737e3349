use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use pif_proto::{BatteryState, LinkError, PositionNed, VehicleLink};

use crate::command::{Command, CommandGate, Priority};
use crate::config::{BatteryConfig, MissionConfig};
use crate::convergence::{ConvergenceWaiter, WaitOutcome};
use crate::shared::{Latch, ShutdownSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Normal,
    Low,
    Critical,
}

pub fn classify(remaining_pct: f32, cfg: &BatteryConfig) -> BatteryLevel {
    if remaining_pct < cfg.critical_pct {
        BatteryLevel::Critical
    } else if remaining_pct < cfg.warn_pct {
        BatteryLevel::Low
    } else {
        BatteryLevel::Normal
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatteryExit {
    Cancelled,
    /// Emergency branch ran to completion; `home` is the outcome of the wait.
    EmergencyCompleted { home: WaitOutcome },
    EmergencyFailed(LinkError),
    /// Another holder of the latch already ran the emergency branch.
    AlreadyTriggered,
}

/// Polls remaining charge; warns when low, and on critical runs the
/// one-shot return-to-launch failsafe, then stops.
pub struct BatteryMonitor {
    cfg: BatteryConfig,
    battery: watch::Receiver<Option<BatteryState>>,
    gate: Arc<CommandGate>,
    critical: Latch,
    home_waiter: ConvergenceWaiter,
    home_threshold_m: f32,
}

impl BatteryMonitor {
    pub fn new(cfg: &MissionConfig, link: &dyn VehicleLink, gate: Arc<CommandGate>, critical: Latch) -> Self {
        // After RTL the vehicle is out of offboard, so the home wait must not
        // depend on control authority.
        let home_waiter = ConvergenceWaiter::ungated(link.position_stream(), cfg.poll_interval())
            .with_timeout(cfg.battery.rtl_timeout());
        Self {
            cfg: cfg.battery.clone(),
            battery: link.battery_stream(),
            gate,
            critical,
            home_waiter,
            home_threshold_m: cfg.threshold_m,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) -> BatteryExit {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("-- Battery monitoring stopped");
                BatteryExit::Cancelled
            }
            exit = self.monitor() => exit,
        }
    }

    async fn monitor(mut self) -> BatteryExit {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(b) = *self.battery.borrow_and_update() else {
                debug!("no battery sample yet");
                continue;
            };

            match classify(b.remaining_pct, &self.cfg) {
                BatteryLevel::Normal => {}
                BatteryLevel::Low => warn!("Warning: Low battery ({:.1}%)", b.remaining_pct),
                BatteryLevel::Critical => {
                    warn!("Warning: Low battery ({:.1}%)", b.remaining_pct);
                    if !self.critical.trigger() {
                        return BatteryExit::AlreadyTriggered;
                    }
                    return self.emergency().await;
                }
            }
        }
    }

    async fn emergency(&mut self) -> BatteryExit {
        error!("Critical battery level! Initiating Return to Launch (RTL).");
        if let Err(e) = self.gate.send(Priority::Emergency, Command::ReturnToLaunch).await {
            error!("RTL failed: {}", e);
            return BatteryExit::EmergencyFailed(e);
        }

        let home = self.home_waiter.wait_for(PositionNed::ORIGIN, self.home_threshold_m).await;
        if !matches!(home, WaitOutcome::Reached(_)) {
            warn!("RTL: home not confirmed ({:?})", home);
        }
        tokio::time::sleep(self.cfg.stabilize()).await;
        info!("-- Battery failsafe complete; monitor stopped");
        BatteryExit::EmergencyCompleted { home }
    }
}
