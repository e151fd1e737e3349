use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use pif_proto::{LinkError, PositionNedYaw, VehicleLink};

use crate::authority::ControlAuthorityMonitor;
use crate::battery::{BatteryExit, BatteryMonitor};
use crate::command::{Command, CommandGate, Dispatch, Priority};
use crate::config::MissionConfig;
use crate::convergence::{ConvergenceWaiter, WaitOutcome};
use crate::error::{MissionError, MissionWarning};
use crate::shared::{shutdown_channel, AuthorityFlag, Latch};
use crate::waypoint::{load_mission, Waypoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    HealthCheck,
    AwaitingHandoff,
    ArmedNav,
    ReturningLanding,
    Interrupted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The vehicle left offboard mode.
    ControlLost,
    /// Authority held, but the target was not reached in time.
    ConvergenceTimeout,
    /// The battery failsafe took the vehicle.
    BatteryFailsafe,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interruption {
    /// 0-based waypoint index.
    pub index: usize,
    /// Source row of that waypoint.
    pub row: usize,
    pub target: PositionNedYaw,
    pub reason: InterruptReason,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Completed,
    Interrupted(Interruption),
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Aborted => write!(f, "aborted by operator"),
            Outcome::Interrupted(i) => write!(
                f,
                "interrupted at row {} (waypoint {}: N={}, E={}, D={}, Yaw={:.1}°): {:?}",
                i.row,
                i.index + 1,
                i.target.north_m,
                i.target.east_m,
                i.target.down_m,
                i.target.yaw_deg,
                i.reason
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MissionReport {
    pub outcome: Outcome,
    pub battery_emergency: bool,
    pub warnings: Vec<MissionWarning>,
    pub phases: Vec<Phase>,
    pub waypoints_reached: usize,
    /// Last position setpoint the vehicle accepted.
    pub last_command: Option<PositionNedYaw>,
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
}

/// Live view of one mission. Owned by the orchestrator; the monitors only
/// hold clones of the flag and the latch.
#[derive(Debug)]
struct MissionState {
    phases: Vec<Phase>,
    last_command: Option<PositionNedYaw>,
    reached: usize,
    authority: AuthorityFlag,
    battery_critical: Latch,
    outcome: Option<Outcome>,
    warnings: Vec<MissionWarning>,
}

impl MissionState {
    fn new() -> Self {
        Self {
            phases: Vec::new(),
            last_command: None,
            reached: 0,
            authority: AuthorityFlag::new(),
            battery_critical: Latch::new(),
            outcome: None,
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phases.last() != Some(&phase) {
            info!("phase: {:?}", phase);
            self.phases.push(phase);
        }
    }

    fn warn(&mut self, w: MissionWarning) {
        warn!("{}", w);
        self.warnings.push(w);
    }

    /// First outcome wins.
    fn finish(&mut self, outcome: Outcome) -> Outcome {
        *self.outcome.get_or_insert(outcome)
    }

    fn into_report(self, outcome: Outcome, started_at: OffsetDateTime, elapsed: Duration) -> MissionReport {
        MissionReport {
            outcome,
            battery_emergency: self.battery_critical.is_set(),
            warnings: self.warnings,
            phases: self.phases,
            waypoints_reached: self.reached,
            last_command: self.last_command,
            started_at,
            elapsed,
        }
    }
}

pub struct MissionOrchestrator {
    link: Arc<dyn VehicleLink>,
    cfg: MissionConfig,
}

impl MissionOrchestrator {
    pub fn new(link: Arc<dyn VehicleLink>, cfg: MissionConfig) -> Self {
        Self { link, cfg }
    }

    pub fn config(&self) -> &MissionConfig {
        &self.cfg
    }

    /// Parse the source, then fly it. Nothing is sent to the vehicle if the
    /// source is malformed.
    pub async fn run_mission<F>(
        &self,
        address: &str,
        source: impl AsRef<Path>,
        abort: F,
    ) -> Result<MissionReport, MissionError>
    where
        F: Future<Output = ()>,
    {
        let waypoints = load_mission(source)?;
        info!("-- Loaded {} waypoint(s)", waypoints.len());
        self.run(address, &waypoints, abort).await
    }

    /// Fly `waypoints`. Both monitors are started before the first vehicle
    /// interaction and joined before this returns, on every path.
    ///
    /// `abort` resolving cancels the mission body; the vehicle is then asked
    /// to leave offboard control and the outcome is `Aborted`.
    pub async fn run<F>(&self, address: &str, waypoints: &[Waypoint], abort: F) -> Result<MissionReport, MissionError>
    where
        F: Future<Output = ()>,
    {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        let mut state = MissionState::new();
        let gate = Arc::new(CommandGate::new(self.link.clone()));

        let (stop_tx, stop_rx) = shutdown_channel();
        let authority = ControlAuthorityMonitor::new(state.authority.clone(), self.link.flight_mode_stream());
        let battery = BatteryMonitor::new(&self.cfg, self.link.as_ref(), gate.clone(), state.battery_critical.clone());
        let authority_task = tokio::spawn(authority.run(stop_rx.clone()));
        let battery_task = tokio::spawn(battery.run(stop_rx));

        let driven = {
            let drive = self.drive(address, waypoints, &gate, &mut state);
            tokio::select! {
                biased;
                _ = abort => None,
                res = drive => Some(res),
            }
        };

        let result = match driven {
            Some(res) => res,
            None => {
                warn!("-- Mission aborted by operator");
                self.relinquish(&gate, &mut state).await;
                Ok(Outcome::Aborted)
            }
        };

        self.teardown(stop_tx, authority_task, battery_task, &mut state).await;
        state.enter(Phase::Done);

        let outcome = state.finish(result?);
        info!("-- Mission {}", outcome);
        Ok(state.into_report(outcome, started_at, clock.elapsed()))
    }

    async fn teardown(
        &self,
        stop: watch::Sender<bool>,
        authority: tokio::task::JoinHandle<()>,
        battery: tokio::task::JoinHandle<BatteryExit>,
        state: &mut MissionState,
    ) {
        let _ = stop.send(true);

        if let Err(e) = authority.await {
            error!("authority monitor ended abnormally: {}", e);
        }
        match battery.await {
            Ok(BatteryExit::EmergencyFailed(e)) => state.warn(MissionWarning::EmergencyRtl(e)),
            Ok(BatteryExit::EmergencyCompleted { home: WaitOutcome::Reached(_) }) => {}
            Ok(BatteryExit::EmergencyCompleted { .. }) => state.warn(MissionWarning::EmergencyHomeNotReached),
            Ok(BatteryExit::Cancelled) | Ok(BatteryExit::AlreadyTriggered) => {}
            Err(e) => error!("battery monitor ended abnormally: {}", e),
        }
        info!("-- Monitors stopped");
    }

    async fn drive(
        &self,
        address: &str,
        waypoints: &[Waypoint],
        gate: &CommandGate,
        state: &mut MissionState,
    ) -> Result<Outcome, MissionError> {
        let cfg = &self.cfg;

        state.enter(Phase::Connecting);
        info!("-- Connecting to {}", address);
        self.link.connect(address).await.map_err(MissionError::Connection)?;
        let mut connected = self.link.connection_state();
        match wait_until(&mut connected, cfg.connect_timeout(), |c| *c).await {
            Some(true) => info!("-- Connected to drone!"),
            Some(false) => return Err(MissionError::Connection(LinkError::NotConnected)),
            None => return Err(MissionError::ConnectionTimeout(cfg.connect_timeout())),
        }

        state.enter(Phase::HealthCheck);
        info!("Waiting for drone to have a global position estimate...");
        let mut health = self.link.health();
        match wait_until(&mut health, cfg.health_timeout(), |h| h.ready_for_flight()).await {
            Some(true) => info!("-- Global position estimate OK"),
            _ => return Err(MissionError::HealthCheckTimeout(cfg.health_timeout())),
        }

        for (name, value) in cfg.velocity.params() {
            match self.link.set_parameter(name, value).await {
                Ok(()) => info!("-- {} set to {} m/s", name, value),
                Err(error) => state.warn(MissionWarning::ParameterSet { name: name.to_string(), error }),
            }
        }

        self.link
            .set_telemetry_rate(cfg.telemetry_rate_hz)
            .await
            .map_err(MissionError::Setup)?;

        info!("-- Setting initial setpoint");
        if self.setup_setpoint(gate, state).await? == Dispatch::Suppressed {
            return Ok(state.finish(failsafe_before_nav(waypoints)));
        }

        state.enter(Phase::AwaitingHandoff);
        while !state.authority.is_granted() {
            if gate.is_preempted().await {
                return Ok(state.finish(failsafe_before_nav(waypoints)));
            }
            info!("-- Waiting for offboard control to be enabled...");
            tokio::time::sleep(cfg.handoff_poll()).await;
        }

        if self.setup_setpoint(gate, state).await? == Dispatch::Suppressed {
            return Ok(state.finish(failsafe_before_nav(waypoints)));
        }
        info!("-- Arming");
        if gate.send(Priority::Navigation, Command::Arm).await.map_err(MissionError::Arm)? == Dispatch::Suppressed {
            return Ok(state.finish(failsafe_before_nav(waypoints)));
        }

        state.enter(Phase::ArmedNav);
        if let Some(stop) = self.fly_waypoints(waypoints, gate, state).await {
            state.enter(Phase::Interrupted);
            let Interruption { row, target, reason, .. } = stop;
            warn!(
                "Flight interrupted at row {}: N={}, E={}, D={} ({:?})",
                row, target.north_m, target.east_m, target.down_m, reason
            );
            // A convergence timeout leaves us in control; land rather than hang.
            if reason == InterruptReason::ConvergenceTimeout && self.in_control(gate, state).await {
                self.return_and_land(gate, state).await;
            }
            return Ok(state.finish(Outcome::Interrupted(stop)));
        }

        if self.in_control(gate, state).await {
            self.return_and_land(gate, state).await;
        }
        Ok(state.finish(Outcome::Completed))
    }

    /// Returns the interruption, or `None` when every waypoint was reached.
    async fn fly_waypoints(
        &self,
        waypoints: &[Waypoint],
        gate: &CommandGate,
        state: &mut MissionState,
    ) -> Option<Interruption> {
        let mut waiter = ConvergenceWaiter::gated(
            self.link.position_stream(),
            state.authority.clone(),
            self.cfg.poll_interval(),
        )
        .with_timeout(self.cfg.convergence_timeout());

        for (index, wp) in waypoints.iter().enumerate() {
            let target = wp.setpoint();
            let stop = |reason| Interruption { index, row: wp.row, target, reason };

            info!(
                "Waypoint: N={}, E={}, D={}, Yaw={:.1}°",
                target.north_m, target.east_m, target.down_m, target.yaw_deg
            );
            match gate.send(Priority::Navigation, Command::Position(target)).await {
                Ok(Dispatch::Sent) => state.last_command = Some(target),
                Ok(Dispatch::Suppressed) => return Some(stop(InterruptReason::BatteryFailsafe)),
                Err(error) => state.warn(MissionWarning::Command { what: "position", error }),
            }

            let reason = match waiter.wait_for(wp.position(), self.cfg.threshold_m).await {
                WaitOutcome::Reached(_) if state.authority.is_granted() => {
                    state.reached += 1;
                    continue;
                }
                WaitOutcome::TimedOut => InterruptReason::ConvergenceTimeout,
                WaitOutcome::Reached(_) | WaitOutcome::Interrupted => {
                    if gate.is_preempted().await {
                        InterruptReason::BatteryFailsafe
                    } else {
                        InterruptReason::ControlLost
                    }
                }
            };
            return Some(stop(reason));
        }
        None
    }

    async fn return_and_land(&self, gate: &CommandGate, state: &mut MissionState) {
        let cfg = &self.cfg;
        state.enter(Phase::ReturningLanding);

        let home = PositionNedYaw::new(0.0, 0.0, cfg.home_down_m, 0.0);
        info!("-- Returning to home position");
        if !self.nav_command(gate, state, Command::Position(home)).await {
            return;
        }
        state.last_command = Some(home);

        let mut waiter = ConvergenceWaiter::gated(self.link.position_stream(), state.authority.clone(), cfg.poll_interval())
            .with_timeout(cfg.convergence_timeout());
        match waiter.wait_for(home.position(), cfg.home_threshold_m).await {
            WaitOutcome::Reached(_) => {}
            WaitOutcome::TimedOut => state.warn(MissionWarning::HomeNotReached),
            WaitOutcome::Interrupted => {
                state.warn(MissionWarning::ReturnInterrupted);
                return;
            }
        }

        tokio::time::sleep(cfg.hover_settle()).await;
        info!("-- Landing");
        if !self.nav_command(gate, state, Command::Land).await {
            return;
        }
        tokio::time::sleep(cfg.land_settle()).await;

        info!("-- Stopping offboard control");
        match gate.send(Priority::Navigation, Command::StopAutonomousControl).await {
            Ok(_) => info!("-- Mission complete"),
            Err(e) => state.warn(MissionWarning::StopAutonomousControl(e)),
        }
    }

    /// Best-effort navigation command. False when the failsafe owns the
    /// vehicle and the sequence should stop.
    async fn nav_command(&self, gate: &CommandGate, state: &mut MissionState, cmd: Command) -> bool {
        match gate.send(Priority::Navigation, cmd).await {
            Ok(Dispatch::Sent) => true,
            Ok(Dispatch::Suppressed) => false,
            Err(error) => {
                state.warn(MissionWarning::Command { what: cmd.name(), error });
                true
            }
        }
    }

    async fn setup_setpoint(&self, gate: &CommandGate, state: &mut MissionState) -> Result<Dispatch, MissionError> {
        let zero = PositionNedYaw::default();
        let d = gate
            .send(Priority::Navigation, Command::Position(zero))
            .await
            .map_err(MissionError::Setup)?;
        if d == Dispatch::Sent {
            state.last_command = Some(zero);
        }
        Ok(d)
    }

    async fn in_control(&self, gate: &CommandGate, state: &MissionState) -> bool {
        state.authority.is_granted() && !gate.is_preempted().await
    }

    async fn relinquish(&self, gate: &CommandGate, state: &mut MissionState) {
        match gate.send(Priority::Navigation, Command::StopAutonomousControl).await {
            Ok(Dispatch::Sent) => info!("-- Offboard control released; vehicle holding"),
            Ok(Dispatch::Suppressed) => {}
            Err(e) => state.warn(MissionWarning::StopAutonomousControl(e)),
        }
    }
}

fn failsafe_before_nav(waypoints: &[Waypoint]) -> Outcome {
    let (row, target) = waypoints.first().map(|w| (w.row, w.setpoint())).unwrap_or_default();
    warn!("-- Battery failsafe engaged before navigation started");
    Outcome::Interrupted(Interruption { index: 0, row, target, reason: InterruptReason::BatteryFailsafe })
}

/// `Some(true)` once `pred` holds, `Some(false)` if the sender is gone,
/// `None` on timeout.
async fn wait_until<T>(rx: &mut watch::Receiver<T>, limit: Duration, pred: impl FnMut(&T) -> bool) -> Option<bool> {
    tokio::time::timeout(limit, async { rx.wait_for(pred).await.is_ok() }).await.ok()
}
