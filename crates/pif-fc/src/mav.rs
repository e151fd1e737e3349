use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavParamType, MavResult, MavState,
        MavType, PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, PARAM_SET_DATA,
        SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    MavConnection, MavHeader, Message,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use pif_proto::{BatteryState, FlightMode, Health, LinkError, PositionNed, PositionNedYaw, VehicleLink};

use crate::safety::{ActionGuard, Verdict, VehicleAction};
use crate::state::LinkStatus;
use crate::{normalize_address, FcConfig};

type Conn = Box<dyn MavConnection<MavMessage> + Send + Sync>;

const LOCAL_POSITION_NED_MSG_ID: f32 = 32.0;

// PX4 custom mode encoding: main mode in bits 16..24, sub mode in 24..32.
const PX4_MAIN_AUTO: f32 = 4.0;
const PX4_AUTO_LOITER: f32 = 3.0;

// Position + yaw; velocity, acceleration and yaw rate ignored.
const POSITION_YAW_TYPEMASK: u16 = 0x09F8;

const ACTION_MIN_INTERVAL: Duration = Duration::from_secs(2);

// ESTIMATOR_STATUS_FLAGS bits.
const ESTIMATOR_POS_HORIZ_ABS: u16 = 16;
const ESTIMATOR_CONST_POS_MODE: u16 = 128;
const ESTIMATOR_GPS_GLITCH: u16 = 1024;

#[derive(Debug, Clone, Copy)]
struct CommandAck {
    command: MavCmd,
    result: MavResult,
}

/// Everything the reader thread publishes into.
struct Channels {
    connected: watch::Sender<bool>,
    health: watch::Sender<Health>,
    position: watch::Sender<Option<PositionNed>>,
    mode: watch::Sender<FlightMode>,
    battery: watch::Sender<Option<BatteryState>>,
    acks: broadcast::Sender<CommandAck>,
    params: broadcast::Sender<(String, f32)>,
}

impl Channels {
    fn new() -> Self {
        Self {
            connected: watch::channel(false).0,
            health: watch::channel(Health::default()).0,
            position: watch::channel(None).0,
            mode: watch::channel(FlightMode::Unknown).0,
            battery: watch::channel(None).0,
            acks: broadcast::channel(16).0,
            params: broadcast::channel(16).0,
        }
    }

    /// Global position follows every estimator report, in both directions.
    fn on_estimator_status(&self, flags: u16) {
        let ok = estimator_position_ok(flags);
        if self.health.send_if_modified(|h| std::mem::replace(&mut h.global_position_ok, ok) != ok) {
            info!("FC: global position {}", if ok { "ok" } else { "lost" });
        }
    }

    fn on_home_position(&self) {
        self.health.send_if_modified(|h| !std::mem::replace(&mut h.home_position_ok, true));
    }

    /// Health is only as good as the last heartbeat; forget it when the link drops.
    fn on_link_lost(&self) {
        self.health.send_if_modified(|h| std::mem::take(h) != Health::default());
    }
}

fn estimator_position_ok(flags: u16) -> bool {
    flags & ESTIMATOR_POS_HORIZ_ABS != 0 && flags & (ESTIMATOR_CONST_POS_MODE | ESTIMATOR_GPS_GLITCH) == 0
}

/// Connection plus outgoing header. The header lock serializes every send
/// (setpoint stream, heartbeats, commands) onto the wire.
struct Transport {
    conn: Conn,
    hdr: Mutex<MavHeader>,
}

impl Transport {
    fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        let mut hdr = lock(&self.hdr);
        self.send_locked(&mut hdr, msg)
    }

    /// Sends the current setpoint, read under the header lock. A setpoint
    /// cleared before a command goes out can never reach the wire after it.
    fn send_setpoint(&self, setpoint: &watch::Receiver<Option<PositionNedYaw>>, cfg: &FcConfig) -> Result<(), LinkError> {
        let mut hdr = lock(&self.hdr);
        let current = *setpoint.borrow();
        match current {
            Some(sp) => self.send_locked(&mut hdr, &position_target(cfg, &sp)),
            None => Ok(()),
        }
    }

    fn send_locked(&self, hdr: &mut MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        hdr.sequence = hdr.sequence.wrapping_add(1);
        self.conn.send(hdr, msg).map_err(|e| LinkError::Send(format!("{:?}", e)))?;
        Ok(())
    }
}

pub struct FcLink {
    cfg: FcConfig,
    transport: OnceLock<Arc<Transport>>,
    channels: Arc<Channels>,
    setpoint: Arc<watch::Sender<Option<PositionNedYaw>>>,
    status: Arc<Mutex<LinkStatus>>,
    guard: Mutex<ActionGuard>,
    command_lock: tokio::sync::Mutex<()>,
    stop: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FcLink {
    pub fn new(cfg: FcConfig) -> Self {
        let guard = ActionGuard::new(cfg.require_heartbeat, ACTION_MIN_INTERVAL);
        Self {
            cfg,
            transport: OnceLock::new(),
            channels: Arc::new(Channels::new()),
            setpoint: Arc::new(watch::channel(None).0),
            status: Arc::new(Mutex::new(LinkStatus::default())),
            guard: Mutex::new(guard),
            command_lock: tokio::sync::Mutex::new(()),
            stop: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> LinkStatus {
        lock(&self.status).clone()
    }

    fn transport(&self) -> Result<&Arc<Transport>, LinkError> {
        self.transport.get().ok_or(LinkError::NotConnected)
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.command_timeout_ms)
    }

    fn check_action(&self, action: VehicleAction) -> Result<Verdict, LinkError> {
        let hb_seen = lock(&self.status).last_heartbeat.is_some();
        lock(&self.guard).check(action, hb_seen)
    }

    fn spawn_tasks(&self, transport: Arc<Transport>) -> Result<(), LinkError> {
        let reader = ReaderCtx {
            transport: transport.clone(),
            channels: self.channels.clone(),
            status: self.status.clone(),
            stop: self.stop.clone(),
            target_sys: self.cfg.target_sys,
            target_comp: self.cfg.target_comp,
        };
        // mavlink recv blocks with no timeout. A plain thread keeps runtime
        // shutdown from waiting on a silent vehicle.
        std::thread::Builder::new()
            .name("fc-reader".into())
            .spawn(move || reader.run())
            .map_err(|e| LinkError::Send(format!("spawn reader: {}", e)))?;

        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(heartbeat_loop(
            transport.clone(),
            self.channels.clone(),
            self.status.clone(),
            self.cfg.clone(),
        )));
        tasks.push(tokio::spawn(setpoint_loop(
            transport,
            self.setpoint.subscribe(),
            self.cfg.clone(),
        )));
        Ok(())
    }

    /// COMMAND_LONG with ack wait and retries. Only one command is in flight
    /// at a time so acks can be matched by command id.
    async fn command_long(&self, command: MavCmd, params: [f32; 7]) -> Result<(), LinkError> {
        let transport = self.transport()?;
        let _in_flight = self.command_lock.lock().await;
        let mut acks = self.channels.acks.subscribe();

        for attempt in 0..=self.cfg.command_retries {
            let msg = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system: self.cfg.target_sys,
                target_component: self.cfg.target_comp,
                command,
                confirmation: attempt,
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                param5: params[4],
                param6: params[5],
                param7: params[6],
            });
            transport.send(&msg)?;

            match tokio::time::timeout(self.command_timeout(), wait_ack(&mut acks, command)).await {
                Ok(Some(MavResult::MAV_RESULT_ACCEPTED)) => return Ok(()),
                Ok(Some(result)) => {
                    return Err(LinkError::Rejected {
                        command: format!("{:?}", command),
                        result: format!("{:?}", result),
                    })
                }
                Ok(None) => return Err(LinkError::Send("ack channel closed".into())),
                Err(_) => debug!("FC: no ack for {:?} (attempt {})", command, u32::from(attempt) + 1),
            }
        }
        Err(LinkError::AckTimeout(format!("{:?}", command)))
    }

    async fn action(&self, action: VehicleAction, command: MavCmd, params: [f32; 7]) -> Result<(), LinkError> {
        self.transport()?;
        if self.check_action(action)? == Verdict::Duplicate {
            warn!("FC: {:?} rate-limited", action);
            return Ok(());
        }
        info!("FC: sending {:?}", action);
        self.command_long(command, params).await?;
        lock(&self.guard).record(action);
        Ok(())
    }
}

impl Drop for FcLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
    }
}

#[async_trait]
impl VehicleLink for FcLink {
    async fn connect(&self, address: &str) -> Result<(), LinkError> {
        if self.transport.get().is_some() {
            return Ok(());
        }
        let url = normalize_address(address);
        let conn = open_connection(&url)?;
        let transport = Arc::new(Transport {
            conn,
            hdr: Mutex::new(MavHeader { system_id: self.cfg.sys_id, component_id: self.cfg.comp_id, sequence: 0 }),
        });
        if self.transport.set(transport.clone()).is_err() {
            return Ok(());
        }
        lock(&self.status).address = Some(url.clone());
        info!("FC: link open on {}", url);
        self.spawn_tasks(transport)
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.channels.connected.subscribe()
    }

    fn health(&self) -> watch::Receiver<Health> {
        self.channels.health.subscribe()
    }

    fn position_stream(&self) -> watch::Receiver<Option<PositionNed>> {
        self.channels.position.subscribe()
    }

    fn flight_mode_stream(&self) -> watch::Receiver<FlightMode> {
        self.channels.mode.subscribe()
    }

    fn battery_stream(&self) -> watch::Receiver<Option<BatteryState>> {
        self.channels.battery.subscribe()
    }

    async fn set_parameter(&self, name: &str, value: f32) -> Result<(), LinkError> {
        let transport = self.transport()?;
        let _in_flight = self.command_lock.lock().await;
        let mut echoes = self.channels.params.subscribe();

        let msg = MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: value,
            target_system: self.cfg.target_sys,
            target_component: self.cfg.target_comp,
            param_id: param_id(name),
            param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
        });

        for attempt in 0..=self.cfg.command_retries {
            transport.send(&msg)?;
            match tokio::time::timeout(self.command_timeout(), wait_param(&mut echoes, name)).await {
                Ok(Some(v)) if (v - value).abs() <= f32::EPSILON * value.abs().max(1.0) => {
                    info!("FC: {} = {}", name, v);
                    return Ok(());
                }
                Ok(Some(v)) => {
                    return Err(LinkError::Rejected { command: format!("PARAM_SET {}", name), result: format!("value stays {}", v) })
                }
                Ok(None) => return Err(LinkError::Send("param channel closed".into())),
                Err(_) => debug!("FC: no PARAM_VALUE for {} (attempt {})", name, u32::from(attempt) + 1),
            }
        }
        Err(LinkError::ParamNotAcked(name.to_string()))
    }

    async fn set_telemetry_rate(&self, hz: f64) -> Result<(), LinkError> {
        let interval_us = if hz > 0.0 { (1_000_000.0 / hz) as f32 } else { -1.0 };
        self.command_long(
            MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
            [LOCAL_POSITION_NED_MSG_ID, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn send_position_command(&self, setpoint: PositionNedYaw) -> Result<(), LinkError> {
        let transport = self.transport()?;
        self.setpoint.send_replace(Some(setpoint));
        transport.send(&position_target(&self.cfg, &setpoint))
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.action(VehicleAction::Arm, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }

    // Each of these stops the setpoint stream before the command goes out,
    // acknowledged or not.
    async fn land(&self) -> Result<(), LinkError> {
        let nan = f32::NAN;
        self.setpoint.send_replace(None);
        self.action(VehicleAction::Land, MavCmd::MAV_CMD_NAV_LAND, [0.0, 0.0, 0.0, nan, nan, nan, nan]).await
    }

    async fn return_to_launch(&self) -> Result<(), LinkError> {
        self.setpoint.send_replace(None);
        self.action(VehicleAction::ReturnToLaunch, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7]).await
    }

    async fn stop_autonomous_control(&self) -> Result<(), LinkError> {
        let custom = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.setpoint.send_replace(None);
        self.action(
            VehicleAction::Hold,
            MavCmd::MAV_CMD_DO_SET_MODE,
            [custom, PX4_MAIN_AUTO, PX4_AUTO_LOITER, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }
}

fn open_connection(url: &str) -> Result<Conn, LinkError> {
    let connect_err = |reason: String| LinkError::Connect { address: url.to_string(), reason };

    if let Some(rest) = url.strip_prefix("serial:") {
        let (dev, baud) = rest.rsplit_once(':').ok_or_else(|| connect_err("expected serial:<dev>:<baud>".into()))?;
        let baud: u32 = baud.parse().map_err(|_| connect_err(format!("bad baud {}", baud)))?;
        // quick validate device
        let _ = tokio_serial::new(dev, baud)
            .open_native_async()
            .map_err(|e| connect_err(format!("open serial device {}: {}", dev, e)))?;
    }

    mavlink::connect::<MavMessage>(url).map_err(|e| connect_err(e.to_string()))
}

struct ReaderCtx {
    transport: Arc<Transport>,
    channels: Arc<Channels>,
    status: Arc<Mutex<LinkStatus>>,
    stop: Arc<AtomicBool>,
    target_sys: u8,
    target_comp: u8,
}

impl ReaderCtx {
    fn run(self) {
        while !self.stop.load(Ordering::Relaxed) {
            match self.transport.conn.recv() {
                Ok((hdr, msg)) => self.handle(hdr, msg),
                Err(e) => {
                    debug!("FC: recv error: {:?}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!("FC: reader stopped");
    }

    fn handle(&self, hdr: MavHeader, msg: MavMessage) {
        // Ground stations share the link; only listen to the autopilot.
        if hdr.system_id != self.target_sys {
            return;
        }
        lock(&self.status).last_msg = Some(msg.message_name());

        match msg {
            MavMessage::HEARTBEAT(hb) if hdr.component_id == self.target_comp => self.on_heartbeat(&hb),
            MavMessage::LOCAL_POSITION_NED(p) => {
                self.channels.position.send_replace(Some(PositionNed::new(p.x, p.y, p.z)));
            }
            MavMessage::ESTIMATOR_STATUS(e) => self.channels.on_estimator_status(e.flags.bits()),
            MavMessage::HOME_POSITION(_) => self.channels.on_home_position(),
            MavMessage::SYS_STATUS(s) => {
                if let Some(b) = battery_from_sys_status(s.battery_remaining, s.voltage_battery, s.current_battery) {
                    self.channels.battery.send_replace(Some(b));
                }
            }
            MavMessage::COMMAND_ACK(a) => {
                let _ = self.channels.acks.send(CommandAck { command: a.command, result: a.result });
            }
            MavMessage::PARAM_VALUE(p) => {
                let _ = self.channels.params.send((param_name(&p.param_id), p.param_value));
            }
            _ => {}
        }
    }

    fn on_heartbeat(&self, hb: &HEARTBEAT_DATA) {
        let mode = if hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED) {
            decode_px4_mode(hb.custom_mode)
        } else {
            FlightMode::Unknown
        };
        {
            let mut st = lock(&self.status);
            st.last_heartbeat = Some(Instant::now());
            st.connected = true;
            st.mode = mode;
            st.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
        }
        if self.channels.connected.send_if_modified(|c| !std::mem::replace(c, true)) {
            info!("FC: heartbeat from autopilot {}:{}", self.target_sys, self.target_comp);
        }
        self.channels.mode.send_if_modified(|m| std::mem::replace(m, mode) != mode);
    }
}

async fn heartbeat_loop(transport: Arc<Transport>, channels: Arc<Channels>, status: Arc<Mutex<LinkStatus>>, cfg: FcConfig) {
    let hb_interval = Duration::from_secs_f32(1.0 / cfg.send_heartbeat_hz.max(0.2));
    let hb_timeout = Duration::from_millis(cfg.heartbeat_timeout_ms);
    let mut ticker = tokio::time::interval(hb_interval);

    loop {
        ticker.tick().await;
        if let Err(e) = transport.send(&companion_heartbeat()) {
            debug!("FC: heartbeat send failed: {}", e);
        }

        let alive = {
            let mut st = lock(&status);
            st.connected = st.is_alive(hb_timeout);
            st.connected
        };
        if !alive && channels.connected.send_if_modified(|c| std::mem::replace(c, false)) {
            warn!("FC: autopilot heartbeat lost");
            channels.on_link_lost();
        }

        // PX4 only streams HOME_POSITION occasionally; ask until we have it.
        if alive && !channels.health.borrow().home_position_ok {
            let req = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system: cfg.target_sys,
                target_component: cfg.target_comp,
                command: MavCmd::MAV_CMD_GET_HOME_POSITION,
                confirmation: 0,
                param1: 0.0,
                param2: 0.0,
                param3: 0.0,
                param4: 0.0,
                param5: 0.0,
                param6: 0.0,
                param7: 0.0,
            });
            let _ = transport.send(&req);
        }
    }
}

async fn setpoint_loop(transport: Arc<Transport>, setpoint: watch::Receiver<Option<PositionNedYaw>>, cfg: FcConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f32(1.0 / cfg.setpoint_rate_hz.max(2.0)));
    loop {
        ticker.tick().await;
        if let Err(e) = transport.send_setpoint(&setpoint, &cfg) {
            debug!("FC: setpoint send failed: {}", e);
        }
    }
}

async fn wait_ack(acks: &mut broadcast::Receiver<CommandAck>, command: MavCmd) -> Option<MavResult> {
    loop {
        match acks.recv().await {
            Ok(ack) if ack.command == command && ack.result != MavResult::MAV_RESULT_IN_PROGRESS => {
                return Some(ack.result)
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn wait_param(echoes: &mut broadcast::Receiver<(String, f32)>, name: &str) -> Option<f32> {
    loop {
        match echoes.recv().await {
            Ok((id, value)) if id == name => return Some(value),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn companion_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn position_target(cfg: &FcConfig, sp: &PositionNedYaw) -> MavMessage {
    MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
        time_boot_ms: 0,
        target_system: cfg.target_sys,
        target_component: cfg.target_comp,
        coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
        type_mask: PositionTargetTypemask::from_bits_truncate(POSITION_YAW_TYPEMASK),
        x: sp.north_m,
        y: sp.east_m,
        z: sp.down_m,
        vx: 0.0,
        vy: 0.0,
        vz: 0.0,
        afx: 0.0,
        afy: 0.0,
        afz: 0.0,
        yaw: sp.yaw_deg.to_radians(),
        yaw_rate: 0.0,
    })
}

/// SYS_STATUS battery fields: remaining percent (-1 invalid), millivolts
/// (u16::MAX unknown), centiamps (-1 unknown).
fn battery_from_sys_status(remaining: i8, voltage_mv: u16, current_ca: i16) -> Option<BatteryState> {
    if !(0..=100).contains(&remaining) {
        return None;
    }
    Some(BatteryState {
        remaining_pct: remaining as f32,
        voltage_v: (voltage_mv != u16::MAX).then(|| voltage_mv as f32 / 1000.0),
        current_a: (current_ca != -1).then(|| current_ca as f32 / 100.0),
    })
}

pub(crate) fn decode_px4_mode(custom_mode: u32) -> FlightMode {
    let main = (custom_mode >> 16) & 0xff;
    let sub = (custom_mode >> 24) & 0xff;
    match main {
        1 => FlightMode::Manual,
        2 => FlightMode::Altitude,
        3 => FlightMode::Position,
        4 => match sub {
            2 => FlightMode::Takeoff,
            3 => FlightMode::Hold,
            4 => FlightMode::Mission,
            5 => FlightMode::ReturnToLaunch,
            6 => FlightMode::Land,
            _ => FlightMode::Unknown,
        },
        5 => FlightMode::Acro,
        6 => FlightMode::Offboard,
        7 => FlightMode::Stabilized,
        _ => FlightMode::Unknown,
    }
}

fn param_id(name: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    for (dst, src) in id.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    id
}

fn param_name(id: &[u8; 16]) -> String {
    let end = id.iter().position(|b| *b == 0).unwrap_or(id.len());
    String::from_utf8_lossy(&id[..end]).into_owned()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
