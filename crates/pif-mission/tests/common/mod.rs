#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use pif_mission::{MissionConfig, Waypoint};
use pif_proto::{BatteryState, FlightMode, Health, LinkError, PositionNed, PositionNedYaw, VehicleLink};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect,
    Param(String),
    Rate,
    Setpoint(PositionNedYaw),
    Arrived(PositionNed),
    Arm,
    Land,
    Rtl,
    StopOffboard,
}

/// How the simulated vehicle behaves.
#[derive(Debug, Clone)]
pub struct Script {
    pub connect_ok: bool,
    pub reports_connected: bool,
    pub health_ok: bool,
    pub initial_mode: FlightMode,
    /// Operator switches to offboard after this long.
    pub handoff_after: Option<Duration>,
    pub fly_time: Duration,
    pub battery_pct: f32,
    /// After this many arrivals the battery reads the given percentage.
    pub battery_after_arrivals: Option<(usize, f32)>,
    /// On the n-th (1-based) setpoint after arming the pilot takes over.
    pub take_over_on_setpoint: Option<usize>,
    /// The n-th (1-based) setpoint after arming is never reached.
    pub unreachable_setpoint: Option<usize>,
    pub fail_params: bool,
    pub fail_stop: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect_ok: true,
            reports_connected: true,
            health_ok: true,
            initial_mode: FlightMode::Offboard,
            handoff_after: None,
            fly_time: Duration::from_secs(2),
            battery_pct: 80.0,
            battery_after_arrivals: None,
            take_over_on_setpoint: None,
            unreachable_setpoint: None,
            fail_params: false,
            fail_stop: false,
        }
    }
}

struct Inner {
    script: Script,
    connected: watch::Sender<bool>,
    health: watch::Sender<Health>,
    position: watch::Sender<Option<PositionNed>>,
    mode: watch::Sender<FlightMode>,
    battery: watch::Sender<Option<BatteryState>>,
    events: Mutex<Vec<Event>>,
    armed: AtomicBool,
    setpoints_after_arm: AtomicUsize,
    arrivals: AtomicUsize,
    /// Bumped by every new flight; a flight only lands if it is still current.
    generation: AtomicU64,
    in_command: AtomicBool,
    overlapped: AtomicBool,
}

#[derive(Clone)]
pub struct MockVehicle {
    inner: Arc<Inner>,
}

impl MockVehicle {
    pub fn new(script: Script) -> Self {
        let inner = Inner {
            connected: watch::channel(false).0,
            health: watch::channel(Health::default()).0,
            position: watch::channel(Some(PositionNed::ORIGIN)).0,
            mode: watch::channel(script.initial_mode).0,
            battery: watch::channel(Some(BatteryState::with_remaining(script.battery_pct))).0,
            events: Mutex::new(Vec::new()),
            armed: AtomicBool::new(false),
            setpoints_after_arm: AtomicUsize::new(0),
            arrivals: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            in_command: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            script,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn link(&self) -> Arc<dyn VehicleLink> {
        Arc::new(self.clone())
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn count(&self, ev: &Event) -> usize {
        self.events().iter().filter(|e| *e == ev).count()
    }

    pub fn set_battery(&self, pct: f32) {
        self.inner.battery.send_replace(Some(BatteryState::with_remaining(pct)));
    }

    pub fn set_position(&self, pos: PositionNed) {
        self.inner.position.send_replace(Some(pos));
    }

    pub fn set_mode(&self, mode: FlightMode) {
        self.inner.mode.send_replace(mode);
    }

    /// Two commands were ever in flight at once.
    pub fn commands_overlapped(&self) -> bool {
        self.inner.overlapped.load(Ordering::SeqCst)
    }

    /// Receivers still attached to the mode and battery streams.
    pub fn stream_subscribers(&self) -> usize {
        self.inner.mode.receiver_count() + self.inner.battery.receiver_count()
    }

    fn record(&self, ev: Event) {
        self.inner.events.lock().unwrap().push(ev);
    }

    async fn command(&self, ev: Event) {
        if self.inner.in_command.swap(true, Ordering::SeqCst) {
            self.inner.overlapped.store(true, Ordering::SeqCst);
        }
        self.record(ev);
        // widen the window a concurrent sender would have to hit
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.inner.in_command.store(false, Ordering::SeqCst);
    }

    fn fly_to(&self, target: PositionNed) {
        let gen = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let me = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(me.inner.script.fly_time).await;
            if me.inner.generation.load(Ordering::SeqCst) != gen {
                return;
            }
            me.record(Event::Arrived(target));
            me.inner.position.send_replace(Some(target));
            let n = me.inner.arrivals.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, pct)) = me.inner.script.battery_after_arrivals {
                if n == after {
                    me.set_battery(pct);
                }
            }
        });
    }

    /// Cancel any flight in progress.
    fn halt(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VehicleLink for MockVehicle {
    async fn connect(&self, address: &str) -> Result<(), LinkError> {
        self.record(Event::Connect);
        let s = &self.inner.script;
        if !s.connect_ok {
            return Err(LinkError::Connect { address: address.into(), reason: "refused".into() });
        }
        if s.reports_connected {
            self.inner.connected.send_replace(true);
            self.inner.health.send_replace(Health { global_position_ok: s.health_ok, home_position_ok: s.health_ok });
        }
        if let Some(after) = s.handoff_after {
            let me = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                me.set_mode(FlightMode::Offboard);
            });
        }
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    fn health(&self) -> watch::Receiver<Health> {
        self.inner.health.subscribe()
    }

    fn position_stream(&self) -> watch::Receiver<Option<PositionNed>> {
        self.inner.position.subscribe()
    }

    fn flight_mode_stream(&self) -> watch::Receiver<FlightMode> {
        self.inner.mode.subscribe()
    }

    fn battery_stream(&self) -> watch::Receiver<Option<BatteryState>> {
        self.inner.battery.subscribe()
    }

    async fn set_parameter(&self, name: &str, _value: f32) -> Result<(), LinkError> {
        self.record(Event::Param(name.to_string()));
        if self.inner.script.fail_params {
            return Err(LinkError::ParamNotAcked(name.to_string()));
        }
        Ok(())
    }

    async fn set_telemetry_rate(&self, _hz: f64) -> Result<(), LinkError> {
        self.record(Event::Rate);
        Ok(())
    }

    async fn send_position_command(&self, setpoint: PositionNedYaw) -> Result<(), LinkError> {
        self.command(Event::Setpoint(setpoint)).await;
        if !self.inner.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let n = self.inner.setpoints_after_arm.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.script.take_over_on_setpoint == Some(n) {
            self.halt();
            self.set_mode(FlightMode::Position);
            return Ok(());
        }
        if self.inner.script.unreachable_setpoint == Some(n) {
            self.halt();
            return Ok(());
        }
        self.fly_to(setpoint.position());
        Ok(())
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.command(Event::Arm).await;
        self.inner.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn land(&self) -> Result<(), LinkError> {
        self.command(Event::Land).await;
        self.halt();
        self.set_mode(FlightMode::Land);
        Ok(())
    }

    async fn return_to_launch(&self) -> Result<(), LinkError> {
        self.command(Event::Rtl).await;
        self.set_mode(FlightMode::ReturnToLaunch);
        self.fly_to(PositionNed::ORIGIN);
        Ok(())
    }

    async fn stop_autonomous_control(&self) -> Result<(), LinkError> {
        self.command(Event::StopOffboard).await;
        if self.inner.script.fail_stop {
            return Err(LinkError::Rejected { command: "DO_SET_MODE".into(), result: "DENIED".into() });
        }
        self.set_mode(FlightMode::Hold);
        Ok(())
    }
}

pub fn waypoints(rows: &[(f32, f32, f32)]) -> Vec<Waypoint> {
    let mut text = String::from("north,east,down\n");
    for (n, e, d) in rows {
        text.push_str(&format!("{},{},{}\n", n, e, d));
    }
    pif_mission::parse_mission(&text).unwrap()
}

pub fn square() -> Vec<Waypoint> {
    waypoints(&[(0.0, 0.0, -2.0), (5.0, 0.0, -2.0), (5.0, 5.0, -2.0)])
}

pub fn config() -> MissionConfig {
    MissionConfig::default()
}

pub fn setpoints(events: &[Event]) -> Vec<PositionNedYaw> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Setpoint(sp) => Some(*sp),
            _ => None,
        })
        .collect()
}

pub fn position_of(events: &[Event], ev: &Event) -> Option<usize> {
    events.iter().position(|e| e == ev)
}
