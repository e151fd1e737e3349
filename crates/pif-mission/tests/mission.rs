mod common;

use std::future::pending;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use common::{position_of, setpoints, square, Event, MockVehicle, Script};
use pif_mission::{
    InterruptReason, MissionError, MissionOrchestrator, MissionWarning, Outcome, ParseError, Phase,
};
use pif_proto::{FlightMode, PositionNed, PositionNedYaw};

const ADDR: &str = "udpin:0.0.0.0:14540";
// generous bound in virtual time; a deadlock shows up as a timeout
const LIMIT: Duration = Duration::from_secs(3600);

fn orchestrator(mock: &MockVehicle) -> MissionOrchestrator {
    MissionOrchestrator::new(mock.link(), common::config())
}

#[tokio::test(start_paused = true)]
async fn square_mission_completes_and_lands() {
    let mock = MockVehicle::new(Script::default());
    let start = Instant::now();

    let report = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.waypoints_reached, 3);
    assert!(!report.battery_emergency);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(
        report.phases,
        [
            Phase::Connecting,
            Phase::HealthCheck,
            Phase::AwaitingHandoff,
            Phase::ArmedNav,
            Phase::ReturningLanding,
            Phase::Done
        ]
    );
    // hover and land settle times are part of the run
    assert!(Instant::now() - start >= Duration::from_secs(15));

    let events = mock.events();
    assert_eq!(mock.count(&Event::Rate), 1);
    assert_eq!(mock.count(&Event::Arm), 1);
    assert_eq!(mock.count(&Event::Land), 1);
    assert_eq!(mock.count(&Event::StopOffboard), 1);
    assert_eq!(mock.count(&Event::Rtl), 0);
    for p in ["MPC_XY_VEL_MAX", "MPC_Z_VEL_MAX_UP", "MPC_Z_VEL_MAX_DN"] {
        assert_eq!(mock.count(&Event::Param(p.into())), 1);
    }

    let arm = position_of(&events, &Event::Arm).unwrap();
    let land = position_of(&events, &Event::Land).unwrap();
    let stop = position_of(&events, &Event::StopOffboard).unwrap();
    assert!(arm < land && land < stop);

    // handshake setpoints, three waypoints, home
    let sps = setpoints(&events);
    assert_eq!(sps.len(), 6);
    assert_eq!(sps[0], PositionNedYaw::default());
    assert_eq!(sps[1], PositionNedYaw::default());
    assert_eq!(sps[2], PositionNedYaw::new(0.0, 0.0, -2.0, 0.0));
    assert_eq!(sps[3], PositionNedYaw::new(5.0, 0.0, -2.0, 0.0));
    assert!((sps[4].yaw_deg - 90.0).abs() < 1e-4);
    assert_eq!(sps[5], PositionNedYaw::new(0.0, 0.0, -1.0, 0.0));
    assert_eq!(mock.stream_subscribers(), 0, "monitors outlived the mission");
}

#[tokio::test(start_paused = true)]
async fn next_waypoint_is_only_sent_after_arrival() {
    let mock = MockVehicle::new(Script::default());
    timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    let events = mock.events();
    let wps = square();
    for pair in wps.windows(2) {
        let arrived = position_of(&events, &Event::Arrived(pair[0].position())).unwrap();
        let next = position_of(&events, &Event::Setpoint(pair[1].setpoint())).unwrap();
        assert!(arrived < next, "waypoint row {} commanded before row {} was reached", pair[1].row, pair[0].row);
    }
    assert!(!mock.commands_overlapped());
}

#[tokio::test(start_paused = true)]
async fn waits_for_operator_handoff_before_arming() {
    let mock = MockVehicle::new(Script {
        initial_mode: FlightMode::Position,
        handoff_after: Some(Duration::from_secs(7)),
        ..Default::default()
    });
    let start = Instant::now();
    let orch = orchestrator(&mock);
    let wps = square();
    let run = orch.run(ADDR, &wps, pending());
    tokio::pin!(run);

    // before the handoff only the handshake setpoint is out
    assert!(timeout(Duration::from_secs(6), &mut run).await.is_err());
    assert_eq!(mock.count(&Event::Arm), 0);
    assert_eq!(setpoints(&mock.events()).len(), 1);

    let report = timeout(LIMIT, run).await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert!(Instant::now() - start >= Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn control_loss_interrupts_and_skips_landing() {
    let mock = MockVehicle::new(Script { take_over_on_setpoint: Some(2), ..Default::default() });

    let report = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    let Outcome::Interrupted(stop) = report.outcome else {
        panic!("expected interruption, got {:?}", report.outcome);
    };
    assert_eq!(stop.index, 1);
    assert_eq!(stop.row, 3);
    assert_eq!(stop.target, square()[1].setpoint());
    assert_eq!(stop.reason, InterruptReason::ControlLost);
    assert_eq!(report.waypoints_reached, 1);
    assert_eq!(report.last_command, Some(square()[1].setpoint()));
    assert_eq!(report.phases.last(), Some(&Phase::Done));
    assert!(report.phases.contains(&Phase::Interrupted));
    assert!(!report.phases.contains(&Phase::ReturningLanding));

    assert_eq!(mock.count(&Event::Land), 0);
    assert_eq!(mock.count(&Event::StopOffboard), 0);
    // third waypoint never commanded
    assert!(position_of(&mock.events(), &Event::Setpoint(square()[2].setpoint())).is_none());
}

#[tokio::test(start_paused = true)]
async fn control_loss_is_noticed_within_one_poll_tick() {
    let mock = MockVehicle::new(Script { fly_time: Duration::from_secs(30), ..Default::default() });
    let orch = orchestrator(&mock);
    let wps = square();
    let run = orch.run(ADDR, &wps, pending());
    tokio::pin!(run);

    assert!(timeout(Duration::from_secs(10), &mut run).await.is_err());
    let lost_at = Instant::now();
    mock.set_mode(FlightMode::Position);

    let report = timeout(LIMIT, run).await.unwrap().unwrap();
    assert!(matches!(report.outcome, Outcome::Interrupted(i) if i.index == 0));
    // the 20 ms waiter tick plus the 1 ms it takes to send a command
    assert!(Instant::now() - lost_at <= Duration::from_millis(25));
}

#[tokio::test(start_paused = true)]
async fn critical_battery_triggers_one_rtl_without_deadlock() {
    let mock = MockVehicle::new(Script {
        fly_time: Duration::from_secs(3),
        battery_after_arrivals: Some((1, 9.0)),
        ..Default::default()
    });

    let report = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .expect("navigation loop and failsafe deadlocked")
        .unwrap();

    assert!(report.battery_emergency);
    assert_eq!(mock.count(&Event::Rtl), 1);
    assert_eq!(mock.count(&Event::Land), 0);
    assert!(!mock.commands_overlapped());

    let events = mock.events();
    let rtl = position_of(&events, &Event::Rtl).unwrap();
    assert!(
        events[rtl..].iter().all(|e| !matches!(e, Event::Setpoint(_))),
        "setpoint sent after RTL: {:?}",
        events
    );

    let Outcome::Interrupted(stop) = report.outcome else {
        panic!("expected interruption, got {:?}", report.outcome);
    };
    assert_eq!(stop.reason, InterruptReason::BatteryFailsafe);
    assert_eq!(stop.index, 1);
    assert_eq!(mock.stream_subscribers(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_waypoint_times_out_then_lands() {
    let mock = MockVehicle::new(Script { unreachable_setpoint: Some(3), ..Default::default() });
    let mut cfg = common::config();
    cfg.convergence_timeout_s = 10;

    let report = timeout(LIMIT, MissionOrchestrator::new(mock.link(), cfg).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    let Outcome::Interrupted(stop) = report.outcome else {
        panic!("expected interruption, got {:?}", report.outcome);
    };
    assert_eq!(stop.reason, InterruptReason::ConvergenceTimeout);
    assert_eq!(stop.index, 2);
    assert_eq!(report.waypoints_reached, 2);
    assert!(report.phases.contains(&Phase::ReturningLanding));
    assert_eq!(mock.count(&Event::Land), 1);
    assert_eq!(mock.count(&Event::StopOffboard), 1);
}

#[tokio::test(start_paused = true)]
async fn parameter_failures_are_warnings() {
    let mock = MockVehicle::new(Script { fail_params: true, ..Default::default() });

    let report = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    let params = report
        .warnings
        .iter()
        .filter(|w| matches!(w, MissionWarning::ParameterSet { .. }))
        .count();
    assert_eq!(params, 3);
}

#[tokio::test(start_paused = true)]
async fn failing_to_release_control_still_completes() {
    let mock = MockVehicle::new(Script { fail_stop: true, ..Default::default() });

    let report = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert!(matches!(report.warnings.as_slice(), [MissionWarning::StopAutonomousControl(_)]));
}

#[tokio::test(start_paused = true)]
async fn connection_never_reported_is_fatal() {
    let mock = MockVehicle::new(Script { reports_connected: false, ..Default::default() });

    let err = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, MissionError::ConnectionTimeout(d) if d == Duration::from_secs(30)));
    assert_eq!(mock.count(&Event::Arm), 0);
    assert_eq!(mock.stream_subscribers(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_error_is_fatal() {
    let mock = MockVehicle::new(Script { connect_ok: false, ..Default::default() });

    let err = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MissionError::Connection(_)));
}

#[tokio::test(start_paused = true)]
async fn health_never_ok_is_fatal() {
    let mock = MockVehicle::new(Script { health_ok: false, ..Default::default() });

    let err = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, MissionError::HealthCheckTimeout(_)));
    assert!(setpoints(&mock.events()).is_empty());
    assert_eq!(mock.count(&Event::Arm), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_source_fails_before_any_command() {
    let path = std::env::temp_dir().join(format!("pif-bad-mission-{}.csv", std::process::id()));
    std::fs::write(&path, "north,east,down\n0,0,-2\n5,x,-2\n").unwrap();
    let mock = MockVehicle::new(Script::default());

    let err = orchestrator(&mock).run_mission(ADDR, &path, pending()).await.unwrap_err();
    let _ = std::fs::remove_file(&path);

    assert!(matches!(err, MissionError::Parse(ParseError::BadNumber { row: 3, column: "east", .. })));
    assert!(mock.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operator_abort_releases_control_and_joins_monitors() {
    let mock = MockVehicle::new(Script { initial_mode: FlightMode::Position, ..Default::default() });

    let abort = tokio::time::sleep(Duration::from_secs(5));
    let report = timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), abort))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(mock.count(&Event::Arm), 0);
    assert_eq!(mock.count(&Event::StopOffboard), 1);
    assert_eq!(report.phases.last(), Some(&Phase::Done));
    assert_eq!(mock.stream_subscribers(), 0);
}

#[tokio::test(start_paused = true)]
async fn reports_position_of_last_waypoint_when_complete() {
    let mock = MockVehicle::new(Script::default());
    timeout(LIMIT, orchestrator(&mock).run(ADDR, &square(), pending()))
        .await
        .unwrap()
        .unwrap();

    // home hover is the last arrival
    let last = mock.events().into_iter().rev().find_map(|e| match e {
        Event::Arrived(p) => Some(p),
        _ => None,
    });
    assert_eq!(last, Some(PositionNed::new(0.0, 0.0, -1.0)));
}
