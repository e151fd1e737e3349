use anyhow::{Context, Result};
use std::path::Path;

use crate::config::MissionConfig;
use crate::waypoint::load_mission;

pub fn check_mission_config(cfg: &MissionConfig) -> Result<()> {
    anyhow::ensure!(cfg.threshold_m > 0.0, "mission.threshold_m must be > 0");
    anyhow::ensure!(cfg.home_threshold_m > 0.0, "mission.home_threshold_m must be > 0");
    anyhow::ensure!(cfg.home_down_m <= 0.0, "mission.home_down_m is NED; hover altitude must be <= 0");
    // convergence is polled at 50 Hz; telemetry slower than this leaves the waiter on stale samples
    anyhow::ensure!(cfg.telemetry_rate_hz >= 1.0, "mission.telemetry_rate_hz too low");
    anyhow::ensure!(cfg.poll_interval_ms > 0, "mission.poll_interval_ms must be > 0");
    anyhow::ensure!(cfg.handoff_poll_ms > 0, "mission.handoff_poll_ms must be > 0");
    anyhow::ensure!(cfg.connect_timeout_s > 0, "mission.connect_timeout_s must be > 0");
    anyhow::ensure!(cfg.health_timeout_s > 0, "mission.health_timeout_s must be > 0");

    for (name, v) in cfg.velocity.params() {
        anyhow::ensure!(v > 0.0 && v <= 20.0, "mission.velocity: {} = {} out of range (0, 20]", name, v);
    }

    let b = &cfg.battery;
    anyhow::ensure!(
        b.critical_pct > 0.0 && b.critical_pct < b.warn_pct && b.warn_pct <= 100.0,
        "mission.battery: need 0 < critical_pct < warn_pct <= 100"
    );
    anyhow::ensure!(b.poll_interval_s > 0, "mission.battery.poll_interval_s must be > 0");
    Ok(())
}

/// Number of waypoints in the source.
pub fn check_mission_source(path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let wps = load_mission(path).with_context(|| format!("mission source {}", path.display()))?;
    Ok(wps.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatteryConfig;

    #[test]
    fn defaults_pass() {
        check_mission_config(&MissionConfig::default()).unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = MissionConfig { threshold_m: 0.0, ..Default::default() };
        assert!(check_mission_config(&cfg).is_err());
        let cfg = MissionConfig { home_down_m: 2.0, ..Default::default() };
        assert!(check_mission_config(&cfg).is_err());
        let cfg = MissionConfig {
            battery: BatteryConfig { warn_pct: 10.0, critical_pct: 20.0, ..Default::default() },
            ..Default::default()
        };
        assert!(check_mission_config(&cfg).is_err());
    }

    #[test]
    fn counts_waypoints_in_source() {
        let path = std::env::temp_dir().join(format!("pif-doctor-{}.csv", std::process::id()));
        std::fs::write(&path, "north,east,down\n0,0,-2\n5,0,-2\n").unwrap();
        assert_eq!(check_mission_source(&path).unwrap(), 2);
        std::fs::write(&path, "north,east,down\n0,zero,-2\n").unwrap();
        let err = check_mission_source(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("row 2"));
        let _ = std::fs::remove_file(&path);
    }
}
