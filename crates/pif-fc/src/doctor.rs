use anyhow::Result;
use crate::{normalize_address, FcConfig};

const SCHEMES: [&str; 6] = ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

pub fn check_fc_config(cfg: &FcConfig) -> Result<()> {
    let addr = normalize_address(&cfg.address);
    anyhow::ensure!(SCHEMES.iter().any(|s| addr.starts_with(s)), "fc.address has unknown scheme: {}", cfg.address);
    anyhow::ensure!(cfg.sys_id != cfg.target_sys, "fc.sys_id must differ from fc.target_sys");
    anyhow::ensure!(cfg.send_heartbeat_hz >= 0.2, "fc.send_heartbeat_hz too low");
    // PX4 drops out of offboard below 2 Hz
    anyhow::ensure!(cfg.setpoint_rate_hz >= 2.0, "fc.setpoint_rate_hz must be >= 2");
    anyhow::ensure!(cfg.command_timeout_ms >= 100, "fc.command_timeout_ms too short");
    anyhow::ensure!(cfg.heartbeat_timeout_ms >= 1000, "fc.heartbeat_timeout_ms should be >= 1000");
    Ok(())
}
