use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use pif_proto::{FlightMode, VehicleLink};

use crate::mav::FcLink;
use crate::FcConfig;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub address: String,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub mode: FlightMode,
    pub armed: bool,
    pub note: String,
}

/// Open the configured endpoint and wait up to `heartbeat_timeout` for the
/// autopilot's heartbeat. Nothing is sent besides our own heartbeat.
pub async fn probe_fc(cfg: &FcConfig, heartbeat_timeout: Duration) -> Result<ProbeResult> {
    let start = Instant::now();
    let link = FcLink::new(cfg.clone());
    link.connect(&cfg.address)
        .await
        .with_context(|| format!("open fc link {}", cfg.address))?;

    let mut connected = link.connection_state();
    let hb_seen = tokio::time::timeout(heartbeat_timeout, connected.wait_for(|c| *c)).await.is_ok_and(|r| r.is_ok());

    let st = link.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let note = if hb_seen {
        info!("fc probe: OK {} ({}ms)", cfg.address, elapsed_ms);
        match st.last_msg {
            Some(m) => format!("heartbeat, last {}", m),
            None => "heartbeat".into(),
        }
    } else {
        warn!("fc probe: no heartbeat on {} within {:?}", cfg.address, heartbeat_timeout);
        "no heartbeat".into()
    };

    Ok(ProbeResult {
        address: st.address.unwrap_or_else(|| cfg.address.clone()),
        hb_seen,
        elapsed_ms,
        mode: st.mode,
        armed: st.armed,
        note,
    })
}
