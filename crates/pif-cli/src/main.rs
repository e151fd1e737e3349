use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pif_fc::{doctor as fc_doctor, probe::probe_fc, FcConfig, FcLink};
use pif_mission::{doctor as mission_doctor, load_mission, MissionConfig, MissionOrchestrator, MissionReport, Outcome};
use pif_proto::VehicleLink;

#[derive(Debug, Parser)]
#[command(name = "pif", version, about = "PrintInFlight - offboard waypoint missions for PX4")]
struct Cli {
    /// TOML config with [fc] and [mission] sections. Everything is defaulted.
    #[arg(long)]
    config: Option<String>,

    /// Override fc.address, e.g. udpin://0.0.0.0:14540
    #[arg(long)]
    address: Option<String>,

    /// Override mission.mission_path
    #[arg(long)]
    mission: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fly the mission.
    Run,
    /// Print the parsed waypoints and headings.
    Inspect,
    /// Check config and mission source without touching the vehicle.
    Doctor,
    Fc { #[command(subcommand)] cmd: FcCmd },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Wait for an autopilot heartbeat on the configured address.
    Probe,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    fc: FcConfig,
    mission: MissionConfig,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
            toml::from_str(&s).context("parse config toml")?
        }
        None => Config::default(),
    };
    if let Some(a) = &cli.address {
        cfg.fc.address = a.clone();
    }
    if let Some(m) = &cli.mission {
        cfg.mission.mission_path = m.clone();
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.cmd {
        Command::Run => run(&cfg).await?,
        Command::Inspect => inspect(&cfg)?,
        Command::Doctor => doctor(&cfg)?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");
    fc_doctor::check_fc_config(&cfg.fc)?;
    mission_doctor::check_mission_config(&cfg.mission)?;

    let link: Arc<dyn VehicleLink> = Arc::new(FcLink::new(cfg.fc.clone()));
    let orch = MissionOrchestrator::new(link, cfg.mission.clone());

    let report = orch
        .run_mission(&cfg.fc.address, &cfg.mission.mission_path, ctrl_c())
        .await
        .context("mission failed")?;

    print_report(&report);
    match report.outcome {
        Outcome::Aborted => anyhow::bail!("mission aborted by operator"),
        Outcome::Completed | Outcome::Interrupted(_) => Ok(()),
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler can't be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

fn print_report(r: &MissionReport) {
    println!("outcome: {}", r.outcome);
    println!("waypoints_reached={}", r.waypoints_reached);
    if let Some(sp) = r.last_command {
        println!(
            "last_command N={:.2} E={:.2} D={:.2} yaw={:.1}",
            sp.north_m, sp.east_m, sp.down_m, sp.yaw_deg
        );
    }
    println!("battery_emergency={}", r.battery_emergency);
    println!("started_at={} elapsed={:.1}s", r.started_at, r.elapsed.as_secs_f32());
    println!("phases={:?}", r.phases);
    for w in &r.warnings {
        println!("warning: {}", w);
    }
}

fn inspect(cfg: &Config) -> Result<()> {
    let path = &cfg.mission.mission_path;
    let wps = load_mission(path).with_context(|| format!("load mission {}", path))?;
    println!("{} waypoint(s) from {}", wps.len(), path);
    for (i, w) in wps.iter().enumerate() {
        println!(
            "#{} row={} N={:.2} E={:.2} D={:.2} yaw={:.1}",
            i + 1,
            w.row,
            w.north_m,
            w.east_m,
            w.down_m,
            w.yaw_deg
        );
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    fc_doctor::check_fc_config(&cfg.fc)?;
    mission_doctor::check_mission_config(&cfg.mission)?;
    let n = mission_doctor::check_mission_source(&cfg.mission.mission_path)?;
    info!("doctor: mission {} has {} waypoint(s)", cfg.mission.mission_path, n);
    info!("doctor: OK");
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Probe => {
            let timeout = Duration::from_millis(cfg.fc.heartbeat_timeout_ms);
            let p = probe_fc(&cfg.fc, timeout).await?;
            println!("address={}", p.address);
            println!("heartbeat={} {}ms", p.hb_seen, p.elapsed_ms);
            println!("mode={:?} armed={}", p.mode, p.armed);
            println!("note={}", p.note);
            anyhow::ensure!(p.hb_seen, "no heartbeat on {}", p.address);
            Ok(())
        }
    }
}
