pub mod authority;
pub mod battery;
pub mod command;
pub mod config;
pub mod convergence;
pub mod doctor;
pub mod error;
pub mod orchestrator;
pub mod shared;
pub mod waypoint;

pub use config::MissionConfig;
pub use error::{MissionError, MissionWarning, ParseError};
pub use orchestrator::{Interruption, InterruptReason, MissionOrchestrator, MissionReport, Outcome, Phase};
pub use waypoint::{load_mission, parse_mission, Waypoint};
