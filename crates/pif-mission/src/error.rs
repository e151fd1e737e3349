use std::time::Duration;

use pif_proto::LinkError;

/// Malformed mission source. Always raised before any vehicle command.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("read mission source {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("row {row}: expected north,east,down but found {found} column(s)")]
    MissingColumns { row: usize, found: usize },

    #[error("row {row}, {column}: {value:?} is not a finite number")]
    BadNumber { row: usize, column: &'static str, value: String },

    #[error("mission source has no waypoint rows")]
    Empty,
}

/// Conditions that abort the mission before arming.
#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("connection failure")]
    Connection(#[source] LinkError),

    #[error("connection failure: vehicle not connected after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("health check never satisfied: global/home position not OK after {0:?}")]
    HealthCheckTimeout(Duration),

    #[error("invalid mission source")]
    Parse(#[from] ParseError),

    #[error("vehicle setup failed")]
    Setup(#[source] LinkError),

    #[error("arming failed")]
    Arm(#[source] LinkError),
}

/// Absorbed conditions, logged and kept in the mission report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MissionWarning {
    #[error("parameter {name} not applied: {error}")]
    ParameterSet { name: String, error: LinkError },

    #[error("{what} command failed: {error}")]
    Command { what: &'static str, error: LinkError },

    #[error("could not stop offboard control: {0}")]
    StopAutonomousControl(LinkError),

    #[error("emergency RTL failed: {0}")]
    EmergencyRtl(LinkError),

    #[error("emergency home position not reached")]
    EmergencyHomeNotReached,

    #[error("home position not reached before landing")]
    HomeNotReached,

    #[error("control lost during return to home")]
    ReturnInterrupted,
}
