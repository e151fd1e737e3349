use tokio::sync::watch;
use tracing::{debug, info, warn};

use pif_proto::FlightMode;

use crate::shared::{AuthorityFlag, ShutdownSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityChange {
    Gained,
    Lost,
}

/// Tracks who is flying: us (offboard) or anybody else.
pub struct ControlAuthorityMonitor {
    flag: AuthorityFlag,
    modes: watch::Receiver<FlightMode>,
}

impl ControlAuthorityMonitor {
    pub fn new(flag: AuthorityFlag, modes: watch::Receiver<FlightMode>) -> Self {
        Self { flag, modes }
    }

    /// Apply one mode event. Returns the transition, if any; repeated
    /// identical events are no-ops.
    pub fn observe(&self, mode: FlightMode) -> Option<AuthorityChange> {
        let granted = mode.grants_autonomous_control();
        if self.flag.is_granted() == granted {
            return None;
        }
        self.flag.store(granted);
        Some(if granted { AuthorityChange::Gained } else { AuthorityChange::Lost })
    }

    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let initial = *self.modes.borrow_and_update();
        self.report(initial);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("-- Flight mode monitoring stopped");
                    return;
                }
                changed = self.modes.changed() => {
                    if changed.is_err() {
                        warn!("flight mode stream closed; treating control as lost");
                        self.report(FlightMode::Unknown);
                        return;
                    }
                    let mode = *self.modes.borrow_and_update();
                    self.report(mode);
                }
            }
        }
    }

    fn report(&self, mode: FlightMode) {
        match self.observe(mode) {
            Some(AuthorityChange::Gained) => info!("-- Offboard has taken control"),
            Some(AuthorityChange::Lost) => warn!("-- Offboard has lost control (mode {:?})", mode),
            None => debug!("flight mode {:?}", mode),
        }
    }
}
