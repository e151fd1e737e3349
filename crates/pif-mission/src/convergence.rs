use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use pif_proto::PositionNed;

use crate::shared::AuthorityFlag;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitOutcome {
    Reached(PositionNed),
    /// Autonomous control was not granted at a poll tick.
    Interrupted,
    TimedOut,
}

/// Blocks until the latest position sample is strictly within a threshold of
/// a target.
///
/// The position source is a latest-value cell, so each tick sees only the
/// newest sample; anything older was overwritten and is never looked at.
pub struct ConvergenceWaiter {
    position: watch::Receiver<Option<PositionNed>>,
    authority: Option<AuthorityFlag>,
    poll: Duration,
    timeout: Option<Duration>,
}

impl ConvergenceWaiter {
    /// Gives up with `Interrupted` as soon as `authority` is not granted.
    pub fn gated(position: watch::Receiver<Option<PositionNed>>, authority: AuthorityFlag, poll: Duration) -> Self {
        Self { position, authority: Some(authority), poll, timeout: None }
    }

    /// For flows that run without offboard control, e.g. RTL.
    pub fn ungated(position: watch::Receiver<Option<PositionNed>>, poll: Duration) -> Self {
        Self { position, authority: None, poll, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn wait_for(&mut self, target: PositionNed, threshold_m: f32) -> WaitOutcome {
        info!(
            "-- Waiting to reach waypoint: N={}m, E={}m, D={}m (threshold: {}m)",
            target.north_m, target.east_m, target.down_m, threshold_m
        );
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let latest = *self.position.borrow_and_update();
            if let Some(pos) = latest {
                let distance = pos.distance_to(&target);
                if distance < threshold_m {
                    info!("-- Reached waypoint! Final distance: {:.2}m", distance);
                    return WaitOutcome::Reached(pos);
                }
            }

            if let Some(flag) = &self.authority {
                if !flag.is_granted() {
                    return WaitOutcome::Interrupted;
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("-- Waypoint not reached within {:?}", self.timeout.unwrap_or_default());
                return WaitOutcome::TimedOut;
            }
        }
    }
}
