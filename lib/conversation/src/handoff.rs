//! Human handoff gate.
//!
//! When a human operator writes to a contact, automated replies to that
//! contact pause for a cooldown window.

use crate::error::StoreError;
use crate::store::HumanActivityStore;
use chrono::Duration;
use rootcause::prelude::Report;
use std::sync::Arc;
use switchboard_core::{Clock, Identity, SystemClock};
use tracing::{debug, info};

/// Default cooldown after human activity.
pub const DEFAULT_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(300);

/// Decides whether automation is suppressed for an identity.
#[derive(Clone)]
pub struct HandoffGate {
    activity: HumanActivityStore,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
}

impl HandoffGate {
    /// Creates a gate with the default cooldown and the system clock.
    #[must_use]
    pub fn new(activity: HumanActivityStore) -> Self {
        Self {
            activity,
            clock: Arc::new(SystemClock),
            cooldown: Duration::seconds(DEFAULT_COOLDOWN.as_secs() as i64),
        }
    }

    /// Sets the cooldown window.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: std::time::Duration) -> Self {
        self.cooldown = Duration::from_std(cooldown).unwrap_or_else(|_| Duration::days(365 * 100));
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records human activity for `identity` now.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity store write fails.
    pub async fn mark_active(&self, identity: &Identity) -> Result<(), Report<StoreError>> {
        let now = self.clock.now();
        self.activity.record(identity, now).await?;
        info!(identity = %identity, "human operator active");
        Ok(())
    }

    /// Returns true while `identity` is inside its cooldown window.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity store read fails.
    pub async fn is_suppressed(&self, identity: &Identity) -> Result<bool, Report<StoreError>> {
        let Some(last) = self.activity.last_activity(identity).await? else {
            return Ok(false);
        };
        let since = self.clock.now() - last;
        let suppressed = since < self.cooldown;
        debug!(identity = %identity, since_secs = since.num_seconds(), suppressed, "handoff check");
        Ok(suppressed)
    }
}
