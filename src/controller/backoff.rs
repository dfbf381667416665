//! Requeue delay calculation
//!
//! Retries back off linearly: attempt `n` waits `n * min`, capped at `max`.

use std::time::Duration;

use crate::config::OperatorSettings;

/// Delay before dispatching `attempt`, linear in the attempt and capped at `max`
///
/// Attempt 0 (a fresh watch event) dispatches immediately.
pub fn requeue_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    min.saturating_mul(attempt).min(max)
}

/// Requeue interval bounds taken from the operator settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub min: Duration,
    pub max: Duration,
}

impl RequeuePolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        requeue_delay(attempt, self.min, self.max)
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::from(&OperatorSettings::default())
    }
}

impl From<&OperatorSettings> for RequeuePolicy {
    fn from(settings: &OperatorSettings) -> Self {
        Self::new(
            settings.min_requeue_interval(),
            settings.max_requeue_interval(),
        )
    }
}
