//! Match timing configuration and engine settings
//!
//! `MatchConfig` is supplied by the match-configuration collaborator when a
//! session starts; `EngineSettings` is fixed for the whole registry.

use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::constants;

type ValidationResult = garde::Result;

/// Validates that a duration in milliseconds falls within the given bounds
fn validate_interval<const MIN_MS: u64, const MAX_MS: u64>(val: &Duration) -> ValidationResult {
    let millis = u64::try_from(val.as_millis()).unwrap_or(u64::MAX);
    if (MIN_MS..=MAX_MS).contains(&millis) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "outside of bounds [{MIN_MS}ms,{MAX_MS}ms]"
        )))
    }
}

/// Validates a tick cadence against the configured limits
fn validate_cadence(val: &Duration, _ctx: &()) -> ValidationResult {
    validate_interval::<
        { constants::timer::MIN_INTERVAL_MS },
        { constants::timer::MAX_INTERVAL_MS },
    >(val)
}

/// Timer cadences for one match
#[serde_with::serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct MatchConfig {
    /// Cadence of the normal countdown
    #[garde(custom(validate_cadence))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    /// Cadence once the manager triggers panic mode
    #[garde(custom(validate_cadence))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub panic_interval: Duration,
    /// Refresh cadence while a free-text countdown is paused
    #[garde(custom(validate_cadence))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub histogram_interval: Duration,
    /// Wake-ups without typing after which a player counts as idle
    #[garde(range(min = 1))]
    pub typing_idle_ticks: u32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(constants::timer::TICK_INTERVAL_MS),
            panic_interval: Duration::from_millis(constants::timer::PANIC_INTERVAL_MS),
            histogram_interval: Duration::from_millis(constants::timer::HISTOGRAM_INTERVAL_MS),
            typing_idle_ticks: constants::timer::TYPING_IDLE_TICKS,
        }
    }
}

/// Settings shared by every session of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Delay before a completed or abandoned session is removed
    pub grace_period: Duration,
    /// Bounded size of each session mailbox
    pub mailbox_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(constants::session::GRACE_PERIOD_SECS),
            mailbox_capacity: constants::session::MAILBOX_CAPACITY,
        }
    }
}
