//! Configuration constants for the match engine
//!
//! This module contains the limits and default timings used throughout the
//! engine to keep question data bounded and session timing consistent.

/// Session-wide limits
pub mod session {
    /// Maximum number of participants (all roles) attached to one session
    pub const MAX_PARTICIPANT_COUNT: usize = 1000;
    /// Maximum number of questions in a single match
    pub const MAX_QUESTION_COUNT: usize = 100;
    /// Grace period in seconds before a finished or empty session is torn down
    pub const GRACE_PERIOD_SECS: u64 = 30;
    /// Capacity of each session's command mailbox
    pub const MAILBOX_CAPACITY: usize = 256;
}

/// Question content limits
pub mod question {
    /// Minimum length of a question text
    pub const MIN_TEXT_LENGTH: usize = 1;
    /// Maximum length of a question text
    pub const MAX_TEXT_LENGTH: usize = 200;
    /// Minimum time in seconds a question may allow for answers
    pub const MIN_TIME_ALLOWED: u32 = 10;
    /// Maximum time in seconds a question may allow for answers
    pub const MAX_TIME_ALLOWED: u32 = 60;
    /// Minimum points a question is worth
    pub const MIN_POINTS: u64 = 10;
    /// Maximum points a question is worth
    pub const MAX_POINTS: u64 = 100;
    /// Minimum number of options on a choice question
    pub const MIN_CHOICE_COUNT: usize = 2;
    /// Maximum number of options on a choice question
    pub const MAX_CHOICE_COUNT: usize = 4;
    /// Maximum length of a single option text
    pub const MAX_CHOICE_LENGTH: usize = 200;
    /// Maximum length of a free-text answer
    pub const MAX_FREE_TEXT_LENGTH: usize = 200;
}

/// Timer cadence defaults (milliseconds)
pub mod timer {
    /// Normal countdown cadence: one unit of remaining time per second
    pub const TICK_INTERVAL_MS: u64 = 1000;
    /// Accelerated cadence used in panic mode
    pub const PANIC_INTERVAL_MS: u64 = 250;
    /// Refresh cadence while a free-text countdown is paused
    pub const HISTOGRAM_INTERVAL_MS: u64 = 1000;
    /// Wake-ups after which a typing hint is considered idle
    pub const TYPING_IDLE_TICKS: u32 = 5;
    /// Slowest cadence accepted in a match configuration
    pub const MAX_INTERVAL_MS: u64 = 10_000;
    /// Fastest cadence accepted in a match configuration
    pub const MIN_INTERVAL_MS: u64 = 50;
}

/// Scoring policy
pub mod scoring {
    /// Multiplier applied to the first correct finalized choice answer
    pub const BONUS_MULTIPLIER: f64 = 1.2;
    /// Number of equal-width buckets in a numeric-range histogram
    pub const NUMERIC_BUCKETS: usize = 10;
}
