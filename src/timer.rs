//! Session countdown
//!
//! A [`Timer`] owns the remaining time of the question being played and
//! hands out [`Schedule`]s describing the wake-ups it needs. Whoever owns
//! the session turns a schedule into actual wake-ups (see [`drive`]) and
//! feeds them back through [`Timer::tick`].
//!
//! Every schedule carries a cancellation token and an epoch. Stopping or
//! rescheduling cancels the token, and `tick` ignores any epoch other than
//! the current one, so a stopped timer never produces an observable tick.

use std::{future::Future, time::Duration};

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Error;

/// How the countdown is currently paced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimerMode {
    /// Regular cadence
    Normal,
    /// Accelerated cadence, remaining time untouched
    Panic,
    /// Countdown paused by the manager; only refreshes typing activity
    Histogram,
}

/// A request for recurring wake-ups
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Time between wake-ups
    pub interval: Duration,
    /// Epoch to report with every wake-up
    pub epoch: u64,
    /// Cancelled when the schedule is superseded
    pub token: CancellationToken,
}

/// What a wake-up meant for the countdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The countdown moved on
    Tick {
        /// Remaining units after this tick
        remaining: u32,
    },
    /// The countdown reached zero; emitted exactly once
    Expired,
    /// A histogram-mode refresh; remaining time is frozen
    Refresh,
}

/// The countdown of one session
#[derive(Debug, Default)]
pub struct Timer {
    remaining: u32,
    mode: Option<TimerMode>,
    epoch: u64,
    token: Option<CancellationToken>,
}

impl Timer {
    /// Remaining time, in ticks
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Current mode, or `None` when nothing is scheduled
    pub fn mode(&self) -> Option<TimerMode> {
        self.mode
    }

    /// Whether a countdown (normal or panic) is running
    pub fn is_running(&self) -> bool {
        matches!(self.mode, Some(TimerMode::Normal | TimerMode::Panic))
    }

    fn reschedule(&mut self, mode: TimerMode, interval: Duration) -> Schedule {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.mode = Some(mode);

        let token = CancellationToken::new();
        self.token = Some(token.clone());

        Schedule {
            interval,
            epoch: self.epoch,
            token,
        }
    }

    /// Starts a countdown of `duration` ticks
    ///
    /// A histogram-mode refresh schedule is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerAlreadyRunning`] if a countdown is running.
    pub fn start(&mut self, duration: u32, interval: Duration) -> Result<Schedule, Error> {
        if self.is_running() {
            return Err(Error::TimerAlreadyRunning);
        }
        self.remaining = duration;
        debug!(duration, ?interval, "timer started");
        Ok(self.reschedule(TimerMode::Normal, interval))
    }

    /// Restarts ticking from `from` after a pause
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerAlreadyRunning`] if a countdown is running.
    pub fn resume(&mut self, from: u32, interval: Duration) -> Result<Schedule, Error> {
        self.start(from, interval)
    }

    /// Switches to the panic cadence without touching remaining time
    ///
    /// Returns `Ok(None)` if the timer is already in panic mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerNotRunning`] if no countdown is running.
    pub fn enter_panic_mode(&mut self, interval: Duration) -> Result<Option<Schedule>, Error> {
        match self.mode {
            Some(TimerMode::Panic) => Ok(None),
            Some(TimerMode::Normal) => {
                debug!(remaining = self.remaining, "timer entering panic mode");
                Ok(Some(self.reschedule(TimerMode::Panic, interval)))
            }
            Some(TimerMode::Histogram) | None => Err(Error::TimerNotRunning),
        }
    }

    /// Freezes the countdown and keeps a slow refresh cadence
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerNotRunning`] if no countdown is running.
    pub fn pause_with_refresh(&mut self, interval: Duration) -> Result<Schedule, Error> {
        if !self.is_running() {
            return Err(Error::TimerNotRunning);
        }
        debug!(remaining = self.remaining, "timer paused with refresh");
        Ok(self.reschedule(TimerMode::Histogram, interval))
    }

    /// Cancels any schedule; idempotent
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
            debug!(remaining = self.remaining, "timer stopped");
        }
        self.mode = None;
    }

    /// Applies a wake-up
    ///
    /// Returns `None` for wake-ups from a superseded or stopped schedule.
    pub fn tick(&mut self, epoch: u64) -> Option<TickOutcome> {
        if epoch != self.epoch {
            return None;
        }

        match self.mode? {
            TimerMode::Histogram => Some(TickOutcome::Refresh),
            TimerMode::Normal | TimerMode::Panic => {
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining < 1 {
                    self.stop();
                    Some(TickOutcome::Expired)
                } else {
                    Some(TickOutcome::Tick {
                        remaining: self.remaining,
                    })
                }
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

/// Turns a schedule into wake-ups until it is cancelled
///
/// `wake` is called with the schedule's epoch once per interval; returning
/// `false` ends the loop (the receiver is gone).
pub async fn drive<F, Fut>(schedule: Schedule, mut wake: F)
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = bool>,
{
    let Schedule {
        interval,
        epoch,
        token,
    } = schedule;

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                if token.is_cancelled() || !wake(epoch).await {
                    break;
                }
            }
        }
    }
}
