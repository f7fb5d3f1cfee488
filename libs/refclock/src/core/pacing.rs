// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Sleep discipline for polling backends.
//!
//! A poller that just detected a tick knows the next one is a full period away,
//! so it sleeps through the first part of that period and then polls at a short
//! interval until the tick shows up.

use super::ClockConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSleep {
    after_tick_fraction: f64,
    poll_interval: Duration,
}

impl AdaptiveSleep {
    pub const DEFAULT_AFTER_TICK_FRACTION: f64 = 0.5;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new(after_tick_fraction: f64, poll_interval: Duration) -> Self {
        Self {
            after_tick_fraction: after_tick_fraction.clamp(0.0, 1.0),
            poll_interval,
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        Self::new(config.poll_sleep_fraction, config.poll_interval())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// How long to sleep right after a tick was detected.
    pub fn after_tick(&self, tick_period: Duration) -> Duration {
        tick_period.mul_f64(self.after_tick_fraction)
    }

    /// How long to sleep between polls while a tick is pending.
    ///
    /// Never longer than what is left of the current period past `since_tick`.
    pub fn between_polls(&self, since_tick: Duration, tick_period: Duration) -> Duration {
        let remaining = tick_period.saturating_sub(since_tick);
        if remaining.is_zero() {
            self.poll_interval
        } else {
            self.poll_interval.min(remaining)
        }
    }
}

impl Default for AdaptiveSleep {
    fn default() -> Self {
        Self::new(Self::DEFAULT_AFTER_TICK_FRACTION, Self::DEFAULT_POLL_INTERVAL)
    }
}
