// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! System-clock time sources.
//!
//! The reference clock measures everything in [`Ticks`] of an underlying
//! free-running system clock whose rate is [`TimeSource::frequency`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// System-clock tick count.
pub type Ticks = i64;

/// Free-running monotonic system clock.
///
/// Safe to call from any thread concurrently.
pub trait TimeSource: Send + Sync {
    /// Current system-clock value in ticks.
    fn now(&self) -> Ticks;

    /// Ticks per second. Constant for the lifetime of the source.
    fn frequency(&self) -> i64;

    /// Convert a tick delta to a `Duration`. Negative deltas clamp to zero.
    fn ticks_to_duration(&self, ticks: Ticks) -> Duration {
        if ticks <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(ticks as f64 / self.frequency() as f64)
    }

    /// Convert a `Duration` to ticks, rounded to the nearest tick.
    fn duration_to_ticks(&self, duration: Duration) -> Ticks {
        (duration.as_secs_f64() * self.frequency() as f64).round() as Ticks
    }
}

/// Nanosecond-resolution system clock backed by `Instant`.
pub struct MonotonicTimeSource {
    start_time: Instant,
}

impl MonotonicTimeSource {
    pub const FREQUENCY: i64 = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTimeSource {
    fn now(&self) -> Ticks {
        self.start_time.elapsed().as_nanos() as Ticks
    }

    fn frequency(&self) -> i64 {
        Self::FREQUENCY
    }
}

/// Hand-driven system clock for deterministic tests and simulations.
pub struct ManualTimeSource {
    now: AtomicI64,
    frequency: i64,
}

impl ManualTimeSource {
    /// # Panics
    ///
    /// Panics if `frequency` is not positive.
    pub fn new(frequency: i64) -> Self {
        assert!(frequency > 0, "time source frequency must be positive");
        Self {
            now: AtomicI64::new(0),
            frequency,
        }
    }

    pub fn set(&self, ticks: Ticks) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: Ticks) -> Ticks {
        self.now.fetch_add(ticks, Ordering::SeqCst) + ticks
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Ticks {
        self.now.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> i64 {
        self.frequency
    }
}
