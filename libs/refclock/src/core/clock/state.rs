// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::Ticks;

/// Mutable state of the reference clock.
///
/// Owned by [`super::ReferenceClock`] and only touched under its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockState {
    /// Authoritative virtual clock value. Never decreases.
    pub current_time: Ticks,
    /// Sub-tick error carried between updates, in `[0, 1)`.
    pub fractional_remainder: f64,
    /// Playback speed multiplier set by the resampler.
    pub speed: f64,
    /// Secondary multiplicative correction composed with `speed`.
    pub fine_adjust: f64,
    /// Measured vblanks per second.
    pub refresh_rate: f64,
    /// System-clock time of the most recent confirmed (or inferred) vblank.
    pub last_vblank_timestamp: Ticks,
    /// Vblanks inferred by consumers that the backend has not reported yet.
    pub missed_vblanks: u32,
    /// Cumulative count of inferred vblanks, for diagnostics.
    pub total_missed_vblanks: u32,
    /// Virtual minus system clock while the system clock is authoritative.
    pub clock_offset: Ticks,
    /// Whether the vblank backend currently drives the clock.
    pub use_vblank: bool,
    /// Largest value `get_time` has handed out.
    pub last_returned: Ticks,
}

impl ClockState {
    pub fn new(clock_offset: Ticks) -> Self {
        Self {
            current_time: 0,
            fractional_remainder: 0.0,
            speed: 1.0,
            fine_adjust: 1.0,
            refresh_rate: 0.0,
            last_vblank_timestamp: 0,
            missed_vblanks: 0,
            total_missed_vblanks: 0,
            clock_offset,
            use_vblank: false,
            last_returned: 0,
        }
    }

    /// System-clock ticks between two vblanks.
    pub fn nominal_interval(&self, frequency: i64) -> f64 {
        if self.refresh_rate > 0.0 {
            frequency as f64 / self.refresh_rate
        } else {
            0.0
        }
    }

    /// Virtual-clock ticks one vblank advances the clock by.
    pub fn tick_increment(&self, frequency: i64) -> f64 {
        if self.refresh_rate > 0.0 {
            self.speed * self.fine_adjust / self.refresh_rate * frequency as f64
        } else {
            0.0
        }
    }

    /// System-clock time after which the next vblank counts as overdue.
    pub fn overdue_deadline(&self, frequency: i64, slack: f64) -> Ticks {
        self.last_vblank_timestamp + (self.nominal_interval(frequency) * slack).round() as Ticks
    }

    /// Advance the clock by `nr_ticks` vblanks.
    ///
    /// With `check_missed` the call comes from the backend: vblanks a consumer
    /// already inferred are subtracted so they are not counted twice. Without
    /// it a consumer is inferring overdue vblanks: they are recorded as missed
    /// and the vblank timestamp is pushed forward by their nominal length.
    pub fn update_clock(&mut self, nr_ticks: u32, check_missed: bool, frequency: i64) {
        let mut nr_ticks = i64::from(nr_ticks);

        if check_missed {
            if nr_ticks < i64::from(self.missed_vblanks) {
                tracing::warn!(
                    "[ReferenceClock] Backend reported {} vblanks but {} were already inferred",
                    nr_ticks,
                    self.missed_vblanks
                );
            }
            nr_ticks -= i64::from(self.missed_vblanks);
            self.missed_vblanks = 0;
        } else {
            let inferred = nr_ticks as u32;
            self.missed_vblanks = self.missed_vblanks.saturating_add(inferred);
            self.total_missed_vblanks = self.total_missed_vblanks.saturating_add(inferred);
            self.last_vblank_timestamp +=
                (self.nominal_interval(frequency) * nr_ticks as f64).round() as Ticks;
        }

        if nr_ticks > 0 && self.refresh_rate > 0.0 {
            let increment = self.tick_increment(frequency) * nr_ticks as f64;
            let whole = increment.trunc();
            self.current_time += whole as Ticks;
            self.fractional_remainder += increment - whole;

            if self.fractional_remainder >= 1.0 {
                let carry = self.fractional_remainder.trunc();
                self.current_time += carry as Ticks;
                self.fractional_remainder -= carry;
            }
        }
    }
}
