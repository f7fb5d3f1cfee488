// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Refresh-rate estimation.
//!
//! A forced estimation runs several short timed windows against a backend,
//! drops unusable samples and averages the upper half of what is left. While a
//! backend runs, [`RateMonitor`] re-checks the rate at most once per interval.

use super::{ClockConfig, ClockError, Result, Ticks, TimeSource};
use std::time::Duration;

/// Turns raw refresh-rate samples into the rate the clock ticks at.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRateEstimator {
    round_up: Vec<u32>,
    interlaced: bool,
}

impl RefreshRateEstimator {
    pub fn new(round_up: Vec<u32>, interlaced: bool) -> Self {
        Self {
            round_up,
            interlaced,
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        Self::new(config.rate_round_up.clone(), config.interlaced)
    }

    /// Mean of the upper half of the usable samples.
    ///
    /// Zero, negative and non-finite samples are discarded first. Returns
    /// `None` when nothing usable is left.
    pub fn robust_average(samples: &[f64]) -> Option<f64> {
        let mut valid: Vec<f64> = samples
            .iter()
            .copied()
            .filter(|s| s.is_finite() && *s > 0.0)
            .collect();
        if valid.is_empty() {
            return None;
        }

        valid.sort_by(|a, b| b.total_cmp(a));
        let upper = valid.len().div_ceil(2);
        let sum: f64 = valid[..upper].iter().sum();
        Some(sum / upper as f64)
    }

    /// Round a measured tick rate to whole Hz and apply the 1000/1001 bump.
    pub fn normalize(&self, raw: f64) -> f64 {
        let rounded = raw.round();
        if rounded > 0.0 && self.round_up.contains(&(rounded as u32)) {
            rounded + 1.0
        } else {
            rounded
        }
    }

    /// Rate reported exactly by the platform (display-link fps, mode info).
    ///
    /// Not rounded. Interlaced modes report frames but tick per field.
    pub fn nominal(&self, frame_rate: f64) -> f64 {
        if self.interlaced {
            frame_rate * 2.0
        } else {
            frame_rate
        }
    }

    /// Reduce timed-window samples to a tick rate.
    ///
    /// At least half of the windows must have produced a usable sample.
    pub fn estimate(&self, samples: &[f64]) -> Result<f64> {
        let usable = samples.iter().filter(|s| s.is_finite() && **s > 0.0).count();
        if usable == 0 || usable * 2 < samples.len() {
            return Err(ClockError::MeasurementInconclusive(format!(
                "{} of {} windows produced a usable sample",
                usable,
                samples.len()
            )));
        }

        let average = Self::robust_average(samples).ok_or_else(|| {
            ClockError::MeasurementInconclusive("no usable samples".into())
        })?;
        let rate = self.normalize(average);
        if rate <= 0.0 {
            return Err(ClockError::MeasurementInconclusive(format!(
                "measured rate {:.3} Hz rounds to zero",
                average
            )));
        }
        Ok(rate)
    }

    /// Run a forced estimation.
    ///
    /// `wait_tick` blocks for at most the given timeout and returns how many
    /// vblanks passed (0 on timeout). The first tick only aligns the windows.
    pub fn measure<F>(
        &self,
        time: &dyn TimeSource,
        windows: usize,
        window: Duration,
        mut wait_tick: F,
    ) -> Result<f64>
    where
        F: FnMut(Duration) -> Result<u64>,
    {
        if wait_tick(window)? == 0 {
            return Err(ClockError::MeasurementInconclusive(
                "no vblank within the first window".into(),
            ));
        }

        let window_ticks = time.duration_to_ticks(window);
        let mut samples = Vec::with_capacity(windows);
        for _ in 0..windows {
            let start = time.now();
            let mut ticks = 0u64;
            let mut end = start;
            while end - start < window_ticks {
                let n = wait_tick(window)?;
                end = time.now();
                if n == 0 {
                    ticks = 0;
                    break;
                }
                ticks += n;
            }

            let sample = if end > start {
                ticks as f64 * time.frequency() as f64 / (end - start) as f64
            } else {
                0.0
            };
            tracing::trace!("[RefreshRateEstimator] window: {} ticks, {:.3} Hz", ticks, sample);
            samples.push(sample);
        }

        let rate = self.estimate(&samples)?;
        tracing::debug!(
            "[RefreshRateEstimator] Samples {:?} -> {:.3} Hz",
            samples,
            rate
        );
        Ok(rate)
    }
}

/// Periodic refresh-rate re-check for a running backend.
///
/// Windows start and end on tick timestamps, so the sample is the exact tick
/// count over the exact time it took.
#[derive(Debug, Clone)]
pub struct RateMonitor {
    interval: Ticks,
    frequency: i64,
    window_start: Option<Ticks>,
    ticks: u64,
}

impl RateMonitor {
    pub fn new(interval: Duration, time: &dyn TimeSource) -> Self {
        Self {
            interval: time.duration_to_ticks(interval).max(1),
            frequency: time.frequency(),
            window_start: None,
            ticks: 0,
        }
    }

    /// Feed a tick. Returns a measured rate at most once per interval.
    pub fn on_ticks(&mut self, timestamp: Ticks, n: u64) -> Option<f64> {
        let Some(start) = self.window_start else {
            self.window_start = Some(timestamp);
            self.ticks = 0;
            return None;
        };

        self.ticks += n;
        let elapsed = timestamp - start;
        if elapsed < self.interval {
            return None;
        }

        let rate = self.ticks as f64 * self.frequency as f64 / elapsed as f64;
        self.window_start = Some(timestamp);
        self.ticks = 0;
        Some(rate)
    }

    /// Whether `measured` (already normalized) differs from the running rate.
    pub fn changed(current: f64, measured: f64) -> bool {
        (current - measured).abs() > 0.5
    }
}
