// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank backend over a monotonically increasing hardware vblank counter.

use crate::core::{
    BackendExit, ClockError, RateMonitor, RefreshRateEstimator, Result, RunContext, VblankBackend,
};
use std::time::Duration;

/// A hardware vblank counter.
///
/// Implemented by the DRM vblank event (Linux) and the simulated counter.
pub trait VsyncCounter: Send {
    /// Used for logging.
    fn name(&self) -> &str;

    /// Acquire the device. Fails with [`ClockError::Unsupported`] when absent.
    fn open(&mut self, ctx: &RunContext) -> Result<()>;

    /// Block for at most `timeout` until the counter advances.
    ///
    /// Returns the counter value, or `None` on timeout.
    fn wait_for_vblank(&mut self, timeout: Duration) -> Result<Option<u64>>;

    /// Release the device. Must tolerate a failed or skipped `open`.
    fn close(&mut self);

    /// Exact frame rate if the platform reports one.
    fn nominal_rate(&self) -> Option<f64> {
        None
    }
}

/// Shortest and longest single wait while running; the stop flag is checked
/// between waits.
const MIN_WAIT_SLICE: Duration = Duration::from_millis(10);
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct CounterBackend<C: VsyncCounter> {
    counter: C,
    refresh_rate: f64,
    last_counter: Option<u64>,
    opened: bool,
    name: String,
}

impl<C: VsyncCounter> CounterBackend<C> {
    pub fn new(counter: C) -> Self {
        let name = format!("counter:{}", counter.name());
        Self {
            counter,
            refresh_rate: 0.0,
            last_counter: None,
            opened: false,
            name,
        }
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    fn wait_slice(&self) -> Duration {
        if self.refresh_rate > 0.0 {
            Duration::from_secs_f64(2.0 / self.refresh_rate).clamp(MIN_WAIT_SLICE, MAX_WAIT_SLICE)
        } else {
            MAX_WAIT_SLICE
        }
    }
}

/// Ticks between two counter readings. A smaller reading is a counter reset.
fn counter_delta(previous: Option<u64>, current: u64) -> Result<u64> {
    match previous {
        None => Ok(1),
        Some(previous) if current < previous => Err(ClockError::CounterReset { previous, current }),
        Some(previous) => Ok(current - previous),
    }
}

impl<C: VsyncCounter> VblankBackend for CounterBackend<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, ctx: &RunContext) -> Result<()> {
        self.counter.open(ctx)?;
        self.opened = true;
        self.last_counter = None;

        let config = ctx.config();
        let estimator = RefreshRateEstimator::from_config(config);
        self.refresh_rate = match self.counter.nominal_rate() {
            Some(rate) => estimator.nominal(rate),
            None => {
                let counter = &mut self.counter;
                let last = &mut self.last_counter;
                estimator.measure(
                    ctx.clock().time_source().as_ref(),
                    config.measurement_windows,
                    config.measurement_window(),
                    |timeout| match counter.wait_for_vblank(timeout)? {
                        None => Ok(0),
                        Some(value) => {
                            let delta = counter_delta(*last, value)?;
                            *last = Some(value);
                            Ok(delta)
                        }
                    },
                )?
            }
        };

        tracing::info!(
            "[CounterBackend] {} measured {:.3} Hz",
            self.counter.name(),
            self.refresh_rate
        );
        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> BackendExit {
        let time = ctx.clock().time_source().clone();
        let estimator = RefreshRateEstimator::from_config(ctx.config());
        let mut monitor = RateMonitor::new(ctx.config().rate_recheck_interval(), time.as_ref());
        let event_timeout = ctx.config().event_timeout();
        let slice = self.wait_slice();
        let mut last_event = ctx.now();

        loop {
            if let Some(exit) = ctx.interruption() {
                return exit;
            }

            let value = match self.counter.wait_for_vblank(slice) {
                Ok(Some(value)) => value,
                Ok(None) => {
                    if time.ticks_to_duration(ctx.now() - last_event) >= event_timeout {
                        tracing::warn!(
                            "[CounterBackend] {} silent for {:?}",
                            self.counter.name(),
                            event_timeout
                        );
                        return BackendExit::DeviceLost;
                    }
                    continue;
                }
                Err(e) => return BackendExit::Failed(e),
            };

            let now = ctx.now();
            last_event = now;
            let delta = match counter_delta(self.last_counter, value) {
                Ok(delta) => delta,
                Err(e) => {
                    tracing::warn!("[CounterBackend] {}: {}", self.counter.name(), e);
                    return BackendExit::CounterReset;
                }
            };
            self.last_counter = Some(value);
            if delta == 0 {
                continue;
            }

            ctx.vblank(u32::try_from(delta).unwrap_or(u32::MAX), now);

            if let Some(measured) = monitor.on_ticks(now, delta) {
                let measured = estimator.normalize(measured);
                tracing::trace!("[CounterBackend] Re-check: {:.3} Hz", measured);
                if RateMonitor::changed(self.refresh_rate, measured) {
                    return BackendExit::RateChanged {
                        from: self.refresh_rate,
                        to: measured,
                    };
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if self.opened {
            self.counter.close();
            self.opened = false;
        }
        self.last_counter = None;
    }

    fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }
}
