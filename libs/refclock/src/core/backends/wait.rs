// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank backend over a blocking "wait for next vblank" call.

use crate::core::{
    BackendExit, RateMonitor, RefreshRateEstimator, Result, RunContext, Ticks, VblankBackend,
};
use std::time::Duration;

/// A platform call that blocks until the next vertical blank.
pub trait VblankWaiter: Send {
    fn name(&self) -> &str;

    fn open(&mut self, ctx: &RunContext) -> Result<()>;

    /// Block for at most `timeout`. `Ok(false)` on timeout.
    fn wait_for_vblank(&mut self, timeout: Duration) -> Result<bool>;

    fn close(&mut self);
}

const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct WaitBackend<W: VblankWaiter> {
    waiter: W,
    refresh_rate: f64,
    opened: bool,
    name: String,
}

impl<W: VblankWaiter> WaitBackend<W> {
    pub fn new(waiter: W) -> Self {
        let name = format!("wait:{}", waiter.name());
        Self {
            waiter,
            refresh_rate: 0.0,
            opened: false,
            name,
        }
    }
}

/// Vblanks covered by a gap of `elapsed` ticks at `interval` ticks per vblank.
fn ticks_in_gap(elapsed: Ticks, interval: f64) -> u64 {
    if interval <= 0.0 {
        return 1;
    }
    (elapsed as f64 / interval).round().max(1.0) as u64
}

impl<W: VblankWaiter> VblankBackend for WaitBackend<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, ctx: &RunContext) -> Result<()> {
        self.waiter.open(ctx)?;
        self.opened = true;

        let config = ctx.config();
        let waiter = &mut self.waiter;
        let rate = RefreshRateEstimator::from_config(config).measure(
            ctx.clock().time_source().as_ref(),
            config.measurement_windows,
            config.measurement_window(),
            |timeout| Ok(u64::from(waiter.wait_for_vblank(timeout)?)),
        )?;
        self.refresh_rate = rate;

        tracing::info!(
            "[WaitBackend] {} measured {:.3} Hz",
            self.waiter.name(),
            self.refresh_rate
        );
        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> BackendExit {
        let time = ctx.clock().time_source().clone();
        let estimator = RefreshRateEstimator::from_config(ctx.config());
        let mut monitor = RateMonitor::new(ctx.config().rate_recheck_interval(), time.as_ref());
        let event_timeout = ctx.config().event_timeout();
        let interval = time.frequency() as f64 / self.refresh_rate;
        let mut last_tick = ctx.now();

        loop {
            if let Some(exit) = ctx.interruption() {
                return exit;
            }

            match self.waiter.wait_for_vblank(MAX_WAIT_SLICE) {
                Ok(true) => {}
                Ok(false) => {
                    if time.ticks_to_duration(ctx.now() - last_tick) >= event_timeout {
                        tracing::warn!("[WaitBackend] {} stopped returning", self.waiter.name());
                        return BackendExit::DeviceLost;
                    }
                    continue;
                }
                Err(e) => return BackendExit::Failed(e),
            }

            let now = ctx.now();
            let n = ticks_in_gap(now - last_tick, interval);
            last_tick = now;
            ctx.vblank(u32::try_from(n).unwrap_or(u32::MAX), now);

            if let Some(measured) = monitor.on_ticks(now, n) {
                let measured = estimator.normalize(measured);
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
            self.waiter.close();
            self.opened = false;
        }
    }

    fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }
}
