// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank backend that polls the scanline position of the display.
//!
//! A vblank is detected when the beam enters the blanking region, or when the
//! line number wraps without blanking having been observed. Between ticks the
//! thread sleeps through [`AdaptiveSleep`] so polling stays cheap.

use crate::core::{
    AdaptiveSleep, BackendExit, RateMonitor, RefreshRateEstimator, Result, RunContext, Ticks,
    VblankBackend,
};
use std::thread;
use std::time::{Duration, Instant};

/// Where the display beam is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPosition {
    pub line: u32,
    pub in_vblank: bool,
}

/// Source of raster (scanline) positions.
pub trait ScanlineSource: Send {
    fn name(&self) -> &str;

    /// Fails with [`crate::core::ClockError::Unsupported`] when the platform
    /// can't report scanlines.
    fn open(&mut self, ctx: &RunContext) -> Result<()>;

    fn scan_position(&mut self) -> Result<ScanPosition>;

    fn close(&mut self);
}

/// Whether a vblank happened between two consecutive polls.
pub fn crossed_vblank(previous: ScanPosition, current: ScanPosition) -> bool {
    if current.in_vblank {
        !previous.in_vblank
    } else {
        !previous.in_vblank && current.line < previous.line
    }
}

pub struct RasterPollBackend<S: ScanlineSource> {
    source: S,
    pacing: AdaptiveSleep,
    refresh_rate: f64,
    opened: bool,
    name: String,
}

impl<S: ScanlineSource> RasterPollBackend<S> {
    pub fn new(source: S) -> Self {
        let name = format!("raster:{}", source.name());
        Self {
            source,
            pacing: AdaptiveSleep::default(),
            refresh_rate: 0.0,
            opened: false,
            name,
        }
    }

    /// Poll until a vblank is crossed or `timeout` passes.
    fn poll_for_tick(&mut self, previous: &mut ScanPosition, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.source.scan_position()?;
            let ticked = crossed_vblank(*previous, current);
            *previous = current;
            if ticked {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(self.pacing.poll_interval());
        }
    }
}

impl<S: ScanlineSource> VblankBackend for RasterPollBackend<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, ctx: &RunContext) -> Result<()> {
        self.pacing = AdaptiveSleep::from_config(ctx.config());
        self.source.open(ctx)?;
        self.opened = true;

        let config = ctx.config();
        let estimator = RefreshRateEstimator::from_config(config);
        let mut previous = self.source.scan_position()?;
        let rate = estimator.measure(
            ctx.clock().time_source().as_ref(),
            config.measurement_windows,
            config.measurement_window(),
            |timeout| Ok(u64::from(self.poll_for_tick(&mut previous, timeout)?)),
        )?;
        self.refresh_rate = rate;

        tracing::info!(
            "[RasterPollBackend] {} measured {:.3} Hz",
            self.source.name(),
            self.refresh_rate
        );
        Ok(())
    }

    fn run(&mut self, ctx: &RunContext) -> BackendExit {
        let time = ctx.clock().time_source().clone();
        let estimator = RefreshRateEstimator::from_config(ctx.config());
        let mut monitor = RateMonitor::new(ctx.config().rate_recheck_interval(), time.as_ref());
        let event_timeout = time.duration_to_ticks(ctx.config().event_timeout());
        let period = Duration::from_secs_f64(1.0 / self.refresh_rate);
        let interval = time.frequency() as f64 / self.refresh_rate;

        let mut previous = match self.source.scan_position() {
            Ok(position) => position,
            Err(e) => return BackendExit::Failed(e),
        };
        let mut last_tick: Ticks = ctx.now();

        loop {
            if let Some(exit) = ctx.interruption() {
                return exit;
            }

            let current = match self.source.scan_position() {
                Ok(position) => position,
                Err(e) => return BackendExit::Failed(e),
            };
            let now = ctx.now();

            if crossed_vblank(previous, current) {
                previous = current;
                // A slow poll may have slept through whole frames.
                let n = ((now - last_tick) as f64 / interval).round().max(1.0) as u64;
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

                thread::sleep(self.pacing.after_tick(period));
                continue;
            }
            previous = current;

            let since_tick = now - last_tick;
            if since_tick > event_timeout {
                tracing::warn!(
                    "[RasterPollBackend] {} scanline stalled",
                    self.source.name()
                );
                return BackendExit::DeviceLost;
            }
            thread::sleep(
                self.pacing
                    .between_polls(time.ticks_to_duration(since_tick), period),
            );
        }
    }

    fn cleanup(&mut self) {
        if self.opened {
            self.source.close();
            self.opened = false;
        }
    }

    fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }
}
