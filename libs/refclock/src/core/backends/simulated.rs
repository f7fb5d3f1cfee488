// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Software display that "refreshes" on the wall clock.
//!
//! Used on machines without a usable vblank source and by tests. One
//! [`SimulatedDisplay`] can feed all three backend kinds: a counter, a
//! scanline and a blocking wait. It can also change rate, freeze and reset its
//! counter, which is how mode switches and driver resets are reproduced.

use super::counter::VsyncCounter;
use super::raster::{ScanPosition, ScanlineSource};
use super::wait::VblankWaiter;
use crate::core::{ClockError, Result, RunContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MIN_SLEEP: Duration = Duration::from_micros(50);

#[derive(Debug)]
struct Timing {
    epoch: Instant,
    period: Duration,
    rate: f64,
    base: u64,
    paused: bool,
}

impl Timing {
    fn frames_since_epoch(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_secs_f64() / self.period.as_secs_f64()).floor() as u64
    }

    fn counter(&self, now: Instant) -> u64 {
        if self.paused {
            self.base
        } else {
            self.base + self.frames_since_epoch(now)
        }
    }
}

/// A display refreshing at a fixed rate on the wall clock.
#[derive(Debug)]
pub struct SimulatedDisplay {
    timing: Mutex<Timing>,
}

impl SimulatedDisplay {
    pub fn new(refresh_rate: f64) -> Result<Arc<Self>> {
        let period = period_for(refresh_rate)?;
        Ok(Arc::new(Self {
            timing: Mutex::new(Timing {
                epoch: Instant::now(),
                period,
                rate: refresh_rate,
                base: 0,
                paused: false,
            }),
        }))
    }

    pub fn refresh_rate(&self) -> f64 {
        self.timing.lock().rate
    }

    /// Switch modes. The counter keeps counting from where it is.
    pub fn set_refresh_rate(&self, refresh_rate: f64) -> Result<()> {
        let period = period_for(refresh_rate)?;
        let now = Instant::now();
        let mut timing = self.timing.lock();
        timing.base = timing.counter(now);
        timing.epoch = now;
        timing.period = period;
        timing.rate = refresh_rate;
        tracing::debug!("[SimulatedDisplay] Mode switch to {} Hz", refresh_rate);
        Ok(())
    }

    /// Restart the counter at zero, like a driver reset.
    pub fn reset_counter(&self) {
        let mut timing = self.timing.lock();
        timing.base = 0;
        timing.epoch = Instant::now();
        tracing::debug!("[SimulatedDisplay] Counter reset");
    }

    /// Stop (or resume) refreshing, like an unplugged output.
    pub fn set_paused(&self, paused: bool) {
        let now = Instant::now();
        let mut timing = self.timing.lock();
        if paused == timing.paused {
            return;
        }
        if paused {
            timing.base = timing.counter(now);
        } else {
            timing.epoch = now;
        }
        timing.paused = paused;
    }

    /// Vblanks since creation (or the last counter reset).
    pub fn counter(&self) -> u64 {
        self.timing.lock().counter(Instant::now())
    }

    /// When the counter next advances. `None` while paused.
    pub fn next_vblank(&self) -> Option<Instant> {
        let timing = self.timing.lock();
        if timing.paused {
            return None;
        }
        let frames = timing.frames_since_epoch(Instant::now()) + 1;
        Some(timing.epoch + timing.period.mul_f64(frames as f64))
    }

    /// Beam position for a raster of `total_lines` lines, the last
    /// `total_lines - active_lines` of which are blanking.
    pub fn scan_position(&self, total_lines: u32, active_lines: u32) -> ScanPosition {
        let timing = self.timing.lock();
        if timing.paused {
            return ScanPosition {
                line: 0,
                in_vblank: false,
            };
        }
        let elapsed = Instant::now().saturating_duration_since(timing.epoch);
        let phase = (elapsed.as_secs_f64() / timing.period.as_secs_f64()).fract();
        let line = ((phase * f64::from(total_lines)) as u32).min(total_lines.saturating_sub(1));
        ScanPosition {
            line,
            in_vblank: line >= active_lines,
        }
    }

    /// Block until the counter differs from `last` or `timeout` passes.
    fn wait_for_change(&self, last: u64, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.counter();
            if current != last {
                return Some(current);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake = self.next_vblank().map_or(deadline, |next| next.min(deadline));
            thread::sleep(wake.saturating_duration_since(now).max(MIN_SLEEP));
        }
    }
}

fn period_for(refresh_rate: f64) -> Result<Duration> {
    if !(refresh_rate.is_finite() && refresh_rate > 0.0) {
        return Err(ClockError::Configuration(format!(
            "simulated refresh rate must be positive, got {}",
            refresh_rate
        )));
    }
    Ok(Duration::from_secs_f64(1.0 / refresh_rate))
}

/// [`VsyncCounter`] over a [`SimulatedDisplay`].
pub struct SimulatedCounter {
    display: Arc<SimulatedDisplay>,
    last: Option<u64>,
}

impl SimulatedCounter {
    pub fn new(display: Arc<SimulatedDisplay>) -> Self {
        Self {
            display,
            last: None,
        }
    }
}

impl VsyncCounter for SimulatedCounter {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        self.last = None;
        Ok(())
    }

    fn wait_for_vblank(&mut self, timeout: Duration) -> Result<Option<u64>> {
        // The first wait aligns to the next edge instead of returning at once.
        let last = *self.last.get_or_insert_with(|| self.display.counter());
        let next = self.display.wait_for_change(last, timeout);
        if next.is_some() {
            self.last = next;
        }
        Ok(next)
    }

    fn close(&mut self) {
        self.last = None;
    }
}

/// [`ScanlineSource`] over a [`SimulatedDisplay`], 1125 lines with 1080 visible.
pub struct SimulatedScanline {
    display: Arc<SimulatedDisplay>,
    total_lines: u32,
    active_lines: u32,
}

impl SimulatedScanline {
    pub fn new(display: Arc<SimulatedDisplay>) -> Self {
        Self::with_geometry(display, 1125, 1080)
    }

    pub fn with_geometry(display: Arc<SimulatedDisplay>, total_lines: u32, active_lines: u32) -> Self {
        Self {
            display,
            total_lines,
            active_lines,
        }
    }
}

impl ScanlineSource for SimulatedScanline {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        if self.active_lines >= self.total_lines {
            return Err(ClockError::Unsupported(
                "raster geometry has no blanking region".into(),
            ));
        }
        Ok(())
    }

    fn scan_position(&mut self) -> Result<ScanPosition> {
        Ok(self
            .display
            .scan_position(self.total_lines, self.active_lines))
    }

    fn close(&mut self) {}
}

/// [`VblankWaiter`] over a [`SimulatedDisplay`].
pub struct SimulatedWaiter {
    display: Arc<SimulatedDisplay>,
    last: Option<u64>,
}

impl SimulatedWaiter {
    pub fn new(display: Arc<SimulatedDisplay>) -> Self {
        Self {
            display,
            last: None,
        }
    }
}

impl VblankWaiter for SimulatedWaiter {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self, _ctx: &RunContext) -> Result<()> {
        self.last = None;
        Ok(())
    }

    fn wait_for_vblank(&mut self, timeout: Duration) -> Result<bool> {
        let last = *self.last.get_or_insert_with(|| self.display.counter());
        match self.display.wait_for_change(last, timeout) {
            Some(current) => {
                self.last = Some(current);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn close(&mut self) {
        self.last = None;
    }
}
