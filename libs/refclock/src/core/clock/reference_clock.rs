// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank-driven reference clock.
//!
//! ## How It Works
//!
//! 1. A backend thread reports every vblank through [`ReferenceClock::vblank`]
//! 2. Each vblank advances the virtual clock by `speed * fine_adjust / rate`
//!    seconds, with the sub-tick remainder carried so long runs don't drift
//! 3. Consumers read the clock with [`ReferenceClock::get_time`] or block on
//!    [`ReferenceClock::wait`]; both infer vblanks the backend is late with
//! 4. Without a running backend the clock is the system clock plus an offset
//!    that keeps virtual time continuous
//!
//! ## Usage
//!
//! ```rust,ignore
//! let clock = Arc::new(ReferenceClock::new());
//!
//! // In the backend thread:
//! clock.vblank(1, clock.time_source().now());
//!
//! // In the playback pipeline:
//! let now = clock.get_time(true);
//! clock.wait(frame_pts);
//!
//! // In the windowing layer, after a mode switch:
//! clock.refresh_changed();
//! ```

use super::state::ClockState;
use super::tick_broadcaster::{CondvarTickBroadcaster, TickBroadcaster};
use super::PlaybackClock;
use crate::core::{
    ClockConfig, ClockError, DisplayEvent, DisplayEventBus, MonotonicTimeSource, Result, Ticks,
    TimeSource,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shortest sleep `wait` takes between re-evaluations.
const MIN_WAIT: Duration = Duration::from_micros(100);

/// Refresh rate of the running backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshInfo {
    /// Measured vblanks per second.
    pub rate: f64,
    /// Effective seconds of presentation time per vblank (`speed / rate`).
    pub interval: f64,
}

/// Read-only snapshot for on-screen diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockDiagnostics {
    pub total_missed_vblanks: u32,
    /// `speed * fine_adjust` as a percentage.
    pub speed_percent: f64,
    /// `None` while the system clock is authoritative.
    pub refresh_rate: Option<f64>,
}

/// Lock-free copy of the diagnostic fields, refreshed on every state change.
#[derive(Default)]
struct DiagnosticsMirror {
    total_missed_vblanks: AtomicU32,
    speed_bits: AtomicU64,
    refresh_rate_bits: AtomicU64,
    use_vblank: AtomicBool,
}

impl DiagnosticsMirror {
    fn publish(&self, state: &ClockState) {
        self.total_missed_vblanks
            .store(state.total_missed_vblanks, Ordering::Relaxed);
        self.speed_bits
            .store((state.speed * state.fine_adjust).to_bits(), Ordering::Relaxed);
        self.refresh_rate_bits
            .store(state.refresh_rate.to_bits(), Ordering::Relaxed);
        self.use_vblank.store(state.use_vblank, Ordering::Release);
    }

    fn snapshot(&self) -> ClockDiagnostics {
        let use_vblank = self.use_vblank.load(Ordering::Acquire);
        ClockDiagnostics {
            total_missed_vblanks: self.total_missed_vblanks.load(Ordering::Relaxed),
            speed_percent: f64::from_bits(self.speed_bits.load(Ordering::Relaxed)) * 100.0,
            refresh_rate: use_vblank
                .then(|| f64::from_bits(self.refresh_rate_bits.load(Ordering::Relaxed))),
        }
    }
}

/// Hardware-synchronized playback clock.
///
/// One instance per process, shared as `Arc<ReferenceClock>` between the
/// backend thread driving it and the playback pipeline reading it.
///
/// # Thread Safety
///
/// All state lives behind one mutex that is never held across a sleep.
pub struct ReferenceClock {
    state: Mutex<ClockState>,
    time: Arc<dyn TimeSource>,
    ticks: Arc<dyn TickBroadcaster>,
    diagnostics: DiagnosticsMirror,
    display_events: Arc<DisplayEventBus>,
    missed_vblank_slack: f64,
    max_interpolation_ticks: f64,
    description: String,
}

impl ReferenceClock {
    /// Clock on the process's monotonic system clock with default tuning.
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(MonotonicTimeSource::new()))
    }

    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        Self::with_parts(
            time,
            Arc::new(CondvarTickBroadcaster::new()),
            &ClockConfig::default(),
        )
    }

    /// Virtual time starts at zero at construction.
    pub fn with_parts(
        time: Arc<dyn TimeSource>,
        ticks: Arc<dyn TickBroadcaster>,
        config: &ClockConfig,
    ) -> Self {
        let state = ClockState::new(-time.now());
        let diagnostics = DiagnosticsMirror::default();
        diagnostics.publish(&state);

        Self {
            state: Mutex::new(state),
            time,
            ticks,
            diagnostics,
            display_events: Arc::new(DisplayEventBus::new()),
            missed_vblank_slack: config.missed_vblank_slack,
            max_interpolation_ticks: config.max_interpolation_ticks,
            description: "Vblank Reference Clock".to_string(),
        }
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    /// Ticks per second of the underlying system clock.
    pub fn frequency(&self) -> i64 {
        self.time.frequency()
    }

    /// Display events for this clock. A running controller listens here.
    pub fn display_events(&self) -> &Arc<DisplayEventBus> {
        &self.display_events
    }

    /// The display mode changed; the running backend is torn down and the
    /// refresh rate measured again.
    pub fn refresh_changed(&self) {
        self.display_events.publish(DisplayEvent::ModeChanged);
    }

    /// Whether a vblank backend currently drives the clock.
    pub fn is_vblank_active(&self) -> bool {
        self.state.lock().use_vblank
    }

    /// Copy of the internal state.
    pub fn state_snapshot(&self) -> ClockState {
        self.state.lock().clone()
    }

    /// Current clock value.
    ///
    /// While a backend runs, overdue vblanks are inferred first. With
    /// `interpolate` the value is extrapolated from the last vblank (at most
    /// `max_interpolation_ticks` periods ahead); without it the discrete
    /// vblank-stepped value is returned. Either way the result never drops
    /// below a value returned earlier. Without a backend the result is exactly
    /// system clock plus offset.
    pub fn get_time(&self, interpolate: bool) -> Ticks {
        let now = self.time.now();
        let frequency = self.frequency();
        let mut state = self.state.lock();

        if !state.use_vblank {
            let value = now + state.clock_offset;
            state.last_returned = state.last_returned.max(value);
            return value;
        }

        let healed = self.infer_overdue(&mut state, now);
        let raw = if interpolate {
            self.interpolate(&state, now, frequency)
        } else {
            state.current_time
        };
        let value = raw.max(state.last_returned);
        state.last_returned = value;
        if healed {
            self.diagnostics.publish(&state);
        }
        value
    }

    /// Block until the clock reaches `target` and return the value seen at wake.
    ///
    /// The state lock is released while sleeping. Each sleep ends at the next
    /// vblank broadcast or when that vblank becomes overdue, whichever comes
    /// first; an overdue vblank is inferred like in [`Self::get_time`].
    pub fn wait(&self, target: Ticks) -> Ticks {
        loop {
            let (seen, timeout) = {
                let now = self.time.now();
                let frequency = self.frequency();
                let mut state = self.state.lock();
                let seen = self.ticks.generation();

                if state.use_vblank {
                    if self.infer_overdue(&mut state, now) {
                        self.diagnostics.publish(&state);
                    }
                    if state.current_time >= target {
                        return state.current_time;
                    }
                    let deadline = state.overdue_deadline(frequency, self.missed_vblank_slack);
                    (seen, deadline - now)
                } else {
                    let current = now + state.clock_offset;
                    if current >= target {
                        return current;
                    }
                    (seen, target - current)
                }
            };

            let timeout = self.time.ticks_to_duration(timeout).max(MIN_WAIT);
            self.ticks.wait(seen, timeout);
        }
    }

    /// Set the playback speed multiplier. Non-finite or non-positive values are ignored.
    pub fn set_speed(&self, speed: f64) {
        if !(speed.is_finite() && speed > 0.0) {
            tracing::warn!("[ReferenceClock] Ignoring invalid speed {}", speed);
            return;
        }
        let mut state = self.state.lock();
        if state.speed != speed {
            tracing::debug!("[ReferenceClock] Speed {} -> {}", state.speed, speed);
        }
        state.speed = speed;
        self.diagnostics.publish(&state);
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    /// Set the secondary correction composed with speed. Same validation as speed.
    pub fn set_fine_adjust(&self, fine_adjust: f64) {
        if !(fine_adjust.is_finite() && fine_adjust > 0.0) {
            tracing::warn!("[ReferenceClock] Ignoring invalid fine adjust {}", fine_adjust);
            return;
        }
        let mut state = self.state.lock();
        state.fine_adjust = fine_adjust;
        self.diagnostics.publish(&state);
    }

    pub fn fine_adjust(&self) -> f64 {
        self.state.lock().fine_adjust
    }

    /// Measured refresh rate, or `None` while the system clock is authoritative.
    pub fn refresh_rate(&self) -> Option<RefreshInfo> {
        let state = self.state.lock();
        if !state.use_vblank {
            return None;
        }
        Some(RefreshInfo {
            rate: state.refresh_rate,
            interval: state.speed / state.refresh_rate,
        })
    }

    /// Never blocks; safe from any thread.
    pub fn diagnostics(&self) -> ClockDiagnostics {
        self.diagnostics.snapshot()
    }

    /// Apply `nr_ticks` vblanks. See [`ClockState::update_clock`].
    pub fn update_clock(&self, nr_ticks: u32, check_missed: bool) {
        let frequency = self.frequency();
        let mut state = self.state.lock();
        state.update_clock(nr_ticks, check_missed, frequency);
        self.diagnostics.publish(&state);
    }

    /// Backend entry point: `nr_ticks` vblanks happened, the last one at `timestamp`.
    pub fn vblank(&self, nr_ticks: u32, timestamp: Ticks) {
        let frequency = self.frequency();
        {
            let mut state = self.state.lock();
            if !state.use_vblank {
                return;
            }
            state.last_vblank_timestamp = timestamp;
            state.update_clock(nr_ticks, true, frequency);
            self.diagnostics.publish(&state);
            tracing::trace!(
                "[ReferenceClock] vblank x{} -> {}",
                nr_ticks,
                state.current_time
            );
        }
        self.ticks.broadcast();
    }

    /// Reset for a fresh controller start: counters cleared, speed back to 1.0,
    /// system clock authoritative, virtual time continuous.
    pub fn reset_for_start(&self) {
        let now = self.time.now();
        let frequency = self.frequency();
        {
            let mut state = self.state.lock();
            let virtual_now = self.virtual_now(&state, now, frequency);
            state.clock_offset = virtual_now - now;
            state.use_vblank = false;
            state.missed_vblanks = 0;
            state.total_missed_vblanks = 0;
            state.speed = 1.0;
            self.diagnostics.publish(&state);
        }
        self.ticks.broadcast();
    }

    /// Hand the clock to a backend running at `refresh_rate`.
    ///
    /// A rate that is not a positive number, or whose vblank period is shorter
    /// than one system-clock tick, is rejected with
    /// [`ClockError::MeasurementInconclusive`] and the system clock stays
    /// authoritative.
    pub fn arm(&self, refresh_rate: f64) -> Result<()> {
        let frequency = self.frequency();
        if !(refresh_rate.is_finite() && refresh_rate > 0.0)
            || (frequency as f64 / refresh_rate).round() < 1.0
        {
            return Err(ClockError::MeasurementInconclusive(format!(
                "refresh rate {} Hz is unusable with a {} Hz system clock",
                refresh_rate, frequency
            )));
        }

        let now = self.time.now();
        {
            let mut state = self.state.lock();
            let virtual_now = (now + state.clock_offset).max(state.last_returned);
            state.current_time = virtual_now;
            state.fractional_remainder = 0.0;
            state.refresh_rate = refresh_rate;
            state.last_vblank_timestamp = now;
            state.missed_vblanks = 0;
            state.use_vblank = true;
            self.diagnostics.publish(&state);
        }
        tracing::info!(
            "[ReferenceClock] Vblank clock active at {:.3} Hz",
            refresh_rate
        );
        self.ticks.broadcast();
        Ok(())
    }

    /// Take the clock back from the backend; system clock plus offset from here on.
    pub fn disarm(&self) {
        let now = self.time.now();
        let frequency = self.frequency();
        {
            let mut state = self.state.lock();
            if !state.use_vblank {
                return;
            }
            let virtual_now = self.virtual_now(&state, now, frequency);
            state.clock_offset = virtual_now - now;
            state.use_vblank = false;
            self.diagnostics.publish(&state);
        }
        tracing::debug!("[ReferenceClock] Falling back to system clock");
        self.ticks.broadcast();
    }

    /// Best estimate of virtual time at `now` without mutating state.
    fn virtual_now(&self, state: &ClockState, now: Ticks, frequency: i64) -> Ticks {
        let value = if state.use_vblank {
            self.interpolate(state, now, frequency)
        } else {
            now + state.clock_offset
        };
        value.max(state.last_returned)
    }

    fn interpolate(&self, state: &ClockState, now: Ticks, frequency: i64) -> Ticks {
        let interval = state.nominal_interval(frequency);
        if interval <= 0.0 {
            return state.current_time;
        }
        let since = (now - state.last_vblank_timestamp).max(0) as f64;
        let progress = (since / interval).min(self.max_interpolation_ticks);
        state.current_time + (progress * state.tick_increment(frequency)) as Ticks
    }

    /// Infer vblanks whose notification is overdue. Returns whether any were.
    fn infer_overdue(&self, state: &mut ClockState, now: Ticks) -> bool {
        let frequency = self.frequency();
        // Each inferred vblank must move the deadline by at least one tick.
        if state.nominal_interval(frequency).round() < 1.0 {
            return false;
        }
        let mut inferred = false;
        while now > state.overdue_deadline(frequency, self.missed_vblank_slack) {
            state.update_clock(1, false, frequency);
            inferred = true;
        }
        inferred
    }
}

impl Default for ReferenceClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for ReferenceClock {
    fn now(&self) -> Ticks {
        self.get_time(true)
    }

    fn frequency(&self) -> i64 {
        ReferenceClock::frequency(self)
    }

    fn rate_hz(&self) -> Option<f64> {
        self.refresh_rate().map(|info| info.rate)
    }

    fn description(&self) -> &str {
        &self.description
    }
}
