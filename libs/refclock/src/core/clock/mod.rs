// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Clock core and consumer API.

mod reference_clock;
mod state;
mod tick_broadcaster;

pub use reference_clock::{ClockDiagnostics, ReferenceClock, RefreshInfo};
pub use state::ClockState;
pub use tick_broadcaster::{CondvarTickBroadcaster, TickBroadcaster};

use super::Ticks;
use std::time::Duration;

/// Passive clock interface for presentation pacing.
///
/// Clocks provide a time reference that the playback pipeline queries; they
/// never call into the pipeline.
///
/// ## Implementations
///
/// - `ReferenceClock`: vblank-synchronized, falls back to the system clock
///
/// ## Usage in Sinks
///
/// ```rust,ignore
/// fn render(&mut self, frame: VideoFrame) {
///     // Wait until presentation time
///     let now = self.clock.now();
///     if now < frame.pts {
///         self.reference.wait(frame.pts);
///     }
///
///     self.display.present(frame);
/// }
/// ```
pub trait PlaybackClock: Send + Sync {
    /// Current time in clock ticks (monotonic).
    ///
    /// Safe to call from any thread concurrently.
    fn now(&self) -> Ticks;

    /// Ticks per second.
    fn frequency(&self) -> i64;

    /// Current time as Duration (convenience)
    fn now_duration(&self) -> Duration {
        let now = self.now();
        if now <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(now as f64 / self.frequency() as f64)
    }

    /// Rate the clock is driven at, if hardware-driven (e.g. 60.0 for a 60 Hz display).
    fn rate_hz(&self) -> Option<f64> {
        None
    }

    /// Used for debugging and logging.
    fn description(&self) -> &str;
}
