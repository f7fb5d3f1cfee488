// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank-synchronized reference clock.
//!
//! Provides a monotonically advancing time source for audio/video presentation
//! that follows the display's vertical blank instead of the free-running system
//! clock, so frames are paced to the display's true refresh cadence.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use refclock::{ClockConfig, ClockController, ReferenceClock};
//!
//! let clock = Arc::new(ReferenceClock::new());
//! let controller = ClockController::start(Arc::clone(&clock), ClockConfig::default())?;
//!
//! let target = clock.get_time(false) + clock.frequency() / 2;
//! let woke_at = clock.wait(target);
//!
//! controller.stop();
//! ```

pub mod core;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod apple;

pub use crate::core::{
    BackendExit, BackendPreference, ClockConfig, ClockController, ClockDiagnostics, ClockError,
    DisplayEvent, DisplayEventBus, DisplayEventListener, LifecycleState, ManualTimeSource,
    MonotonicTimeSource, PlaybackClock, ReferenceClock, RefreshInfo, RefreshRateEstimator, Result,
    Ticks, TimeSource, VblankBackend, select_backend,
};
