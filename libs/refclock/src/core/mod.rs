// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod backend;
pub mod backends;
pub mod clock;
pub mod config;
pub mod display_events;
pub mod error;
pub mod lifecycle;
pub mod pacing;
pub mod rate_estimator;
pub mod time_source;

pub use backend::{BackendExit, CleanupGuard, RunContext, VblankBackend};
pub use backends::select_backend;
pub use clock::{
    ClockDiagnostics, CondvarTickBroadcaster, PlaybackClock, ReferenceClock, RefreshInfo,
    TickBroadcaster,
};
pub use config::{BackendPreference, ClockConfig};
pub use display_events::{DisplayEvent, DisplayEventBus, DisplayEventListener, ListenerId};
pub use error::{ClockError, Result};
pub use lifecycle::{BackendFactory, ClockController, LifecycleState};
pub use pacing::AdaptiveSleep;
pub use rate_estimator::{RateMonitor, RefreshRateEstimator};
pub use time_source::{ManualTimeSource, MonotonicTimeSource, Ticks, TimeSource};
