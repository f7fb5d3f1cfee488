// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank backend contract.
//!
//! A backend turns one platform's vertical-blank signal into calls to
//! [`ReferenceClock::vblank`]. The controller drives every backend the same way:
//!
//! ```text
//! setup() ──ok──▶ run() ──▶ cleanup()
//!    │                         ▲
//!    └──────────err────────────┘
//! ```
//!
//! `cleanup()` runs on every path, including unwinding, via [`CleanupGuard`].

use super::{ClockConfig, ClockError, ReferenceClock, Result, Ticks};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why [`VblankBackend::run`] returned.
#[derive(Debug)]
pub enum BackendExit {
    /// The controller asked the backend to stop.
    Stopped,
    /// The periodic re-check measured a different refresh rate.
    RateChanged { from: f64, to: f64 },
    /// A display event (mode switch, device reset) arrived.
    DisplayReset,
    /// The device went away or fell silent.
    DeviceLost,
    /// The hardware vblank counter went backwards.
    CounterReset,
    /// A platform call failed.
    Failed(ClockError),
}

impl fmt::Display for BackendExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendExit::Stopped => write!(f, "stopped"),
            BackendExit::RateChanged { from, to } => {
                write!(f, "refresh rate changed from {:.3} Hz to {:.3} Hz", from, to)
            }
            BackendExit::DisplayReset => write!(f, "display reset"),
            BackendExit::DeviceLost => write!(f, "device lost"),
            BackendExit::CounterReset => write!(f, "vblank counter reset"),
            BackendExit::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Everything a running backend may touch.
pub struct RunContext {
    clock: Arc<ReferenceClock>,
    config: Arc<ClockConfig>,
    stop: Arc<AtomicBool>,
    display_changed: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(
        clock: Arc<ReferenceClock>,
        config: Arc<ClockConfig>,
        stop: Arc<AtomicBool>,
        display_changed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            clock,
            config,
            stop,
            display_changed,
        }
    }

    pub fn clock(&self) -> &Arc<ReferenceClock> {
        &self.clock
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Current system-clock time.
    pub fn now(&self) -> Ticks {
        self.clock.time_source().now()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn display_changed(&self) -> bool {
        self.display_changed.load(Ordering::Acquire)
    }

    /// The exit a backend loop should take right now, if any.
    pub fn interruption(&self) -> Option<BackendExit> {
        if self.stop_requested() {
            Some(BackendExit::Stopped)
        } else if self.display_changed() {
            Some(BackendExit::DisplayReset)
        } else {
            None
        }
    }

    /// Report `nr_ticks` vblanks, the last one at `timestamp`.
    pub fn vblank(&self, nr_ticks: u32, timestamp: Ticks) {
        self.clock.vblank(nr_ticks, timestamp);
    }
}

/// One platform mechanism for detecting vertical blanks.
pub trait VblankBackend: Send {
    /// Used for logging.
    fn name(&self) -> &str;

    /// Acquire platform resources and measure the refresh rate.
    ///
    /// Fails with [`ClockError::Unsupported`] or
    /// [`ClockError::MeasurementInconclusive`] when hardware vblank can't be
    /// used on this machine right now.
    fn setup(&mut self, ctx: &RunContext) -> Result<()>;

    /// Report vblanks until stopped or until the backend can't continue.
    fn run(&mut self, ctx: &RunContext) -> BackendExit;

    /// Release everything `setup` acquired. Must tolerate a failed or skipped setup.
    fn cleanup(&mut self);

    /// Vblanks per second measured by `setup`.
    fn refresh_rate(&self) -> f64;
}

/// Owns a backend and calls [`VblankBackend::cleanup`] when dropped.
pub struct CleanupGuard {
    backend: Box<dyn VblankBackend>,
}

impl CleanupGuard {
    pub fn new(backend: Box<dyn VblankBackend>) -> Self {
        Self { backend }
    }
}

impl Deref for CleanupGuard {
    type Target = dyn VblankBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl DerefMut for CleanupGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        tracing::debug!("[CleanupGuard] Cleaning up {}", self.backend.name());
        self.backend.cleanup();
    }
}
