// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vblank backend implementations and platform selection.
//!
//! | Backend              | Signal                          | Platform  |
//! |----------------------|---------------------------------|-----------|
//! | `DisplayLinkBackend` | CVDisplayLink callback          | macOS     |
//! | `CounterBackend`     | DRM vblank event counter        | Linux     |
//! | `CounterBackend`     | simulated counter               | any       |
//! | `RasterPollBackend`  | simulated scanline              | any       |
//! | `WaitBackend`        | simulated blocking wait         | any       |

pub mod counter;
pub mod raster;
pub mod simulated;
pub mod wait;

pub use counter::{CounterBackend, VsyncCounter};
pub use raster::{crossed_vblank, RasterPollBackend, ScanPosition, ScanlineSource};
pub use simulated::{SimulatedCounter, SimulatedDisplay, SimulatedScanline, SimulatedWaiter};
pub use wait::{VblankWaiter, WaitBackend};

use crate::core::{BackendPreference, ClockConfig, ClockError, Result, VblankBackend};

/// Build the backend `config.backend` asks for.
///
/// `Auto` picks the platform's hardware source. Fails with
/// [`ClockError::Unsupported`] when nothing usable exists; the caller then
/// stays on the system clock.
pub fn select_backend(config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    match config.backend {
        BackendPreference::Auto => probe_platform(config),
        BackendPreference::DisplayLink => display_link(config),
        BackendPreference::Drm => drm(config),
        BackendPreference::SimulatedCounter => {
            let display = SimulatedDisplay::new(config.simulated_refresh_rate)?;
            Ok(Box::new(CounterBackend::new(SimulatedCounter::new(display))))
        }
        BackendPreference::SimulatedRaster => {
            let display = SimulatedDisplay::new(config.simulated_refresh_rate)?;
            Ok(Box::new(RasterPollBackend::new(SimulatedScanline::new(
                display,
            ))))
        }
        BackendPreference::SimulatedWait => {
            let display = SimulatedDisplay::new(config.simulated_refresh_rate)?;
            Ok(Box::new(WaitBackend::new(SimulatedWaiter::new(display))))
        }
        BackendPreference::System => Err(ClockError::Unsupported(
            "system clock selected by configuration".into(),
        )),
    }
}

#[cfg(target_os = "macos")]
fn probe_platform(config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    display_link(config)
}

#[cfg(target_os = "linux")]
fn probe_platform(config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    if !config.drm_device.exists() {
        return Err(ClockError::Unsupported(format!(
            "no DRM device at {}",
            config.drm_device.display()
        )));
    }
    drm(config)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn probe_platform(_config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    Err(ClockError::Unsupported(
        "no vblank source on this platform".into(),
    ))
}

#[cfg(target_os = "macos")]
fn display_link(_config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    Ok(Box::new(crate::apple::DisplayLinkBackend::new()))
}

#[cfg(not(target_os = "macos"))]
fn display_link(_config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    Err(ClockError::Unsupported("CVDisplayLink requires macOS".into()))
}

#[cfg(target_os = "linux")]
fn drm(config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    Ok(Box::new(CounterBackend::new(
        crate::linux::DrmVblankCounter::new(config.drm_device.clone()),
    )))
}

#[cfg(not(target_os = "linux"))]
fn drm(_config: &ClockConfig) -> Result<Box<dyn VblankBackend>> {
    Err(ClockError::Unsupported("DRM vblank requires Linux".into()))
}
