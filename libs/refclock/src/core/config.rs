// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Reference clock configuration.
//!
//! Every tolerance the clock relies on lives here as a named, overridable
//! value. The defaults are empirically tuned and should be changed only with
//! measurements in hand.

use super::{ClockError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which vblank backend the controller should run.
///
/// ## Usage
///
/// ```toml
/// backend = "auto"               # probe the platform
/// backend = "drm"                # force the Linux kernel vblank event
/// backend = "simulated-counter"  # software vblank at simulated_refresh_rate
/// backend = "system"             # never use vblank; plain system clock
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// Probe the platform: CVDisplayLink on macOS, DRM vblank events on Linux.
    #[default]
    Auto,
    /// CVDisplayLink callback (macOS).
    DisplayLink,
    /// DRM vblank event fd (Linux).
    Drm,
    /// Software counter ticking at `simulated_refresh_rate`.
    SimulatedCounter,
    /// Software scanline polled at `simulated_refresh_rate`.
    SimulatedRaster,
    /// Software blocking vblank wait at `simulated_refresh_rate`.
    SimulatedWait,
    /// No hardware clock; the system clock stays authoritative.
    System,
}

impl BackendPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendPreference::Auto => "auto",
            BackendPreference::DisplayLink => "display-link",
            BackendPreference::Drm => "drm",
            BackendPreference::SimulatedCounter => "simulated-counter",
            BackendPreference::SimulatedRaster => "simulated-raster",
            BackendPreference::SimulatedWait => "simulated-wait",
            BackendPreference::System => "system",
        }
    }
}

impl std::str::FromStr for BackendPreference {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(BackendPreference::Auto),
            "display-link" => Ok(BackendPreference::DisplayLink),
            "drm" => Ok(BackendPreference::Drm),
            "simulated-counter" => Ok(BackendPreference::SimulatedCounter),
            "simulated-raster" => Ok(BackendPreference::SimulatedRaster),
            "simulated-wait" => Ok(BackendPreference::SimulatedWait),
            "system" => Ok(BackendPreference::System),
            other => Err(ClockError::Configuration(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the reference clock and its backend loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Backend selection.
    pub backend: BackendPreference,

    /// Refresh rate of the simulated backends in Hz.
    pub simulated_refresh_rate: f64,

    /// DRM device node used by the kernel vblank backend.
    pub drm_device: PathBuf,

    /// Interlaced output: every field is a tick, doubling the effective rate.
    pub interlaced: bool,

    /// Number of timed windows in a forced refresh-rate estimation.
    pub measurement_windows: usize,

    /// Length of one measurement window in milliseconds.
    pub measurement_window_ms: u64,

    /// Minimum spacing between refresh-rate re-checks while running.
    pub rate_recheck_interval_ms: u64,

    /// Rounded rates that are really 1000/1001 content rates and get bumped by one
    /// (23 -> 24, 29 -> 30, 59 -> 60).
    pub rate_round_up: Vec<u32>,

    /// A tick is overdue once `missed_vblank_slack` intervals have passed
    /// since the last one.
    pub missed_vblank_slack: f64,

    /// Interpolation never runs further ahead of the last tick than this many
    /// tick periods.
    pub max_interpolation_ticks: f64,

    /// Fraction of a tick period the raster poller sleeps after detecting a tick.
    pub poll_sleep_fraction: f64,

    /// Raster poll spacing while waiting for a tick, in microseconds.
    pub poll_interval_us: u64,

    /// Silence after which an event backend reports the device lost.
    pub event_timeout_ms: u64,

    /// Pause before re-measuring after a reset or failure.
    pub restart_delay_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            simulated_refresh_rate: 60.0,
            drm_device: PathBuf::from("/dev/dri/card0"),
            interlaced: false,
            measurement_windows: 5,
            measurement_window_ms: 100,
            rate_recheck_interval_ms: 1000,
            rate_round_up: vec![23, 29, 59],
            missed_vblank_slack: 1.3,
            max_interpolation_ticks: 2.0,
            poll_sleep_fraction: 0.5,
            poll_interval_us: 1000,
            event_timeout_ms: 1000,
            restart_delay_ms: 100,
        }
    }
}

impl ClockConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ClockConfig = toml::from_str(s)
            .map_err(|e| ClockError::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!("[ClockConfig] Loaded {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ClockError::Configuration(format!("failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ClockError::Configuration(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )))
            }
        }

        positive("simulated_refresh_rate", self.simulated_refresh_rate)?;
        positive("missed_vblank_slack", self.missed_vblank_slack)?;
        positive("max_interpolation_ticks", self.max_interpolation_ticks)?;
        positive("poll_sleep_fraction", self.poll_sleep_fraction)?;

        if self.missed_vblank_slack < 1.0 {
            return Err(ClockError::Configuration(format!(
                "missed_vblank_slack must be at least 1.0, got {}",
                self.missed_vblank_slack
            )));
        }
        if self.poll_sleep_fraction >= 1.0 {
            return Err(ClockError::Configuration(format!(
                "poll_sleep_fraction must be below 1.0, got {}",
                self.poll_sleep_fraction
            )));
        }
        if self.measurement_windows == 0 || self.measurement_window_ms == 0 {
            return Err(ClockError::Configuration(
                "measurement needs at least one non-empty window".into(),
            ));
        }
        if self.event_timeout_ms == 0 {
            return Err(ClockError::Configuration(
                "event_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn measurement_window(&self) -> Duration {
        Duration::from_millis(self.measurement_window_ms)
    }

    pub fn rate_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.rate_recheck_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
