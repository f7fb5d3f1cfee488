// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("Vblank backend not supported: {0}")]
    Unsupported(String),

    #[error("Refresh rate measurement inconclusive: {0}")]
    MeasurementInconclusive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vblank backend error: {0}")]
    Backend(String),

    #[error("Vblank counter reset: previous {previous}, now {current}")]
    CounterReset { previous: u64, current: u64 },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClockError {
    /// Errors that mean "this machine can't do hardware vblank right now".
    ///
    /// The controller falls back to the system clock and waits for a display
    /// event before probing again.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            ClockError::Unsupported(_) | ClockError::MeasurementInconclusive(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClockError>;
