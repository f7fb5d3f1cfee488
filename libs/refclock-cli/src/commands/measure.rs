// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use refclock::core::{CleanupGuard, RunContext};
use refclock::{ClockConfig, ReferenceClock, select_backend};

/// Build the configured backend, measure its refresh rate once, release it.
pub fn run(config: ClockConfig) -> Result<()> {
    let backend = select_backend(&config)
        .with_context(|| format!("No usable {} backend", config.backend.as_str()))?;
    let mut backend = CleanupGuard::new(backend);

    let ctx = RunContext::new(
        Arc::new(ReferenceClock::new()),
        Arc::new(config),
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicBool::new(false)),
    );

    println!("Measuring {}...", backend.name());
    let start = Instant::now();
    backend
        .setup(&ctx)
        .with_context(|| format!("Measurement on {} failed", backend.name()))?;

    println!(
        "{}: {:.3} Hz (took {:?})",
        backend.name(),
        backend.refresh_rate(),
        start.elapsed()
    );
    Ok(())
}
