// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use refclock::{ClockConfig, ClockController, ReferenceClock};

use crate::OutputFormat;

/// One periodic sample of the running clock.
#[derive(Debug, Serialize)]
struct ProbeReport {
    elapsed_ms: u128,
    state: String,
    clock_ms: f64,
    drift_ms: f64,
    refresh_rate: Option<f64>,
    speed_percent: f64,
    total_missed_vblanks: u32,
}

/// Run the clock for `seconds` and print a report every `interval_ms`.
pub fn run(config: ClockConfig, seconds: u64, interval_ms: u64, format: OutputFormat) -> Result<()> {
    let clock = Arc::new(ReferenceClock::with_parts(
        Arc::new(refclock::MonotonicTimeSource::new()),
        Arc::new(refclock::core::CondvarTickBroadcaster::new()),
        &config,
    ));
    let backend = config.backend;
    let controller = ClockController::start(Arc::clone(&clock), config)
        .context("Failed to start the clock controller")?;

    if format == OutputFormat::Pretty {
        println!("Probing {} backend for {}s", backend.as_str(), seconds);
        println!();
    }

    let start = Instant::now();
    let start_clock = clock.get_time(true);
    let to_ms = |ticks: i64| ticks as f64 * 1000.0 / clock.frequency() as f64;
    let interval = Duration::from_millis(interval_ms.max(1));
    let deadline = start + Duration::from_secs(seconds);

    while Instant::now() < deadline {
        thread::sleep(interval);

        let elapsed = start.elapsed();
        let clock_ms = to_ms(clock.get_time(true) - start_clock);
        let diagnostics = clock.diagnostics();
        let report = ProbeReport {
            elapsed_ms: elapsed.as_millis(),
            state: controller.state().to_string(),
            clock_ms,
            drift_ms: clock_ms - elapsed.as_secs_f64() * 1000.0,
            refresh_rate: diagnostics.refresh_rate,
            speed_percent: diagnostics.speed_percent,
            total_missed_vblanks: diagnostics.total_missed_vblanks,
        };
        print_report(&report, format)?;
    }

    controller.stop().context("Failed to stop the clock controller")?;
    Ok(())
}

fn print_report(report: &ProbeReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(report)?),
        OutputFormat::Pretty => {
            let rate = report
                .refresh_rate
                .map_or_else(|| "system clock".to_string(), |r| format!("{:.3} Hz", r));
            println!(
                "{:>7} ms  {:<40} clock {:>10.3} ms  drift {:>+8.3} ms  {:<12}  speed {:>6.2}%  missed {}",
                report.elapsed_ms,
                report.state,
                report.clock_ms,
                report.drift_ms,
                rate,
                report.speed_percent,
                report.total_missed_vblanks
            );
        }
    }
    Ok(())
}
