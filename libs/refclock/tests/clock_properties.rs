// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Behavioural properties of the reference clock, driven through its public API.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use refclock::{ManualTimeSource, PlaybackClock, ReferenceClock, TimeSource};

fn manual_clock(frequency: i64) -> (Arc<ManualTimeSource>, Arc<ReferenceClock>) {
    let time = Arc::new(ManualTimeSource::new(frequency));
    let clock = Arc::new(ReferenceClock::with_time_source(time.clone()));
    (time, clock)
}

#[test]
fn test_one_vblank_at_60hz_on_microsecond_clock() {
    let (time, clock) = manual_clock(1_000_000);
    clock.arm(60.0).unwrap();

    time.set(16_667);
    clock.vblank(1, 16_667);
    let after_one = clock.get_time(false);
    assert!(after_one == 16_666 || after_one == 16_667, "got {}", after_one);

    for i in 2..=60 {
        let now = i * 1_000_000 / 60;
        time.set(now);
        clock.vblank(1, now);
    }
    assert!((clock.get_time(false) - 1_000_000).abs() <= 1);
}

#[test]
fn test_long_run_does_not_drift() {
    // 10,000 vblanks at 59.94 Hz on a 10 MHz clock.
    let frequency = 10_000_000;
    let rate = 59.94;
    let (time, clock) = manual_clock(frequency);
    clock.arm(rate).unwrap();

    let mut previous = clock.get_time(false);
    for i in 1..=10_000i64 {
        let now = (i as f64 * frequency as f64 / rate).round() as i64;
        time.set(now);
        clock.vblank(1, now);

        let value = clock.get_time(false);
        assert!(value >= previous);
        previous = value;
    }

    let expected = 10_000.0 * frequency as f64 / rate;
    let state = clock.state_snapshot();
    assert!(
        (state.current_time as f64 - expected).abs() <= 1.0,
        "current {} expected {}",
        state.current_time,
        expected
    );
    assert!((0.0..1.0).contains(&state.fractional_remainder));
    assert_eq!(clock.diagnostics().total_missed_vblanks, 0);
}

#[test]
fn test_inferred_vblank_is_not_counted_twice() {
    let (time, clock) = manual_clock(1_000_000);
    clock.arm(50.0).unwrap();

    // 30 ms without a notification: one interval plus slack has passed.
    time.set(30_000);
    assert!(clock.get_time(false) >= 20_000);
    assert_eq!(clock.state_snapshot().missed_vblanks, 1);

    // The backend catches up and reports two vblanks at once.
    time.set(40_000);
    clock.vblank(2, 40_000);

    let state = clock.state_snapshot();
    assert_eq!(state.current_time, 40_000);
    assert_eq!(state.missed_vblanks, 0);
    assert_eq!(clock.diagnostics().total_missed_vblanks, 1);
}

#[test]
fn test_several_inferred_vblanks_match_uninterrupted_run() {
    let (time, clock) = manual_clock(1_000_000);
    clock.arm(50.0).unwrap();

    // Three separate stalls, each noticed by a consumer read.
    for (now, missed) in [(30_000, 1), (50_000, 2), (70_000, 3)] {
        time.set(now);
        clock.get_time(false);
        assert_eq!(clock.state_snapshot().missed_vblanks, missed);
    }

    // The backend reports all four vblanks at once.
    time.set(80_000);
    clock.vblank(4, 80_000);

    let (reference_time, reference) = manual_clock(1_000_000);
    reference.arm(50.0).unwrap();
    for i in 1..=4 {
        reference_time.set(i * 20_000);
        reference.vblank(1, i * 20_000);
    }

    let state = clock.state_snapshot();
    assert_eq!(state.current_time, 80_000);
    assert_eq!(state.current_time, reference.state_snapshot().current_time);
    assert_eq!(state.missed_vblanks, 0);
    assert_eq!(clock.diagnostics().total_missed_vblanks, 3);
    assert_eq!(clock.get_time(false), 80_000);
}

#[test]
fn test_speed_applies_to_following_vblanks() {
    let (time, clock) = manual_clock(1_000_000);
    clock.arm(50.0).unwrap();

    time.set(20_000);
    clock.vblank(1, 20_000);
    clock.set_speed(2.0);
    time.set(40_000);
    clock.vblank(1, 40_000);

    assert_eq!(clock.get_time(false), 60_000);
    let info = clock.refresh_rate().unwrap();
    assert_eq!(info.rate, 50.0);
    assert!((info.interval - 0.04).abs() < 1e-12);
}

#[test]
fn test_fallback_is_exact_and_continuous() {
    let (time, clock) = manual_clock(1_000_000);
    clock.set_speed(2.0);
    clock.arm(50.0).unwrap();

    time.set(20_000);
    clock.vblank(1, 20_000);
    time.set(25_000);
    assert_eq!(clock.get_time(true), 50_000);

    clock.disarm();
    assert!(!clock.is_vblank_active());
    assert_eq!(clock.get_time(false), 50_000);

    // Pure system clock from here on, speed no longer applies.
    time.advance(1_000);
    assert_eq!(clock.get_time(true), 51_000);
    assert_eq!(clock.get_time(false), 51_000);
    assert!(clock.refresh_rate().is_none());
    assert_eq!(clock.diagnostics().refresh_rate, None);
}

#[test]
fn test_rearm_never_goes_backwards() {
    let (time, clock) = manual_clock(1_000_000);
    clock.arm(50.0).unwrap();
    time.set(20_000);
    clock.vblank(1, 20_000);
    time.set(39_000);
    let interpolated = clock.get_time(true);

    clock.disarm();
    clock.arm(60.0).unwrap();
    assert!(clock.get_time(false) >= interpolated);
    assert!(clock.get_time(true) >= interpolated);
}

#[test]
fn test_playback_clock_trait_object() {
    let (time, clock) = manual_clock(1_000);
    let playback: Arc<dyn PlaybackClock> = clock.clone();
    time.set(2_500);

    assert_eq!(playback.now(), 2_500);
    assert_eq!(playback.frequency(), 1_000);
    assert_eq!(playback.now_duration(), Duration::from_millis(2_500));
    assert_eq!(playback.rate_hz(), None);

    clock.arm(60.0).unwrap();
    assert_eq!(playback.rate_hz(), Some(60.0));
}

#[test]
fn test_monotonic_across_threads_with_live_backend() {
    let clock = Arc::new(ReferenceClock::new());
    clock.arm(120.0).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let ticker = {
        let clock = Arc::clone(&clock);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut i = 0u32;
            while !done.load(Ordering::Relaxed) {
                // Irregular cadence, sometimes skipping a vblank.
                thread::sleep(Duration::from_micros(8_333 + u64::from(i % 3) * 3_000));
                let n = if i % 7 == 0 { 2 } else { 1 };
                clock.vblank(n, clock.time_source().now());
                i += 1;
            }
        })
    };

    let speeder = {
        let clock = Arc::clone(&clock);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let speeds = [1.0, 0.5, 2.0, 1.001];
            let mut i = 0;
            while !done.load(Ordering::Relaxed) {
                clock.set_speed(speeds[i % speeds.len()]);
                thread::sleep(Duration::from_millis(7));
                i += 1;
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|r| {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_millis(300);
                let mut previous = i64::MIN;
                let mut reads = 0u64;
                while Instant::now() < deadline {
                    let value = clock.get_time(reads % 2 == 0 || r == 0);
                    assert!(value >= previous, "reader {} went back: {} < {}", r, value, previous);
                    previous = value;
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    done.store(true, Ordering::Relaxed);
    ticker.join().unwrap();
    speeder.join().unwrap();
}

#[test]
fn test_wait_returns_at_or_after_target() {
    let clock = Arc::new(ReferenceClock::new());
    clock.arm(100.0).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let ticker = {
        let clock = Arc::clone(&clock);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
                clock.vblank(1, clock.time_source().now());
            }
        })
    };

    let start = Instant::now();
    let target = clock.get_time(false) + clock.frequency() / 20;
    let woke = clock.wait(target);
    let elapsed = start.elapsed();

    done.store(true, Ordering::Relaxed);
    ticker.join().unwrap();

    assert!(woke >= target);
    assert!(elapsed >= Duration::from_millis(30), "woke after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "woke after {:?}", elapsed);
}

#[test]
fn test_wait_survives_a_silent_backend() {
    let clock = Arc::new(ReferenceClock::new());
    clock.arm(100.0).unwrap();

    // No vblanks at all: overdue inference has to carry the clock.
    let target = clock.get_time(false) + clock.frequency() / 20;
    let start = Instant::now();
    let woke = clock.wait(target);

    assert!(woke >= target);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(clock.diagnostics().total_missed_vblanks >= 4);
}

#[test]
fn test_wait_in_fallback_uses_system_clock() {
    let clock = ReferenceClock::new();
    let target = clock.get_time(false) + clock.frequency() / 50;
    let start = Instant::now();

    let woke = clock.wait(target);
    assert!(woke >= target);
    assert!(start.elapsed() >= Duration::from_millis(15));
}

#[test]
fn test_wait_for_past_target_returns_immediately() {
    let (time, clock) = manual_clock(1_000_000);
    time.set(10_000);
    assert_eq!(clock.wait(5_000), 10_000);
}
