// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Controller lifecycle: fallback, resets, display events and cleanup.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use refclock::core::backends::{CounterBackend, SimulatedCounter, SimulatedDisplay};
use refclock::core::{BackendExit, BackendFactory, RunContext};
use refclock::{
    BackendPreference, ClockConfig, ClockController, ClockError, DisplayEvent, DisplayEventBus,
    LifecycleState, ReferenceClock, Result, VblankBackend,
};

fn fast_config(backend: BackendPreference) -> ClockConfig {
    ClockConfig {
        backend,
        measurement_windows: 3,
        measurement_window_ms: 120,
        rate_recheck_interval_ms: 500,
        event_timeout_ms: 200,
        restart_delay_ms: 10,
        ..ClockConfig::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn is_running(state: &LifecycleState) -> bool {
    matches!(state, LifecycleState::Running { .. })
}

#[derive(Default)]
struct Tally {
    setups: AtomicUsize,
    runs: AtomicUsize,
    cleanups: AtomicUsize,
}

impl Tally {
    fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Tick at ~200 Hz until interrupted.
    Run,
    Unsupported,
    CounterReset,
    Fail,
    /// `setup` sees the counter go backwards.
    SetupCounterReset,
    /// `setup` hits a plain device error every time.
    SetupFail,
    /// `setup` succeeds but reports this rate.
    Rate(f64),
}

struct MockBackend {
    tally: Arc<Tally>,
    behavior: Behavior,
}

impl VblankBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn setup(&mut self, _ctx: &RunContext) -> Result<()> {
        self.tally.setups.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Unsupported => Err(ClockError::Unsupported("no display attached".into())),
            Behavior::SetupCounterReset => Err(ClockError::CounterReset {
                previous: 42,
                current: 3,
            }),
            Behavior::SetupFail => Err(ClockError::Backend("ioctl failed".into())),
            _ => Ok(()),
        }
    }

    fn run(&mut self, ctx: &RunContext) -> BackendExit {
        self.tally.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::CounterReset => BackendExit::CounterReset,
            Behavior::Fail => BackendExit::Failed(ClockError::Backend("ioctl failed".into())),
            _ => loop {
                if let Some(exit) = ctx.interruption() {
                    return exit;
                }
                ctx.vblank(1, ctx.now());
                thread::sleep(Duration::from_millis(5));
            },
        }
    }

    fn cleanup(&mut self) {
        self.tally.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn refresh_rate(&self) -> f64 {
        match self.behavior {
            Behavior::Rate(rate) => rate,
            _ => 200.0,
        }
    }
}

fn mock_factory(tally: &Arc<Tally>, behavior: Behavior) -> BackendFactory {
    let tally = Arc::clone(tally);
    Box::new(move |_config: &ClockConfig| -> Result<Box<dyn VblankBackend>> {
        Ok(Box::new(MockBackend {
            tally: Arc::clone(&tally),
            behavior,
        }) as Box<dyn VblankBackend>)
    })
}

#[test]
fn test_running_backend_drives_clock_until_stop() {
    let tally = Arc::new(Tally::default());
    let clock = Arc::new(ReferenceClock::new());
    let controller = ClockController::start_with(
        Arc::clone(&clock),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::Run),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || is_running(&controller.state())));
    assert_eq!(
        controller.state(),
        LifecycleState::Running {
            backend: "mock".into(),
            refresh_rate: 200.0
        }
    );
    assert!(clock.is_vblank_active());
    assert_eq!(clock.refresh_rate().unwrap().rate, 200.0);

    controller.stop().unwrap();
    assert_eq!(controller.state(), LifecycleState::Stopped);
    assert!(!clock.is_vblank_active());
    assert_eq!(tally.setups(), 1);
    assert_eq!(tally.cleanups(), 1);
}

#[test]
fn test_unsupported_backend_waits_for_display_event() {
    let tally = Arc::new(Tally::default());
    let clock = Arc::new(ReferenceClock::new());
    let controller = ClockController::start_with(
        Arc::clone(&clock),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::Unsupported),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || controller.state()
        == LifecycleState::Failed));
    assert!(!clock.is_vblank_active());

    // No retry without a display change.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(tally.setups(), 1);
    assert_eq!(tally.runs(), 0);

    controller.notify_display_event(DisplayEvent::ModeChanged);
    assert!(wait_until(Duration::from_secs(5), || tally.setups() == 2));

    // Stop must not hang while parked in FAILED.
    let start = Instant::now();
    controller.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(tally.cleanups(), tally.setups());
}

#[test]
fn test_second_counter_reset_is_a_hard_failure() {
    let tally = Arc::new(Tally::default());
    let controller = ClockController::start_with(
        Arc::new(ReferenceClock::new()),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::CounterReset),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || tally.runs() >= 2
        && controller.state() == LifecycleState::Failed));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(tally.runs(), 2);

    controller.notify_display_event(DisplayEvent::DeviceReset);
    assert!(wait_until(Duration::from_secs(5), || tally.runs() >= 4));

    controller.stop().unwrap();
    assert_eq!(tally.cleanups(), tally.setups());
}

#[test]
fn test_counter_reset_during_setup_follows_reset_policy() {
    let tally = Arc::new(Tally::default());
    let clock = Arc::new(ReferenceClock::new());
    let controller = ClockController::start_with(
        Arc::clone(&clock),
        ClockConfig::default(),
        mock_factory(&tally, Behavior::SetupCounterReset),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || tally.setups() >= 2
        && controller.state() == LifecycleState::Failed));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(tally.setups(), 2);
    assert_eq!(tally.runs(), 0);
    assert!(!clock.is_vblank_active());

    controller.notify_display_event(DisplayEvent::DeviceReset);
    assert!(wait_until(Duration::from_secs(5), || tally.setups() >= 4
        && controller.state() == LifecycleState::Failed));

    controller.stop().unwrap();
    assert_eq!(tally.cleanups(), tally.setups());
}

#[test]
fn test_repeated_setup_failures_wait_for_display_event() {
    let tally = Arc::new(Tally::default());
    let controller = ClockController::start_with(
        Arc::new(ReferenceClock::new()),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::SetupFail),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || tally.setups() >= 3));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(tally.setups(), 3);
    assert_eq!(controller.state(), LifecycleState::Failed);

    controller.notify_display_event(DisplayEvent::ModeChanged);
    assert!(wait_until(Duration::from_secs(5), || tally.setups() >= 6));

    controller.stop().unwrap();
    assert_eq!(tally.cleanups(), tally.setups());
}

#[test]
fn test_unusable_rate_keeps_system_clock() {
    for rate in [0.0, f64::NAN] {
        let tally = Arc::new(Tally::default());
        let clock = Arc::new(ReferenceClock::new());
        let controller = ClockController::start_with(
            Arc::clone(&clock),
            fast_config(BackendPreference::Auto),
            mock_factory(&tally, Behavior::Rate(rate)),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(5), || controller.state()
            == LifecycleState::Failed));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(tally.setups(), 1);
        assert_eq!(tally.runs(), 0);
        assert!(!clock.is_vblank_active());
        assert!(clock.refresh_rate().is_none());

        // Reads keep following the system clock.
        let before = clock.get_time(true);
        thread::sleep(Duration::from_millis(20));
        assert!(clock.get_time(true) - before >= 20_000_000);

        controller.stop().unwrap();
        assert_eq!(tally.cleanups(), 1);
    }
}

#[test]
fn test_refresh_changed_remeasures() {
    let tally = Arc::new(Tally::default());
    let clock = Arc::new(ReferenceClock::new());
    let controller = ClockController::start_with(
        Arc::clone(&clock),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::Run),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || is_running(&controller.state())));
    clock.refresh_changed();
    assert!(wait_until(Duration::from_secs(5), || tally.setups() >= 2
        && is_running(&controller.state())));

    controller.stop().unwrap();
    assert_eq!(tally.cleanups(), tally.setups());
}

#[test]
fn test_failed_run_restarts_after_delay() {
    let tally = Arc::new(Tally::default());
    let controller = ClockController::start_with(
        Arc::new(ReferenceClock::new()),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::Fail),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || tally.runs() >= 3));
    controller.stop().unwrap();
    assert_eq!(tally.cleanups(), tally.setups());
}

#[test]
fn test_display_event_on_bus_remeasures() {
    let tally = Arc::new(Tally::default());
    let bus = Arc::new(DisplayEventBus::new());
    let controller = ClockController::start_with(
        Arc::new(ReferenceClock::new()),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::Run),
    )
    .unwrap();
    controller.subscribe(&bus);

    assert!(wait_until(Duration::from_secs(5), || is_running(&controller.state())));
    bus.publish(DisplayEvent::ModeChanged);

    assert!(wait_until(Duration::from_secs(5), || tally.setups() == 2
        && is_running(&controller.state())));
    assert_eq!(tally.cleanups(), 1);

    drop(controller);
    assert_eq!(bus.listener_count(), 0);
    assert_eq!(tally.cleanups(), 2);
}

#[test]
fn test_stop_resets_speed_on_next_start() {
    let tally = Arc::new(Tally::default());
    let clock = Arc::new(ReferenceClock::new());
    clock.set_speed(1.5);

    let controller = ClockController::start_with(
        Arc::clone(&clock),
        fast_config(BackendPreference::Auto),
        mock_factory(&tally, Behavior::Run),
    )
    .unwrap();
    assert!(wait_until(Duration::from_secs(5), || is_running(&controller.state())));
    assert_eq!(clock.speed(), 1.0);
    assert_eq!(clock.diagnostics().total_missed_vblanks, 0);
    controller.stop().unwrap();
}

fn simulated_factory(display: &Arc<SimulatedDisplay>, attempts: &Arc<AtomicUsize>) -> BackendFactory {
    let display = Arc::clone(display);
    let attempts = Arc::clone(attempts);
    Box::new(move |_config: &ClockConfig| -> Result<Box<dyn VblankBackend>> {
        attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CounterBackend::new(SimulatedCounter::new(Arc::clone(&display))))
            as Box<dyn VblankBackend>)
    })
}

fn running_at(controller: &ClockController, rate: f64) -> bool {
    matches!(controller.state(), LifecycleState::Running { refresh_rate, .. } if refresh_rate == rate)
}

#[test]
fn test_simulated_counter_end_to_end() {
    let clock = Arc::new(ReferenceClock::new());
    let controller = ClockController::start(
        Arc::clone(&clock),
        fast_config(BackendPreference::SimulatedCounter),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || running_at(&controller, 60.0)));
    let before = clock.get_time(false);
    thread::sleep(Duration::from_millis(200));
    let advanced = clock.get_time(false) - before;

    // 200 ms of 60 Hz vblanks, within a couple of frames.
    let frame = clock.frequency() / 60;
    assert!(advanced > clock.frequency() / 5 - 3 * frame, "advanced {}", advanced);
    assert!(advanced < clock.frequency() / 5 + 3 * frame, "advanced {}", advanced);

    controller.stop().unwrap();
}

#[test]
fn test_simulated_raster_and_wait_backends_run() {
    for backend in [BackendPreference::SimulatedRaster, BackendPreference::SimulatedWait] {
        let clock = Arc::new(ReferenceClock::new());
        // Polled edges jitter by a poll interval, so measure over longer windows.
        let config = ClockConfig {
            measurement_window_ms: 200,
            ..fast_config(backend)
        };
        let controller = ClockController::start(Arc::clone(&clock), config).unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || running_at(&controller, 60.0)),
            "{:?} never reached 60 Hz: {}",
            backend,
            controller.state()
        );
        assert!(clock.is_vblank_active());
        controller.stop().unwrap();
    }
}

#[test]
fn test_counter_reset_reattaches() {
    let display = SimulatedDisplay::new(60.0).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let controller = ClockController::start_with(
        Arc::new(ReferenceClock::new()),
        fast_config(BackendPreference::Auto),
        simulated_factory(&display, &attempts),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || running_at(&controller, 60.0)));
    thread::sleep(Duration::from_millis(50));
    display.reset_counter();

    assert!(wait_until(Duration::from_secs(5), || attempts.load(Ordering::SeqCst) == 2
        && running_at(&controller, 60.0)));
    controller.stop().unwrap();
}

#[test]
fn test_mode_switch_is_detected_by_recheck() {
    let display = SimulatedDisplay::new(60.0).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let controller = ClockController::start_with(
        Arc::new(ReferenceClock::new()),
        fast_config(BackendPreference::Auto),
        simulated_factory(&display, &attempts),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || running_at(&controller, 60.0)));
    display.set_refresh_rate(100.0).unwrap();

    assert!(wait_until(Duration::from_secs(5), || running_at(&controller, 100.0)));
    assert_eq!(controller.clock().refresh_rate().unwrap().rate, 100.0);
    controller.stop().unwrap();
}

#[test]
fn test_silent_display_falls_back_until_it_returns() {
    let display = SimulatedDisplay::new(60.0).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let clock = Arc::new(ReferenceClock::new());
    let controller = ClockController::start_with(
        Arc::clone(&clock),
        fast_config(BackendPreference::Auto),
        simulated_factory(&display, &attempts),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || running_at(&controller, 60.0)));
    display.set_paused(true);

    // Device lost, then re-measurement finds no vblanks.
    assert!(wait_until(Duration::from_secs(5), || controller.state()
        == LifecycleState::Failed));
    assert!(!clock.is_vblank_active());

    let before = clock.get_time(false);
    thread::sleep(Duration::from_millis(20));
    assert!(clock.get_time(false) > before);

    display.set_paused(false);
    controller.notify_display_event(DisplayEvent::DeviceReset);
    assert!(wait_until(Duration::from_secs(5), || running_at(&controller, 60.0)));
    controller.stop().unwrap();
}
