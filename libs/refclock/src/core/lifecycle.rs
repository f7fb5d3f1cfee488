// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Backend lifecycle.
//!
//! [`ClockController`] owns the vblank thread. The thread builds a backend,
//! measures the refresh rate, hands the clock to the backend and keeps it
//! running across mode switches and device resets:
//!
//! ```text
//!            ┌───────────────────────────────────────────┐
//!            ▼                                           │
//! STOPPED ─▶ MEASURING ──ok──▶ RUNNING ──rate/reset/lost─▶ RESET
//!            │                    │
//!            └──unsupported──▶ FAILED ──display event──▶ MEASURING
//!                                 │
//!            stop() from any state ─▶ STOPPING ─▶ STOPPED
//! ```
//!
//! While no backend runs the clock follows the system clock.

use super::backends::select_backend;
use super::{
    BackendExit, BackendPreference, CleanupGuard, ClockConfig, ClockError, DisplayEvent,
    DisplayEventBus, DisplayEventListener, ListenerId, ReferenceClock, Result, RunContext,
    VblankBackend,
};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Consecutive transient setup failures before the controller stops retrying
/// and waits for a display event.
const MAX_SETUP_FAILURES: u32 = 3;

/// Builds a fresh backend for every measurement attempt.
pub type BackendFactory = Box<dyn FnMut(&ClockConfig) -> Result<Box<dyn VblankBackend>> + Send>;

/// Where the vblank thread is.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    Stopped,
    Measuring,
    Running { backend: String, refresh_rate: f64 },
    /// Re-measuring after a rate change, reset or lost device.
    Reset,
    /// No usable backend; waiting for a display change.
    Failed,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Measuring => write!(f, "measuring"),
            LifecycleState::Running {
                backend,
                refresh_rate,
            } => write!(f, "running ({} at {:.3} Hz)", backend, refresh_rate),
            LifecycleState::Reset => write!(f, "reset"),
            LifecycleState::Failed => write!(f, "failed"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

struct Shared {
    clock: Arc<ReferenceClock>,
    config: Arc<ClockConfig>,
    stop: Arc<AtomicBool>,
    display_changed: Arc<AtomicBool>,
    state: Mutex<LifecycleState>,
    /// Set by a display event, consumed by the thread.
    event_pending: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock();
        // Once stopping, only the final transition is allowed.
        if *state == LifecycleState::Stopping && next != LifecycleState::Stopped {
            return;
        }
        if *state != next {
            tracing::debug!("[ClockController] {} -> {}", *state, next);
        }
        *state = next;
    }

    fn run_context(&self) -> RunContext {
        RunContext::new(
            Arc::clone(&self.clock),
            Arc::clone(&self.config),
            Arc::clone(&self.stop),
            Arc::clone(&self.display_changed),
        )
    }

    fn clear_display_event(&self) {
        let mut pending = self.event_pending.lock();
        *pending = false;
        self.display_changed.store(false, Ordering::Release);
    }

    /// Block until a display event arrives or stop is requested.
    fn wait_for_display_event(&self) {
        let mut pending = self.event_pending.lock();
        while !*pending && !self.stop_requested() {
            self.wake.wait(&mut pending);
        }
        *pending = false;
    }

    /// Sleep for `duration` unless stop is requested first.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut pending = self.event_pending.lock();
        while !self.stop_requested() {
            if self.wake.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _pending = self.event_pending.lock();
        self.wake.notify_all();
    }
}

impl DisplayEventListener for Shared {
    fn on_display_event(&self, event: DisplayEvent) {
        tracing::info!("[ClockController] Display event {:?}, re-measuring", event);
        self.display_changed.store(true, Ordering::Release);
        let mut pending = self.event_pending.lock();
        *pending = true;
        self.wake.notify_all();
    }
}

/// Runs a vblank backend for a [`ReferenceClock`] on a dedicated thread.
///
/// Dropping the controller stops the thread.
pub struct ClockController {
    shared: Arc<Shared>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<(Arc<DisplayEventBus>, ListenerId)>>,
    clock_listener: ListenerId,
}

impl ClockController {
    /// Start with the backend `config.backend` selects.
    pub fn start(clock: Arc<ReferenceClock>, config: ClockConfig) -> Result<Self> {
        Self::start_with(clock, config, Box::new(select_backend))
    }

    /// Start with backends built by `factory`.
    pub fn start_with(
        clock: Arc<ReferenceClock>,
        config: ClockConfig,
        factory: BackendFactory,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            clock,
            config: Arc::new(config),
            stop: Arc::new(AtomicBool::new(false)),
            display_changed: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LifecycleState::Stopped),
            event_pending: Mutex::new(false),
            wake: Condvar::new(),
        });

        let listener: Arc<dyn DisplayEventListener> = shared.clone();
        let clock_listener = shared.clock.display_events().register(&listener);

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("refclock-vblank".to_string())
            .spawn(move || run_loop(&worker, factory))
            .map_err(|e| {
                shared.clock.display_events().unregister(clock_listener);
                ClockError::Runtime(format!("failed to spawn vblank thread: {}", e))
            })?;

        Ok(Self {
            shared,
            thread_handle: Mutex::new(Some(handle)),
            subscription: Mutex::new(None),
            clock_listener,
        })
    }

    pub fn clock(&self) -> &Arc<ReferenceClock> {
        &self.shared.clock
    }

    pub fn config(&self) -> &ClockConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.lock().is_some()
    }

    /// Listener to register on a display-event source.
    pub fn display_listener(&self) -> Arc<dyn DisplayEventListener> {
        self.shared.clone()
    }

    /// Register on `bus` until the controller stops.
    pub fn subscribe(&self, bus: &Arc<DisplayEventBus>) {
        let id = bus.register(&self.display_listener());
        let previous = self.subscription.lock().replace((Arc::clone(bus), id));
        if let Some((old_bus, old_id)) = previous {
            old_bus.unregister(old_id);
        }
    }

    /// Same as delivering `event` through a subscribed bus.
    pub fn notify_display_event(&self, event: DisplayEvent) {
        self.shared.on_display_event(event);
    }

    /// Stop the vblank thread and wait for it. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let Some(handle) = self.thread_handle.lock().take() else {
            return Ok(());
        };

        self.shared.set_state(LifecycleState::Stopping);
        self.shared.request_stop();

        if let Some((bus, id)) = self.subscription.lock().take() {
            bus.unregister(id);
        }
        self.shared
            .clock
            .display_events()
            .unregister(self.clock_listener);

        let joined = handle.join();
        if self.shared.clock.is_vblank_active() {
            self.shared.clock.disarm();
        }
        self.shared.set_state(LifecycleState::Stopped);

        joined.map_err(|_| ClockError::Runtime("vblank thread panicked".into()))
    }
}

impl Drop for ClockController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("[ClockController] {}", e);
        }
    }
}

fn report_unavailable(config: &ClockConfig, name: &str, error: &ClockError, logged: &mut bool) {
    if config.backend == BackendPreference::System {
        if !*logged {
            tracing::info!("[ClockController] Using the system clock");
        }
    } else if !*logged {
        tracing::warn!(
            "[ClockController] {} unavailable, falling back to the system clock: {}",
            name,
            error
        );
    } else {
        tracing::debug!("[ClockController] {} still unavailable: {}", name, error);
    }
    *logged = true;
}

/// First reset re-attaches; a second one in a row parks the thread until a
/// display event.
fn handle_counter_reset(shared: &Shared, name: &str, counter_resets: &mut u32) {
    *counter_resets += 1;
    if *counter_resets >= 2 {
        tracing::warn!(
            "[ClockController] {} counter reset twice in a row, waiting for a display change",
            name
        );
        *counter_resets = 0;
        shared.set_state(LifecycleState::Failed);
        shared.wait_for_display_event();
    } else {
        tracing::info!("[ClockController] {} counter reset, re-attaching", name);
        shared.set_state(LifecycleState::Reset);
    }
}

fn run_loop(shared: &Shared, mut factory: BackendFactory) {
    tracing::info!("[ClockController] Started");
    shared.clock.reset_for_start();

    let mut failure_logged = false;
    let mut counter_resets = 0u32;
    let mut setup_failures = 0u32;

    while !shared.stop_requested() {
        shared.clear_display_event();
        shared.set_state(LifecycleState::Measuring);

        let backend = match factory(&shared.config) {
            Ok(backend) => backend,
            Err(e) => {
                report_unavailable(
                    &shared.config,
                    shared.config.backend.as_str(),
                    &e,
                    &mut failure_logged,
                );
                shared.set_state(LifecycleState::Failed);
                shared.wait_for_display_event();
                continue;
            }
        };

        let mut backend = CleanupGuard::new(backend);
        let name = backend.name().to_string();
        let ctx = shared.run_context();

        if let Err(e) = backend.setup(&ctx) {
            drop(backend);
            if matches!(e, ClockError::CounterReset { .. }) {
                handle_counter_reset(shared, &name, &mut counter_resets);
            } else if e.is_unsupported() {
                shared.set_state(LifecycleState::Failed);
                report_unavailable(&shared.config, &name, &e, &mut failure_logged);
                shared.wait_for_display_event();
            } else {
                setup_failures += 1;
                shared.set_state(LifecycleState::Failed);
                if setup_failures >= MAX_SETUP_FAILURES {
                    tracing::warn!(
                        "[ClockController] {} setup failed {} times in a row, waiting for a display change: {}",
                        name,
                        setup_failures,
                        e
                    );
                    setup_failures = 0;
                    shared.wait_for_display_event();
                } else {
                    if setup_failures == 1 {
                        tracing::warn!("[ClockController] {} setup failed: {}", name, e);
                    } else {
                        tracing::debug!("[ClockController] {} setup failed again: {}", name, e);
                    }
                    shared.pause(shared.config.restart_delay());
                }
            }
            continue;
        }
        setup_failures = 0;

        let refresh_rate = backend.refresh_rate();
        if let Err(e) = shared.clock.arm(refresh_rate) {
            drop(backend);
            shared.set_state(LifecycleState::Failed);
            report_unavailable(&shared.config, &name, &e, &mut failure_logged);
            shared.wait_for_display_event();
            continue;
        }
        failure_logged = false;
        shared.set_state(LifecycleState::Running {
            backend: name.clone(),
            refresh_rate,
        });
        tracing::info!("[ClockController] {} running at {:.3} Hz", name, refresh_rate);

        let exit = backend.run(&ctx);
        shared.clock.disarm();
        drop(backend);

        match exit {
            BackendExit::Stopped => break,
            BackendExit::CounterReset => {
                handle_counter_reset(shared, &name, &mut counter_resets);
            }
            BackendExit::Failed(e) => {
                counter_resets = 0;
                tracing::warn!("[ClockController] {} failed: {}", name, e);
                shared.set_state(LifecycleState::Reset);
                shared.pause(shared.config.restart_delay());
            }
            other => {
                counter_resets = 0;
                tracing::info!("[ClockController] {}: {}, re-measuring", name, other);
                shared.set_state(LifecycleState::Reset);
                shared.pause(shared.config.restart_delay());
            }
        }
    }

    shared.set_state(LifecycleState::Stopped);
    tracing::info!("[ClockController] Stopped");
}
