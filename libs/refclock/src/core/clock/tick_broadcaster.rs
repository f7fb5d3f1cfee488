// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Single-slot tick notification.
///
/// Every broadcast bumps a generation number. A waiter remembers the
/// generation it last saw and sleeps until it changes, so a tick that lands
/// between the waiter's check and its sleep is never lost.
pub trait TickBroadcaster: Send + Sync {
    /// Current generation.
    fn generation(&self) -> u64;

    /// Wake every waiter.
    fn broadcast(&self);

    /// Block until the generation differs from `seen` or `timeout` elapses.
    ///
    /// Returns the generation observed at wake.
    fn wait(&self, seen: u64, timeout: Duration) -> u64;
}

/// [`TickBroadcaster`] on a mutex-protected counter and a condition variable.
#[derive(Default)]
pub struct CondvarTickBroadcaster {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl CondvarTickBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TickBroadcaster for CondvarTickBroadcaster {
    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn broadcast(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
        *generation
    }
}
