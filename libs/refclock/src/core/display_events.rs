// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Display-change notifications from the windowing layer.
//!
//! The windowing layer owns a [`DisplayEventBus`] and publishes mode switches
//! and device loss on it. The clock controller registers itself as a
//! listener so the vblank backend gets torn down and re-measured.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Something about the display changed under the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    /// Resolution or refresh rate changed.
    ModeChanged,
    /// The GPU device or its context was lost.
    DeviceLost,
    /// A lost device was recreated.
    DeviceReset,
}

pub trait DisplayEventListener: Send + Sync {
    /// Called on the publishing thread. Must not block.
    fn on_display_event(&self, event: DisplayEvent);
}

/// Handle returned by [`DisplayEventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of display-event listeners.
///
/// Listeners are held weakly; a dropped listener is skipped and pruned on the
/// next publish even if it never unregistered.
#[derive(Default)]
pub struct DisplayEventBus {
    listeners: Mutex<Vec<(ListenerId, Weak<dyn DisplayEventListener>)>>,
    next_id: AtomicU64,
}

impl DisplayEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: &Arc<dyn DisplayEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::downgrade(listener)));
        id
    }

    /// Returns whether `id` was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn publish(&self, event: DisplayEvent) {
        tracing::debug!("[DisplayEventBus] Publishing {:?}", event);

        // Dispatch outside the lock so listeners may unregister themselves.
        let live: Vec<Arc<dyn DisplayEventListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|(_, weak)| weak.strong_count() > 0);
            listeners.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        for listener in live {
            listener.on_display_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<DisplayEvent>>,
    }

    impl DisplayEventListener for RecordingListener {
        fn on_display_event(&self, event: DisplayEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_publish_reaches_registered_listeners() {
        let bus = DisplayEventBus::new();
        let recorder = Arc::new(RecordingListener::default());
        let listener: Arc<dyn DisplayEventListener> = recorder.clone();
        bus.register(&listener);

        bus.publish(DisplayEvent::ModeChanged);
        bus.publish(DisplayEvent::DeviceLost);

        assert_eq!(
            *recorder.events.lock(),
            vec![DisplayEvent::ModeChanged, DisplayEvent::DeviceLost]
        );
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let bus = DisplayEventBus::new();
        let recorder = Arc::new(RecordingListener::default());
        let listener: Arc<dyn DisplayEventListener> = recorder.clone();
        let id = bus.register(&listener);

        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        bus.publish(DisplayEvent::ModeChanged);

        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_dropped_listeners_are_pruned() {
        let bus = DisplayEventBus::new();
        {
            let listener: Arc<dyn DisplayEventListener> = Arc::new(RecordingListener::default());
            bus.register(&listener);
            assert_eq!(bus.listener_count(), 1);
        }

        bus.publish(DisplayEvent::DeviceReset);
        assert_eq!(bus.listener_count(), 0);
    }
}
