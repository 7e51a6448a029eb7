//! Memory pressure events
//!
//! When the allocator shim or a VRAM buffer cannot get device memory even
//! after evicting everything it may, the engine posts a [`PressureEvent`] to
//! every subscriber instead of calling back into host code. Subscribers
//! drain their receiver at a point of their choosing, free what they can and
//! retry.

use std::sync::mpsc::{channel, Receiver, Sender};

use parking_lot::Mutex;
use serde::Serialize;
use vbar_gpu::DeviceOrdinal;

/// A device allocation that failed after reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PressureEvent {
    /// Device ordinal
    pub device: DeviceOrdinal,
    /// Bytes that could not be obtained
    pub requested: u64,
    /// Bytes evicted while trying
    pub reclaimed: u64,
}

/// Fan-out of pressure events to subscribers
#[derive(Debug, Default)]
pub(crate) struct PressureBus {
    subscribers: Mutex<Vec<Sender<PressureEvent>>>,
}

impl PressureBus {
    pub(crate) fn subscribe(&self) -> Receiver<PressureEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting dropped ones
    pub(crate) fn post(&self, event: PressureEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: PressureEvent = PressureEvent {
        device: 0,
        requested: 64,
        reclaimed: 32,
    };

    #[test]
    fn test_every_subscriber_receives() {
        let bus = PressureBus::default();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.post(EVENT);
        assert_eq!(a.try_recv().unwrap(), EVENT);
        assert_eq!(b.try_recv().unwrap(), EVENT);
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = PressureBus::default();
        let a = bus.subscribe();
        drop(bus.subscribe());
        bus.post(EVENT);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_iter().count(), 1);
    }

    #[test]
    fn test_post_without_subscribers() {
        PressureBus::default().post(EVENT);
    }
}
