use crate::error::DeviceIoError;
use crate::motion::MotorMode;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionReason {
    Command,
    TargetReached,
    Stalled,
    Fault(DeviceIoError),
}

/// Emitted on every state-machine transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub previous: MotorMode,
    pub current: MotorMode,
    pub position: f64,
    /// Monotonic, so listeners can drop stale notifications.
    pub timestamp_us: u64,
    pub reason: TransitionReason,
}

/// Receives transition events.
///
/// Runs on the regulation worker thread: anything slow must be handed off
/// (channel, queue) or it delays the next control tick.
pub trait MoveListener: Send + Sync {
    fn on_transition(&self, event: &TransitionEvent);
}

impl<F> MoveListener for F
where
    F: Fn(&TransitionEvent) + Send + Sync,
{
    fn on_transition(&self, event: &TransitionEvent) {
        self(event)
    }
}

/// Listeners shared between the facade (registration) and the worker (delivery).
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn MoveListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn MoveListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers outside the lock so a listener may register another one.
    pub fn notify(&self, event: &TransitionEvent) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_transition(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> TransitionEvent {
        TransitionEvent {
            previous: MotorMode::Stopped,
            current: MotorMode::Moving,
            position: 0.0,
            timestamp_us: 1,
            reason: TransitionReason::Command,
        }
    }

    #[test]
    fn closures_are_listeners() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.add(Arc::new(move |e: &TransitionEvent| {
            assert_eq!(e.current, MotorMode::Moving);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        registry.notify(&event());
        registry.notify(&event());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn listener_may_register_during_delivery() {
        let registry = Arc::new(ListenerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.add(Arc::new(move |_: &TransitionEvent| {
            inner.add(Arc::new(|_: &TransitionEvent| {}));
        }));
        registry.notify(&event());
        assert_eq!(registry.len(), 2);
    }
}
