//! Explicit lifecycle that camera sessions bind to
//!
//! A [`Lifecycle`] stands in for whatever owns the screen the camera is shown
//! on. Sessions register a teardown observer with it; calling
//! [`Lifecycle::destroy`] runs every observer once and leaves the lifecycle in
//! a terminal state where no new session can bind.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialized,
    Started,
    Destroyed,
}

pub trait LifecycleObserver: Send + Sync {
    fn on_destroy(&self, lifecycle: &Lifecycle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    state: Mutex<LifecycleState>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn LifecycleObserver>)>>,
    next_id: AtomicU64,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                state: Mutex::new(LifecycleState::Initialized),
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.inner.state)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == LifecycleState::Destroyed
    }

    pub fn start(&self) {
        let mut state = lock(&self.inner.state);
        if *state == LifecycleState::Initialized {
            *state = LifecycleState::Started;
        }
    }

    /// Observers added after destruction are never called.
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) -> ObserverId {
        let id = ObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if !self.is_destroyed() {
            lock(&self.inner.observers).push((id, observer));
        }
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.inner.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    /// End the lifecycle and run teardown observers. Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == LifecycleState::Destroyed {
                return;
            }
            *state = LifecycleState::Destroyed;
        }

        // Observers may touch the lifecycle, so call them without holding locks.
        let observers = std::mem::take(&mut *lock(&self.inner.observers));
        info!("Lifecycle destroyed, notifying {} observer(s)", observers.len());
        for (id, observer) in observers {
            debug!("Running teardown observer {:?}", id);
            observer.on_destroy(self);
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl LifecycleObserver for Counting {
        fn on_destroy(&self, lifecycle: &Lifecycle) {
            assert!(lifecycle.is_destroyed());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destroy_notifies_each_observer_once() {
        let lifecycle = Lifecycle::new();
        lifecycle.start();
        assert_eq!(lifecycle.state(), LifecycleState::Started);

        let observer = Arc::new(Counting::default());
        lifecycle.add_observer(observer.clone());
        lifecycle.destroy();
        lifecycle.destroy();

        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.observer_count(), 0);
    }

    #[test]
    fn removed_observer_is_not_called() {
        let lifecycle = Lifecycle::new();
        let observer = Arc::new(Counting::default());
        let id = lifecycle.add_observer(observer.clone());
        assert!(lifecycle.remove_observer(id));
        assert!(!lifecycle.remove_observer(id));

        lifecycle.destroy();
        assert_eq!(observer.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_added_after_destroy_is_ignored() {
        let lifecycle = Lifecycle::new();
        lifecycle.destroy();
        let observer = Arc::new(Counting::default());
        lifecycle.add_observer(observer.clone());
        assert_eq!(lifecycle.observer_count(), 0);
        assert_eq!(observer.0.load(Ordering::SeqCst), 0);
    }
}
