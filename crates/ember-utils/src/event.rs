//! Manual-reset event used to gate one thread on another.
//!
//! The applier's execute loop parks on one of these until the cache
//! loop has staged the payloads a package needs.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// A manual-reset event. Once set it stays set until [`SyncEvent::reset`].
#[derive(Debug, Clone, Default)]
pub struct SyncEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl SyncEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, releasing all current and future waiters.
    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        let mut signaled = lock.lock().unwrap_or_else(|e| e.into_inner());
        *signaled = true;
        cvar.notify_all();
    }

    pub fn reset(&self) {
        let (lock, _) = &*self.inner;
        let mut signaled = lock.lock().unwrap_or_else(|e| e.into_inner());
        *signaled = false;
    }

    pub fn is_set(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut signaled = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*signaled {
            signaled = cvar.wait(signaled).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    /// Returns `true` if the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut signaled = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*signaled {
            let (guard, result) = cvar
                .wait_timeout(signaled, timeout)
                .unwrap_or_else(|e| e.into_inner());
            signaled = guard;
            if result.timed_out() {
                return *signaled;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::SyncEvent;

    #[test]
    fn test_set_releases_waiter() {
        let event = SyncEvent::new();
        let waiter = event.clone();

        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        event.set();
        handle.join().unwrap();
        assert!(event.is_set());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = SyncEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_manual_reset_stays_signaled() {
        let event = SyncEvent::new();
        event.set();
        event.wait();
        event.wait(); // still signaled
        event.reset();
        assert!(!event.is_set());
    }
}
