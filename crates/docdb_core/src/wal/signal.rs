//! Wake-up signal for background threads.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A sticky wake-up flag paired with a condition variable.
///
/// `notify` before `wait` is not lost: the next wait returns immediately.
#[derive(Debug, Default)]
pub struct Signal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    /// Creates an unsignalled instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes one waiter, or the next one to arrive.
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.condvar.notify_all();
    }

    /// Waits for a notification or until `timeout` elapses.
    ///
    /// Returns true if woken by [`Signal::notify`].
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.condvar.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_before_wait_is_kept() {
        let signal = Signal::new();
        signal.notify();
        assert!(signal.wait(Duration::from_millis(1)));
        assert!(!signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn wakes_other_thread() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(waiter.join().unwrap());
    }
}
