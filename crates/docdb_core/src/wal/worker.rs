//! Named background threads with a stop flag.

use crate::error::{CoreError, CoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Stop flag handed to a worker body.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Returns true once the owner asked the worker to exit.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A running background thread.
///
/// The body must check the [`StopFlag`] after every wait.
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `body` on a thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be created.
    pub fn spawn<F>(name: &'static str, body: F) -> CoreResult<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = StopFlag::default();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))
            .map_err(|err| CoreError::internal(format!("cannot start {name} thread: {err}")))?;
        debug!(thread = name, "started background thread");
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Name of the thread.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Sets the stop flag, calls `wake` so a sleeping body notices, and
    /// joins the thread.
    pub fn stop(mut self, wake: impl Fn()) {
        self.stop.set();
        wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(thread = self.name, "background thread panicked");
            }
        }
        debug!(thread = self.name, "stopped background thread");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Detached threads still see the flag and exit on their next check
        self.stop.set();
    }
}
