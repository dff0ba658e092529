//! Task spawning and shutdown abstractions.
//!
//! The control plane (applier re-runs, WebRTC signalling, stats polling) is
//! async and spawns through [`TaskSpawner`] so the core library isn't tied to
//! a specific runtime flavor. The data plane is the opposite: receivers,
//! source processors, and sink mixers each own a plain OS thread (spec
//! 5 "Parallel threads, not cooperative") and block on sockets, condvars, or
//! pacing timers with a bounded timeout so they can observe [`StopSignal`]
//! within one `loop_max_sleep_ms` interval.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative stop flag shared by every data-plane worker thread.
///
/// Cloning shares the same underlying flag (it wraps an `Arc`). Calling
/// [`StopSignal::stop`] from any clone requests every thread to observe it
/// on the next wakeup and exit its loop.
#[derive(Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    /// Creates a fresh, unset stop signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests all holders of this signal to stop.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns whether a stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Blocks the current thread for up to `timeout`, waking early and
    /// returning `true` as soon as a stop is requested. Used by workers that
    /// have no other wakeup source to poll against (e.g. the timeshift
    /// cleanup pass).
    pub fn wait(&self, timeout: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        while waited < timeout {
            if self.is_stopped() {
                return true;
            }
            let step = POLL.min(timeout - waited);
            std::thread::sleep(step);
            waited += step;
        }
        self.is_stopped()
    }
}

/// Abstraction for spawning background tasks.
///
/// Allows core services to spawn asynchronous work without knowing the
/// underlying runtime. Implementations should ensure tasks are properly
/// tracked and can complete even if the spawner is dropped.
///
/// # Example
///
/// ```ignore
/// struct MyService {
///     spawner: Arc<dyn TaskSpawner>,
/// }
///
/// impl MyService {
///     fn start_background_work(&self) {
///         self.spawner.spawn(async {
///             // Background work here
///         });
///     }
/// }
/// ```
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task.
    ///
    /// The task runs independently of the caller and will continue until
    /// completion. The spawner does not provide a way to cancel or join
    /// the spawned task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner for standalone server and general use.
///
/// Uses a Tokio runtime handle to spawn tasks. This is the default
/// implementation for non-Tauri environments.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tokio_spawner_executes_task() {
        let spawner = TokioSpawner::current();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        spawner.spawn(async move {
            executed_clone.store(true, Ordering::SeqCst);
        });

        // Give the task time to execute
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(executed.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_signal_reports_unset_initially() {
        let sig = StopSignal::new();
        assert!(!sig.is_stopped());
    }

    #[test]
    fn stop_signal_shares_state_across_clones() {
        let sig = StopSignal::new();
        let clone = sig.clone();
        clone.stop();
        assert!(sig.is_stopped());
    }

    #[test]
    fn stop_signal_wait_returns_early_on_stop() {
        let sig = StopSignal::new();
        let waiter = sig.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            waiter.stop();
        });
        let stopped = sig.wait(std::time::Duration::from_secs(5));
        assert!(stopped);
    }
}
