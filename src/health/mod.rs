use crate::metrics::Metrics;
use crate::upstream::Backend;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Passive, window-based health accounting.
///
/// One periodic task per eligible backend. Every `errors_window` the task
/// drains the backend's error counter and gates `online` on it: at or above
/// `max_errors` the backend goes offline for the next window, below it the
/// backend comes (back) online. There is no probing state; a single clean
/// window is enough to recover.
///
/// Backends with `max_errors == 0` or a zero window get no task and stay
/// online forever.
pub struct HealthMonitor {
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns a window-tick task for each eligible backend. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, backends: &[Arc<Backend>]) {
        let mut tasks = self.tasks.lock();
        for backend in backends {
            let window = backend.errors_window();
            if backend.max_errors() == 0 || window.is_zero() {
                debug!("backend {} has no error window, monitor disabled", backend);
                continue;
            }

            let backend = Arc::clone(backend);
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                // First evaluation happens one full window after start.
                let mut ticker = interval_at(Instant::now() + window, window);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let errors = backend.take_errors();
                            let healthy = errors < backend.max_errors();
                            if backend.online() != healthy {
                                if healthy {
                                    info!("backend {} back online", backend);
                                } else {
                                    warn!(
                                        "backend {} offline: {} errors in {:?}",
                                        backend, errors, window
                                    );
                                }
                            }
                            backend.set_online(healthy);
                            Metrics::set_backend_online(&backend.to_string(), healthy);
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }
    }

    /// Signals every monitor task to stop after its current tick.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
        self.tasks.lock().clear();
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
