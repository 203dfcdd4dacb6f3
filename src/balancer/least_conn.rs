use super::{SelectError, Strategy};
use crate::upstream::Backend;
use hyper::http::request::Parts;
use parking_lot::Mutex;
use std::sync::Arc;

/// Picks the online backend with the fewest in-flight forwards.
///
/// Connection counts are read without per-backend locking; a stale read only
/// biases the pick toward a slightly older snapshot. An idle backend
/// (count 0) short-circuits the scan. Ties go to the earlier list position.
pub struct LeastConn {
    backends: Mutex<Vec<Arc<Backend>>>,
}

impl LeastConn {
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(Vec::new()),
        }
    }
}

impl Default for LeastConn {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LeastConn {
    fn set_backends(&self, backends: &[Arc<Backend>]) {
        *self.backends.lock() = backends.to_vec();
    }

    fn select(&self, _head: &Parts) -> Result<Arc<Backend>, SelectError> {
        let backends = self.backends.lock();

        let mut best: Option<(usize, &Arc<Backend>)> = None;
        for backend in backends.iter() {
            if !backend.online() {
                continue;
            }

            let connections = backend.connections();
            if connections == 0 {
                return Ok(Arc::clone(backend));
            }

            match best {
                Some((min, _)) if connections >= min => {}
                _ => best = Some((connections, backend)),
            }
        }

        best.map(|(_, backend)| Arc::clone(backend))
            .ok_or(SelectError::NoValidServers)
    }
}
