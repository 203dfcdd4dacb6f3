use super::{SelectError, Strategy};
use crate::upstream::Backend;
use hyper::http::request::Parts;
use parking_lot::Mutex;
use std::sync::Arc;

/// Weighted round-robin over an ordered cycle of backends.
///
/// Each `select` scans forward from the cursor, skipping offline entries,
/// and serves the first online backend while ticking the weight counter
/// `wc`. The cursor itself moves only when `wc` reaches the served backend's
/// weight (or wraps to 0); until then it stays put, so a skipped slot is
/// re-checked on every call.
pub struct RoundRobin {
    state: Mutex<Ring>,
}

struct Ring {
    backends: Vec<Arc<Backend>>,
    cursor: usize,
    wc: u64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Ring {
                backends: Vec::new(),
                cursor: 0,
                wc: 0,
            }),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobin {
    fn set_backends(&self, backends: &[Arc<Backend>]) {
        let mut ring = self.state.lock();
        ring.backends = backends.to_vec();
        ring.cursor = 0;
        ring.wc = 0;
    }

    fn select(&self, _head: &Parts) -> Result<Arc<Backend>, SelectError> {
        let mut ring = self.state.lock();
        let len = ring.backends.len();

        for i in 0..len {
            let idx = (ring.cursor + i) % len;
            let backend = Arc::clone(&ring.backends[idx]);

            // Offline entries are passed over without consuming a tick.
            if !backend.online() {
                continue;
            }

            ring.wc = ring.wc.wrapping_add(1);
            if ring.wc == 0 || ring.wc >= u64::from(backend.weight()) {
                ring.cursor = (idx + 1) % len;
                ring.wc = 0;
            }
            return Ok(backend);
        }

        Err(SelectError::NoValidServers)
    }
}
