mod backend;

pub use backend::{AddressError, Backend, ConnectionGuard, Scheme};

use crate::balancer::{self, SelectError, Strategy};
use crate::config::UpstreamConfig;
use anyhow::{Context, Result};
use hyper::http::request::Parts;
use std::sync::Arc;

/// The backend set plus the strategy that selects among them.
///
/// Construction binds the two: the strategy sees the backend list exactly
/// once, in list order. The set is immutable afterwards; changing membership
/// means building a new upstream.
pub struct Upstream {
    backends: Vec<Arc<Backend>>,
    strategy: Box<dyn Strategy>,
}

impl Upstream {
    pub fn new(backends: Vec<Arc<Backend>>, strategy: Box<dyn Strategy>) -> Self {
        strategy.set_backends(&backends);
        Self { backends, strategy }
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let mut backends = Vec::with_capacity(config.servers.len());
        for entry in &config.servers {
            let backend = Backend::new(&entry.address, entry.weight)
                .with_context(|| format!("bad upstream server '{}'", entry.address))?;
            backend.set_max_errors(entry.max_errors);
            backend.set_errors_window(entry.errors_window_secs);
            backends.push(Arc::new(backend));
        }

        Ok(Self::new(backends, balancer::from_config(config)))
    }

    /// Asks the strategy for an online backend to serve this request.
    #[inline]
    pub fn select(&self, head: &Parts) -> Result<Arc<Backend>, SelectError> {
        self.strategy.select(head)
    }

    /// Snapshot of the backend set.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.clone()
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }
}
