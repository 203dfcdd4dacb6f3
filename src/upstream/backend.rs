use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_ERRORS: u64 = 1;
const DEFAULT_ERRORS_WINDOW_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid backend address '{0}': expected http(s)://host:port")]
    Malformed(String),
    #[error("invalid port in backend address '{0}'")]
    Port(String),
}

/// Protocol the proxy speaks to a backend. No TLS is terminated here; the
/// scheme only shapes the outbound URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream server endpoint.
///
/// Identity (scheme, host, port) is fixed at construction and read without
/// synchronization. Everything else is an atomic touched concurrently by
/// request tasks and the health monitor.
pub struct Backend {
    scheme: Scheme,
    host: String,
    port: u16,
    weight: AtomicU8,
    max_errors: AtomicU64,
    errors_window_secs: AtomicU64,
    online: AtomicBool,
    errors: AtomicU64,
    connections: AtomicUsize,
}

impl Backend {
    /// Parses `http(s)://host:port` into a backend. A weight of 0 is
    /// promoted to 1.
    pub fn new(addr: &str, weight: u8) -> Result<Self, AddressError> {
        let (scheme, rest) = if let Some(rest) = addr.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = addr.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(AddressError::Malformed(addr.to_string()));
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::Malformed(addr.to_string()))?;

        // Bracketed IPv6 hosts keep their brackets off the identity.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddressError::Malformed(addr.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::Port(addr.to_string()))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            weight: AtomicU8::new(weight.max(1)),
            max_errors: AtomicU64::new(DEFAULT_MAX_ERRORS),
            errors_window_secs: AtomicU64::new(DEFAULT_ERRORS_WINDOW_SECS),
            online: AtomicBool::new(true),
            errors: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn weight(&self) -> u8 {
        self.weight.load(Ordering::Relaxed)
    }

    /// A weight of 0 is promoted to 1, as at construction.
    pub fn set_weight(&self, weight: u8) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn max_errors(&self) -> u64 {
        self.max_errors.load(Ordering::Relaxed)
    }

    /// Errors tolerated per window before the monitor takes the backend
    /// offline. 0 disables monitoring for this backend.
    pub fn set_max_errors(&self, max: u64) {
        self.max_errors.store(max, Ordering::Relaxed);
    }

    #[inline]
    pub fn errors_window(&self) -> Duration {
        Duration::from_secs(self.errors_window_secs.load(Ordering::Relaxed))
    }

    /// Length of the error-accounting window in seconds. 0 disables
    /// monitoring for this backend.
    pub fn set_errors_window(&self, secs: u64) {
        self.errors_window_secs.store(secs, Ordering::Relaxed);
    }

    #[inline]
    pub fn online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    #[inline]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Counts a failed or 5xx forward against this backend. Never flips
    /// `online`; the monitor decides that at the window tick.
    #[inline]
    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Drains the error counter, returning the count accumulated since the
    /// previous drain. Used by the window tick.
    #[inline]
    pub fn take_errors(&self) -> u64 {
        self.errors.swap(0, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn incr_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decr_connections(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("addr", &self.to_string())
            .field("weight", &self.weight())
            .field("online", &self.online())
            .field("connections", &self.connections())
            .field("errors", &self.errors())
            .finish()
    }
}

/// Holds the in-flight connection count up for the lifetime of a forward
/// attempt. Dropping the guard decrements, so the pair stays balanced even
/// when the request future is cancelled mid-forward.
pub struct ConnectionGuard<'a> {
    backend: &'a Backend,
}

impl<'a> ConnectionGuard<'a> {
    pub fn new(backend: &'a Backend) -> Self {
        backend.incr_connections();
        Self { backend }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.backend.decr_connections();
    }
}
