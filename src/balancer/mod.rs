mod consistent_hash;
mod least_conn;
mod round_robin;

pub use consistent_hash::{ConsistentHash, KeyExtractor};
pub use least_conn::LeastConn;
pub use round_robin::RoundRobin;

use crate::config::{HashKey, StrategyKind, UpstreamConfig};
use crate::upstream::Backend;
use anyhow::anyhow;
use hyper::http::request::Parts;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no valid servers")]
    NoValidServers,
    #[error("can't get hashing key: {0}")]
    Key(anyhow::Error),
}

/// Selection policy over a fixed backend set.
///
/// `set_backends` rebuilds internal state and is called once, by the owning
/// upstream at construction; it is not expected to race with `select`.
/// `select` may be called from any number of request tasks concurrently and
/// must only ever return a backend that was online at the time of the check.
pub trait Strategy: Send + Sync {
    fn set_backends(&self, backends: &[Arc<Backend>]);

    fn select(&self, head: &Parts) -> Result<Arc<Backend>, SelectError>;
}

/// Builds the strategy a config asks for.
pub fn from_config(config: &UpstreamConfig) -> Box<dyn Strategy> {
    match config.strategy {
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::LeastConn => Box::new(LeastConn::new()),
        StrategyKind::ConsistentHash => Box::new(ConsistentHash::with_params(
            key_extractor(&config.hash_key),
            config.ketama_points,
            config.backup_count,
        )),
    }
}

/// Builds the hashing-key extractor for consistent hashing: the request URI
/// (path and query), or a named request header.
pub fn key_extractor(source: &HashKey) -> KeyExtractor {
    match source {
        HashKey::Uri => Arc::new(|head: &Parts| {
            Ok(head
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string())
        }),
        HashKey::Header(name) => {
            let name = name.clone();
            Arc::new(move |head: &Parts| {
                let value = head
                    .headers
                    .get(&name)
                    .ok_or_else(|| anyhow!("request has no '{name}' header"))?;
                let value = value
                    .to_str()
                    .map_err(|_| anyhow!("'{name}' header is not valid UTF-8"))?;
                Ok(value.to_string())
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::head;
    use super::*;

    #[test]
    fn test_uri_key_extractor() {
        let extract = key_extractor(&HashKey::Uri);
        assert_eq!(extract(&head("http://127.0.0.1/a/b")).unwrap(), "/a/b");
        assert_eq!(
            extract(&head("http://127.0.0.1/a/b?x=1")).unwrap(),
            "/a/b?x=1"
        );
    }

    #[test]
    fn test_header_key_extractor() {
        let extract = key_extractor(&HashKey::Header("x-session".to_string()));

        let mut parts = head("http://127.0.0.1/");
        parts.headers.insert("x-session", "abc123".parse().unwrap());
        assert_eq!(extract(&parts).unwrap(), "abc123");

        let missing = head("http://127.0.0.1/");
        assert!(extract(&missing).is_err());
    }
}
