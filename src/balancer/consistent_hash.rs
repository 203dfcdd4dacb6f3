use super::{SelectError, Strategy};
use crate::upstream::Backend;
use hyper::http::request::Parts;
use parking_lot::Mutex;
use std::sync::Arc;

pub const DEFAULT_KETAMA_POINTS: u32 = 180;
pub const DEFAULT_BACKUP_COUNT: u32 = 2;

/// Extracts the hashing key for a request. Supplied by the caller; the
/// request URI and header extractors in this crate are built by
/// [`super::key_extractor`].
pub type KeyExtractor = Arc<dyn Fn(&Parts) -> anyhow::Result<String> + Send + Sync>;

/// Ketama-style consistent hashing, wire-compatible with nginx's
/// `hash ... consistent` upstreams.
///
/// Each backend contributes `weight * ketama_points` points to a ring sorted
/// by CRC32 value; a request's key hashes onto the ring and walks forward
/// over up to `backup_count` points looking for an online backend. Adding or
/// removing a backend only remaps the keys that landed on its points.
pub struct ConsistentHash {
    ring: Mutex<HashRing>,
    ketama_points: u32,
    backup_count: u32,
    key_fn: KeyExtractor,
}

struct HashRing {
    points: Vec<KetamaPoint>,
    backup_count: u32,
}

struct KetamaPoint {
    hash: u32,
    backend: Arc<Backend>,
}

impl ConsistentHash {
    pub fn new(key_fn: KeyExtractor) -> Self {
        Self::with_params(key_fn, 0, 0)
    }

    /// Zero for either parameter means "use the default", resolved when the
    /// backend set is installed.
    pub fn with_params(key_fn: KeyExtractor, ketama_points: u32, backup_count: u32) -> Self {
        Self {
            ring: Mutex::new(HashRing {
                points: Vec::new(),
                backup_count: DEFAULT_BACKUP_COUNT,
            }),
            ketama_points,
            backup_count,
            key_fn,
        }
    }
}

/// Lowest index whose point hash is >= `hash`; `points.len()` when the hash
/// lies beyond the last point, which callers wrap back to index 0.
fn find_point(points: &[KetamaPoint], hash: u32) -> usize {
    match points.binary_search_by(|point| point.hash.cmp(&hash)) {
        Ok(idx) | Err(idx) => idx,
    }
}

impl Strategy for ConsistentHash {
    fn set_backends(&self, backends: &[Arc<Backend>]) {
        let ketama_points = match self.ketama_points {
            0 => DEFAULT_KETAMA_POINTS,
            n => n,
        };
        let backup_count = match self.backup_count {
            0 => DEFAULT_BACKUP_COUNT,
            n => n,
        };

        let mut points = Vec::new();
        for backend in backends {
            let count = u32::from(backend.weight()) * ketama_points;
            let mut prev: u32 = 0;
            for _ in 0..count {
                // Point seed is host ++ "\0" (two literal bytes) ++ port ++
                // previous hash in decimal; the byte sequence is fixed by the
                // ketama ring format and must not change.
                let seed = format!("{}\\0{}{}", backend.host(), backend.port(), prev);
                let hash = crc32fast::hash(seed.as_bytes());
                points.push(KetamaPoint {
                    hash,
                    backend: Arc::clone(backend),
                });
                prev = hash;
            }
        }

        points.sort_by_key(|point| point.hash);
        // On a hash collision the first backend in scan order keeps the point.
        points.dedup_by_key(|point| point.hash);

        *self.ring.lock() = HashRing {
            points,
            backup_count,
        };
    }

    fn select(&self, head: &Parts) -> Result<Arc<Backend>, SelectError> {
        let key = (self.key_fn)(head).map_err(SelectError::Key)?;

        let ring = self.ring.lock();
        if ring.points.is_empty() {
            return Err(SelectError::NoValidServers);
        }

        let start = find_point(&ring.points, crc32fast::hash(key.as_bytes()));
        for i in 0..ring.backup_count as usize {
            let point = &ring.points[(start + i) % ring.points.len()];
            if point.backend.online() {
                return Ok(Arc::clone(&point.backend));
            }
        }

        Err(SelectError::NoValidServers)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::head;
    use super::*;
    use crate::balancer::key_extractor;
    use crate::config::HashKey;
    use anyhow::anyhow;

    fn uri_key() -> KeyExtractor {
        key_extractor(&HashKey::Uri)
    }

    fn make_backends(count: usize) -> Vec<Arc<Backend>> {
        (0..count)
            .map(|i| {
                Arc::new(Backend::new(&format!("http://127.0.0.1:{}", 8000 + i), 1).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_defaults_applied_lazily() {
        let strategy = ConsistentHash::new(uri_key());
        strategy.set_backends(&make_backends(3));

        let ring = strategy.ring.lock();
        assert_eq!(ring.backup_count, DEFAULT_BACKUP_COUNT);
        // 3 backends, weight 1, 180 points each, minus any CRC32 collisions.
        assert!(ring.points.len() <= 540);
        assert!(ring.points.len() > 500);
    }

    #[test]
    fn test_points_strictly_increasing() {
        let strategy = ConsistentHash::new(uri_key());
        strategy.set_backends(&make_backends(3));

        let ring = strategy.ring.lock();
        for pair in ring.points.windows(2) {
            assert!(pair[0].hash < pair[1].hash);
        }
    }

    #[test]
    fn test_weight_scales_point_count() {
        let backends = vec![
            Arc::new(Backend::new("http://127.0.0.1:8000", 2).unwrap()),
            Arc::new(Backend::new("http://127.0.0.1:8001", 1).unwrap()),
        ];
        let strategy = ConsistentHash::with_params(uri_key(), 10, 2);
        strategy.set_backends(&backends);

        let ring = strategy.ring.lock();
        let heavy = ring
            .points
            .iter()
            .filter(|p| p.backend.port() == 8000)
            .count();
        let light = ring
            .points
            .iter()
            .filter(|p| p.backend.port() == 8001)
            .count();
        assert_eq!(heavy, 20);
        assert_eq!(light, 10);
    }

    #[test]
    fn test_selection_is_stable() {
        let strategy = ConsistentHash::new(uri_key());
        strategy.set_backends(&make_backends(3));

        for uri in ["http://127.0.0.1/a/b", "http://127.0.0.1/z/e"] {
            let first = strategy.select(&head(uri)).unwrap();
            let second = strategy.select(&head(uri)).unwrap();
            assert_eq!(first.to_string(), second.to_string());
        }
    }

    #[test]
    fn test_falls_back_past_offline_primary() {
        let strategy = ConsistentHash::new(uri_key());
        strategy.set_backends(&make_backends(3));
        let request = head("http://127.0.0.1/a/b");

        let primary = strategy.select(&request).unwrap();
        primary.set_online(false);

        // The walk past the primary point must agree with a by-hand scan of
        // the ring for the same key.
        let expected = {
            let ring = strategy.ring.lock();
            let start = find_point(&ring.points, crc32fast::hash(b"/a/b"));
            (0..ring.backup_count as usize).find_map(|i| {
                let point = &ring.points[(start + i) % ring.points.len()];
                point.backend.online().then(|| point.backend.to_string())
            })
        };

        match expected {
            Some(addr) => {
                let picked = strategy.select(&request).unwrap();
                assert_eq!(picked.to_string(), addr);
                assert_ne!(picked.to_string(), primary.to_string());
            }
            None => assert!(matches!(
                strategy.select(&request),
                Err(SelectError::NoValidServers)
            )),
        }
    }

    #[test]
    fn test_all_offline_fails() {
        let backends = make_backends(2);
        for backend in &backends {
            backend.set_online(false);
        }
        let strategy = ConsistentHash::new(uri_key());
        strategy.set_backends(&backends);

        assert!(matches!(
            strategy.select(&head("http://127.0.0.1/a/b")),
            Err(SelectError::NoValidServers)
        ));
    }

    #[test]
    fn test_key_extraction_failure_surfaces() {
        let strategy =
            ConsistentHash::new(Arc::new(|_: &Parts| Err(anyhow!("no key material"))));
        strategy.set_backends(&make_backends(2));

        assert!(matches!(
            strategy.select(&head("http://127.0.0.1/")),
            Err(SelectError::Key(_))
        ));
    }

    #[test]
    fn test_find_point_bounds() {
        let backend = Arc::new(Backend::new("http://127.0.0.1:8000", 1).unwrap());
        let points: Vec<KetamaPoint> = [10u32, 20, 30]
            .iter()
            .map(|&hash| KetamaPoint {
                hash,
                backend: Arc::clone(&backend),
            })
            .collect();

        assert_eq!(find_point(&points, 5), 0);
        assert_eq!(find_point(&points, 10), 0);
        assert_eq!(find_point(&points, 11), 1);
        assert_eq!(find_point(&points, 30), 2);
        // Past the last point the caller wraps modulo len, back to 0.
        assert_eq!(find_point(&points, 31), 3);
    }

    #[test]
    fn test_empty_ring_fails() {
        let strategy = ConsistentHash::new(uri_key());
        strategy.set_backends(&[]);
        assert!(strategy.select(&head("http://127.0.0.1/")).is_err());
    }
}
