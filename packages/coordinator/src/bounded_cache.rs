//! Bounded cache keyed by 32-byte hashes with TTL and max-size eviction.
//!
//! Holds relay receipts by intent hash so repeated submissions of the same
//! intent are answered locally. Memory stays flat under long runtimes:
//! each entry is a hash, a small receipt and an `Instant`, so the default
//! 10k entries stay well under 2 MB.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_RECEIPT_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_RECEIPT_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are invisible to `get` and dropped on insert.
pub struct BoundedCache<T> {
    map: HashMap<[u8; 32], (T, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<T: Clone> BoundedCache<T> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<T> {
        self.map
            .get(hash)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(value, _)| value.clone())
    }

    pub fn insert(&mut self, hash: [u8; 32], value: T) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.map.retain(|_, (_, at)| now.duration_since(*at) < ttl);

        if !self.map.contains_key(&hash) {
            while self.map.len() >= self.max_size {
                let oldest = self
                    .map
                    .iter()
                    .min_by_key(|(_, (_, at))| *at)
                    .map(|(h, _)| *h);
                match oldest {
                    Some(h) => {
                        self.map.remove(&h);
                    }
                    None => break,
                }
            }
        }
        self.map.insert(hash, (value, now));
    }

    pub fn remove(&mut self, hash: &[u8; 32]) -> Option<T> {
        self.map.remove(hash).map(|(value, _)| value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
