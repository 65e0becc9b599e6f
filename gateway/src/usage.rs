//! Per-session token usage cache.
//!
//! Bounded, sharded, last-write-wins mapping from session id to the most
//! recent usage record seen on that session. Reads clone out under a
//! short per-shard lock; writes touch exactly one shard.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use relay_protocol::Usage;

const SHARD_COUNT: usize = 16;

/// Default total capacity across all shards.
pub const DEFAULT_CAPACITY: usize = 4096;

pub struct UsageCache {
    shards: Vec<Mutex<LruCache<String, Usage>>>,
}

impl UsageCache {
    pub fn new(capacity: usize) -> Self {
        let per_shard =
            NonZeroUsize::new(capacity / SHARD_COUNT).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self { shards }
    }

    fn shard(&self, session_id: &str) -> &Mutex<LruCache<String, Usage>> {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in session_id.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash as usize) % SHARD_COUNT]
    }

    /// Record the latest usage for a session. Last write wins.
    pub fn put(&self, session_id: &str, usage: Usage) {
        self.shard(session_id)
            .lock()
            .put(session_id.to_string(), usage);
    }

    /// Latest usage for a session, if any. Refreshes LRU recency.
    pub fn get(&self, session_id: &str) -> Option<Usage> {
        self.shard(session_id).lock().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u32, output: u32) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Usage::default()
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = UsageCache::default();
        cache.put("sess-1", usage(10, 20));
        let got = cache.get("sess-1").unwrap();
        assert_eq!(got.input_tokens, 10);
        assert_eq!(got.output_tokens, 20);
        assert!(cache.get("sess-2").is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let cache = UsageCache::default();
        cache.put("sess", usage(1, 1));
        cache.put("sess", usage(5, 9));
        assert_eq!(cache.get("sess").unwrap().output_tokens, 9);
    }

    #[test]
    fn test_capacity_bounds_entries() {
        // 16 shards, capacity 16 => one entry per shard.
        let cache = UsageCache::new(16);
        for i in 0..500 {
            cache.put(&format!("sess-{i}"), usage(i, i));
        }
        assert!(cache.len() <= 16);
    }

    #[test]
    fn test_eviction_is_lru_within_shard() {
        let cache = UsageCache::new(SHARD_COUNT * 2);
        // Force two keys into the same shard by brute force.
        let mut same_shard = Vec::new();
        let probe = cache.shard("anchor") as *const _;
        same_shard.push("anchor".to_string());
        for i in 0..10_000 {
            let key = format!("k{i}");
            if std::ptr::eq(cache.shard(&key), probe) {
                same_shard.push(key);
                if same_shard.len() == 3 {
                    break;
                }
            }
        }
        assert_eq!(same_shard.len(), 3, "failed to find colliding keys");

        cache.put(&same_shard[0], usage(0, 0));
        cache.put(&same_shard[1], usage(1, 1));
        // Touch the first so the second becomes least-recently-used.
        cache.get(&same_shard[0]);
        cache.put(&same_shard[2], usage(2, 2));

        assert!(cache.get(&same_shard[0]).is_some());
        assert!(cache.get(&same_shard[1]).is_none());
        assert!(cache.get(&same_shard[2]).is_some());
    }
}
