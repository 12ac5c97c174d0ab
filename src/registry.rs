//! Bounded table of live sessions.
//!
//! The registry never reaches its limit: inserting a key first evicts the least recently used
//! entries until there is room to spare, and hands the evicted keys back so the owner can tear
//! them down properly.

use std::hash::Hash;

use lru::LruCache;

/// Descriptors kept free for listeners, the poller, spill files and logging.
pub const DESCRIPTOR_OVERHEAD: usize = 32;

const DESCRIPTOR_FALLBACK: usize = 1024;

pub struct Registry<K: Hash + Eq> {
    limit: usize,
    // Key to last activity
    entries: LruCache<K, u64>,
}

impl<K> Registry<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 2, "registry limit must be at least 2");

        Self {
            limit,
            entries: LruCache::unbounded(),
        }
    }

    /// Creates a registry sized to the descriptor ceiling of this process.
    pub fn with_descriptor_limit() -> Self {
        let limit = descriptor_ceiling()
            .saturating_sub(DESCRIPTOR_OVERHEAD)
            .max(2);

        log::debug!("session limit {}", limit);

        Self::new(limit)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Adds `key`, evicting least recently used entries so that the table stays below its limit.
    /// Returns the evicted keys, oldest first.
    pub fn insert(&mut self, key: K, now_ms: u64) -> Vec<K> {
        let mut evicted = Vec::new();

        if self.entries.contains(&key) {
            self.entries.put(key, now_ms);
            return evicted;
        }

        while self.entries.len() + 1 >= self.limit {
            match self.entries.pop_lru() {
                Some((old_key, _)) => evicted.push(old_key),
                None => break,
            }
        }

        if !evicted.is_empty() {
            log::warn!("session limit {} reached, evicting {}", self.limit, evicted.len());
        }

        self.entries.put(key, now_ms);

        return evicted;
    }

    /// Marks activity on `key`.
    pub fn touch(&mut self, key: &K, now_ms: u64) {
        if let Some(last_ms) = self.entries.get_mut(key) {
            *last_ms = now_ms;
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.pop(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn last_activity(&self, key: &K) -> Option<u64> {
        self.entries.peek(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_open_files_limit(limits: &str) -> Option<usize> {
    let line = limits.lines().find(|line| line.starts_with("Max open files"))?;
    let soft = line["Max open files".len()..].split_whitespace().next()?;

    if soft == "unlimited" {
        return Some(usize::MAX);
    }

    soft.parse().ok()
}

/// Soft limit on open descriptors, from `/proc/self/limits`.
pub fn descriptor_ceiling() -> usize {
    match std::fs::read_to_string("/proc/self/limits") {
        Ok(limits) => parse_open_files_limit(&limits).unwrap_or(DESCRIPTOR_FALLBACK),
        Err(err) => {
            log::debug!("cannot read descriptor limit: {}", err);
            DESCRIPTOR_FALLBACK
        }
    }
}
