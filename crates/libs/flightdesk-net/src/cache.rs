use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

/// Selects which cached keys an invalidation removes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invalidation {
    Exact(String),
    /// Every key starting with the prefix, e.g. `"GET /airlines"` drops all
    /// cached airline list and detail queries.
    Prefix(String),
    Contains(String),
}

impl Invalidation {
    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Contains(fragment) => key.contains(fragment.as_str()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub keys: Vec<String>,
    pub approximate_size_bytes: usize,
}

/// Key/value store with a TTL per entry.
///
/// Expired entries are never returned: a lookup that finds one evicts it.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_valid(now) => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                log::trace!("cache: evicted expired key={key}");
                None
            }
            None => None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.entries.insert(key.into(), CacheEntry { value, created_at: Instant::now(), ttl });
    }

    /// Removes every matching key and returns how many were dropped.
    pub fn invalidate(&mut self, selector: &Invalidation) -> usize {
        let before = self.entries.len();
        match selector {
            Invalidation::Exact(key) => {
                self.entries.remove(key);
            }
            _ => self.entries.retain(|key, _| !selector.matches(key)),
        }
        let removed = before - self.entries.len();
        if removed > 0 {
            log::debug!("cache: invalidated selector={selector:?} removed={removed}");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops every expired entry without waiting for a lookup to hit it.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        let approximate_size_bytes = self
            .entries
            .iter()
            .map(|(key, entry)| {
                key.len() + serde_json::to_string(&entry.value).map(|raw| raw.len()).unwrap_or(0)
            })
            .sum();
        CacheStats { entry_count: self.entries.len(), keys, approximate_size_bytes }
    }
}
