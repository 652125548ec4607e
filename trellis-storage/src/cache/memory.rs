//! In-process TTL cache.
//!
//! Expired entries are treated as absent on read and evicted lazily, or in
//! bulk through [`InMemoryCacheClient::purge_expired`]. Time comes from
//! `tokio::time::Instant`, so paused-clock tests can step past a TTL.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use trellis_core::{CacheError, CacheResult};

use super::traits::{CacheClient, CacheStats};

/// Lifecycle state of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Within its TTL.
    Fresh,
    /// TTL elapsed; eligible for eviction.
    Stale,
}

/// One cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: Duration,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
            inserted_at: Instant::now(),
        }
    }

    /// State of this entry as of `now`.
    pub fn state(&self, now: Instant) -> EntryState {
        if now.saturating_duration_since(self.inserted_at) >= self.ttl {
            EntryState::Stale
        } else {
            EntryState::Fresh
        }
    }
}

/// Thread-safe in-memory [`CacheClient`].
#[derive(Debug, Default)]
pub struct InMemoryCacheClient {
    entries: RwLock<HashMap<String, CacheEntry>>,
    stats: RwLock<CacheStats>,
}

impl InMemoryCacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every stale entry, returning how many were removed.
    pub fn purge_expired(&self) -> CacheResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let before = entries.len();
        entries.retain(|_, entry| entry.state(now) == EntryState::Fresh);
        Ok((before - entries.len()) as u64)
    }

    /// Keys currently held, fresh or stale, sorted.
    pub fn keys(&self) -> CacheResult<Vec<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) -> CacheResult<()> {
        let mut stats = self.stats.write().map_err(|_| poisoned())?;
        update(&mut stats);
        Ok(())
    }
}

#[async_trait]
impl CacheClient for InMemoryCacheClient {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let found = {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            entries.get(key).map(|entry| (entry.state(now), entry.value.clone()))
        };

        match found {
            Some((EntryState::Fresh, value)) => {
                self.record(|s| s.hits += 1)?;
                Ok(Some(value))
            }
            Some((EntryState::Stale, _)) => {
                let mut entries = self.entries.write().map_err(|_| poisoned())?;
                // Re-check: a concurrent set may have refreshed it.
                if entries.get(key).map(|e| e.state(now)) == Some(EntryState::Stale) {
                    entries.remove(key);
                }
                drop(entries);
                self.record(|s| s.misses += 1)?;
                Ok(None)
            }
            None => {
                self.record(|s| s.misses += 1)?;
                Ok(None)
            }
        }
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        {
            let mut entries = self.entries.write().map_err(|_| poisoned())?;
            entries.insert(key.to_string(), CacheEntry::new(key, value, ttl));
        }
        self.record(|s| s.sets += 1)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let removed = {
            let mut entries = self.entries.write().map_err(|_| poisoned())?;
            entries.remove(key).is_some()
        };
        if removed {
            self.record(|s| s.invalidations += 1)?;
        }
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let matcher = glob_to_regex(pattern)?;
        let removed = {
            let mut entries = self.entries.write().map_err(|_| poisoned())?;
            let before = entries.len();
            entries.retain(|key, _| !matcher.is_match(key));
            (before - entries.len()) as u64
        };
        self.record(|s| s.invalidations += removed)?;
        Ok(removed)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count = self.entries.read().map_err(|_| poisoned())?.len() as u64;
        let stats = self.stats.read().map_err(|_| poisoned())?;
        Ok(CacheStats {
            entry_count,
            ..stats.clone()
        })
    }
}

fn poisoned() -> CacheError {
    CacheError::Backend {
        reason: "cache lock poisoned".to_string(),
    }
}

/// Translate a Redis-style glob into an anchored regex.
///
/// Supports `*`, `?` and backslash escapes. Everything else is literal.
/// Wildcards match any character, newlines included, as Redis globs do.
pub fn glob_to_regex(pattern: &str) -> CacheResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 12);
    out.push_str("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => {
                    return Err(CacheError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "trailing escape".to_string(),
                    })
                }
            },
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
