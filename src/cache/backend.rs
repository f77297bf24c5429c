//! Cache storage backends.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::store::StoreError;

/// Key/value storage with TTL and tag sets.
///
/// Implementations must never return an entry past its expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value and add its key to every tag set.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every member of the tag, then the tag set. Returns members deleted.
    async fn invalidate_tag(&self, tag: &str) -> Result<usize, StoreError>;

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, StoreError>;

    /// Remove every entry and tag. Returns entries removed.
    async fn flush(&self) -> Result<usize, StoreError>;
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug)]
struct TagSet {
    keys: HashSet<String>,
    expires_at: Instant,
}

/// In-process backend for single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    tags: DashMap<String, TagSet>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, then prune tag members whose entry is gone.
    /// Empty or expired tag sets are removed. Returns entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.tags.retain(|_, set| {
            set.keys.retain(|key| self.entries.contains_key(key));
            !set.keys.is_empty() && set.expires_at > now
        });
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration, tags: &[String]) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        for tag in tags {
            let mut set = self.tags.entry(tag.clone()).or_insert_with(|| TagSet {
                keys: HashSet::new(),
                expires_at,
            });
            set.keys.insert(key.to_string());
            if expires_at > set.expires_at {
                set.expires_at = expires_at;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, StoreError> {
        let Some((_, set)) = self.tags.remove(tag) else {
            return Ok(0);
        };
        // stale members are tolerated; only count what was actually present
        Ok(set
            .keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(match self.tags.get(tag) {
            Some(set) if set.expires_at > now => set.keys.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn flush(&self) -> Result<usize, StoreError> {
        let removed = self.entries.len();
        self.entries.clear();
        self.tags.clear();
        Ok(removed)
    }
}
