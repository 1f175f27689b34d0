//! Read-through cache for repository search outcomes.
//!
//! Keys are sha256 hashes of `{query, strategy, repositories, user_id}`.
//! Writes are last-writer-wins; each entry carries its own TTL.

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;
use sha2::{Digest, Sha256};

use repoqa_shared::{SearchOutcome, SearchStrategy};

/// Injected cache collaborator.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Option<SearchOutcome>;
    fn put(&self, key: &str, value: SearchOutcome, ttl: Duration);
}

/// Compute the cache key for a search.
pub fn cache_key(
    query: &str,
    strategy: SearchStrategy,
    repositories: &[String],
    user_id: &str,
) -> String {
    let mut repos: Vec<&str> = repositories.iter().map(String::as_str).collect();
    repos.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_lowercase().as_bytes());
    hasher.update(b"\0");
    hasher.update(strategy.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(repos.join(",").as_bytes());
    hasher.update(b"\0");
    hasher.update(user_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
struct Entry {
    outcome: SearchOutcome,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-memory [`ResultCache`] backed by moka.
pub struct MokaResultCache {
    cache: Cache<String, Entry>,
}

impl MokaResultCache {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl ResultCache for MokaResultCache {
    fn get(&self, key: &str) -> Option<SearchOutcome> {
        self.cache.get(key).map(|entry| entry.outcome)
    }

    fn put(&self, key: &str, value: SearchOutcome, ttl: Duration) {
        self.cache.insert(
            key.to_string(),
            Entry {
                outcome: value,
                ttl,
            },
        );
    }
}
