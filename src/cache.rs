//! Short-lived result cache for repeated queries.
//!
//! Only the conversation-independent part of a query is cached: the
//! reranked chunks and the stats gathered while producing them. Carry-over
//! merging and citation assembly always run fresh, so a cache hit inside a
//! conversation still advances its turn.

use std::time::Duration;

use moka::sync::Cache;
use sha2::{Digest, Sha256};

use context_relay_core::analytics::QueryStats;
use context_relay_core::bundle::{ContextChunk, QueryOptions};
use context_relay_core::store::SearchFilters;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
pub struct CachedRetrieval {
    pub chunks: Vec<ContextChunk>,
    pub stats: QueryStats,
}

/// Lowercased, trimmed, single-spaced.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex sha256 of the normalized query alone, as recorded by analytics.
pub fn query_hash(query: &str) -> String {
    hex::encode(Sha256::digest(normalize_query(query).as_bytes()))
}

/// Key covering everything that changes the pre-conversation result.
pub fn cache_key(query: &str, filters: &SearchFilters, options: &QueryOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0u8]);
    hasher.update(filters.persona_id.as_bytes());
    hasher.update([0u8]);
    if let Some(ids) = &filters.document_ids {
        let mut ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update([b',']);
        }
    } else {
        hasher.update(b"*");
    }
    hasher.update([0u8]);
    if let Ok(opts) = serde_json::to_vec(options) {
        hasher.update(&opts);
    }
    hex::encode(hasher.finalize())
}

pub struct ResultCache {
    inner: Option<Cache<String, CachedRetrieval>>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .build()
        });
        Self { inner }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn get(&self, key: &str) -> Option<CachedRetrieval> {
        self.inner.as_ref()?.get(key)
    }

    pub fn insert(&self, key: String, value: CachedRetrieval) {
        if let Some(cache) = &self.inner {
            cache.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(ids: Option<&[&str]>) -> SearchFilters {
        SearchFilters {
            persona_id: "p".to_string(),
            document_ids: ids.map(|v| v.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn key_ignores_case_and_spacing() {
        let opts = QueryOptions::default();
        assert_eq!(
            cache_key("  What is  OpenAI ", &filters(None), &opts),
            cache_key("what is openai", &filters(None), &opts)
        );
    }

    #[test]
    fn key_covers_filters_and_options() {
        let opts = QueryOptions::default();
        let base = cache_key("q", &filters(None), &opts);
        assert_ne!(base, cache_key("q", &filters(Some(&["d1"])), &opts));
        assert_eq!(
            cache_key("q", &filters(Some(&["d2", "d1"])), &opts),
            cache_key("q", &filters(Some(&["d1", "d2"])), &opts)
        );
        let fast = QueryOptions {
            use_hyde: false,
            ..Default::default()
        };
        assert_ne!(base, cache_key("q", &filters(None), &fast));
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ResultCache::new(&CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.insert(
            "k".to_string(),
            CachedRetrieval {
                chunks: Vec::new(),
                stats: QueryStats::default(),
            },
        );
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn enabled_cache_returns_inserted_value() {
        let cache = ResultCache::new(&CacheConfig::default());
        cache.insert(
            "k".to_string(),
            CachedRetrieval {
                chunks: Vec::new(),
                stats: QueryStats::default(),
            },
        );
        assert!(cache.get("k").is_some());
        assert_eq!(query_hash("Hello  World"), query_hash("hello world"));
    }
}
