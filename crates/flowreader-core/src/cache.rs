//! Response Cache (C9) and the embedding cache it shares its shape with.
//!
//! A concurrent, content-addressed map: a `DashMap` of live entries, an LRU
//! order tracked under a `parking_lot::Mutex` (writes are infrequent relative
//! to reads, so a single lock around the order list is cheap), and
//! single-flight dedup keyed by the same fingerprint used for storage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use crate::embedding::cosine_similarity;
use crate::llm::ModelTier;

/// The tuple of inputs that uniquely determines a cacheable completion.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub user_id: String,
    pub book_id: uuid::Uuid,
    pub intent: String,
    pub normalized_query: String,
    pub model_tier: ModelTier,
    pub context_signature: String,
}

impl Fingerprint {
    pub fn key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update(self.book_id.as_bytes());
        hasher.update(self.intent.as_bytes());
        hasher.update(self.normalized_query.as_bytes());
        hasher.update(match self.model_tier {
            ModelTier::Primary => b"primary" as &[u8],
            ModelTier::CostOptimized => b"cost-optimized",
        });
        hasher.update(self.context_signature.as_bytes());
        hasher.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Exact,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct ResponseCacheEntry {
    pub content: String,
    pub tokens: u32,
    pub cost_usd: f64,
    pub query_embedding: Vec<f32>,
    pub context_signature: String,
    created_at: Instant,
}

struct PendingBuild {
    notify: Arc<Notify>,
    result: Mutex<Option<ResponseCacheEntry>>,
}

/// LRU-bounded, TTL-expiring response cache with two-phase lookup (exact
/// fingerprint, then semantic similarity) and single-flight dedup.
pub struct ResponseCache {
    entries: DashMap<[u8; 32], ResponseCacheEntry>,
    order: Mutex<VecDeque<[u8; 32]>>,
    in_flight: DashMap<[u8; 32], Arc<PendingBuild>>,
    max_entries: usize,
    ttl: Duration,
    similarity_threshold: f32,
    min_quality_to_cache: f32,
    hits: AtomicU64,
    misses: AtomicU64,
}

pub enum Lookup {
    Hit {
        entry: ResponseCacheEntry,
        source: CacheSource,
    },
    Miss,
}

impl ResponseCache {
    pub fn new(
        max_entries: usize,
        ttl: Duration,
        similarity_threshold: f32,
        min_quality_to_cache: f32,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            max_entries,
            ttl,
            similarity_threshold,
            min_quality_to_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, entry: &ResponseCacheEntry) -> bool {
        entry.created_at.elapsed() > self.ttl
    }

    /// Two-phase lookup: exact fingerprint hit, then semantic similarity
    /// against cached query embeddings sharing the same context signature.
    pub fn lookup(&self, fingerprint: &Fingerprint, query_embedding: &[f32]) -> Lookup {
        let key = fingerprint.key();
        if let Some(entry) = self.entries.get(&key) {
            if !self.is_expired(&entry) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Lookup::Hit {
                    entry: entry.clone(),
                    source: CacheSource::Exact,
                };
            }
        }

        for candidate in self.entries.iter() {
            if candidate.context_signature != fingerprint.context_signature {
                continue;
            }
            if self.is_expired(&candidate) {
                continue;
            }
            let sim = cosine_similarity(query_embedding, &candidate.query_embedding);
            if sim >= self.similarity_threshold {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Lookup::Hit {
                    entry: candidate.clone(),
                    source: CacheSource::Semantic,
                };
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Lookup::Miss
    }

    /// Registers this fingerprint as under computation; concurrent callers
    /// for the same key await the first caller's result instead of issuing
    /// their own LLM call.
    pub fn begin_single_flight(&self, fingerprint: &Fingerprint) -> SingleFlightHandle {
        let key = fingerprint.key();
        let mut created = false;
        let pending = self
            .in_flight
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(PendingBuild {
                    notify: Arc::new(Notify::new()),
                    result: Mutex::new(None),
                })
            })
            .clone();
        SingleFlightHandle {
            key,
            pending,
            is_leader: created,
        }
    }

    pub async fn await_in_flight(&self, handle: &SingleFlightHandle) -> Option<ResponseCacheEntry> {
        loop {
            if let Some(result) = handle.pending.result.lock().clone() {
                return Some(result);
            }
            handle.pending.notify.notified().await;
        }
    }

    /// Writes occur only on successful completions whose quality score meets
    /// the minimum gate (§4.9).
    pub fn complete_single_flight(
        &self,
        handle: SingleFlightHandle,
        entry: Option<(ResponseCacheEntry, f32)>,
    ) {
        if let Some((entry, quality_score)) = entry {
            if quality_score >= self.min_quality_to_cache {
                self.insert(handle.key, entry.clone());
            }
            *handle.pending.result.lock() = Some(entry);
        }
        handle.pending.notify.notify_waiters();
        self.in_flight.remove(&handle.key);
    }

    fn insert(&self, key: [u8; 32], mut entry: ResponseCacheEntry) {
        entry.created_at = Instant::now();
        self.entries.insert(key, entry);
        let mut order = self.order.lock();
        order.push_back(key);
        while order.len() > self.max_entries {
            if let Some(evicted) = order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

pub struct SingleFlightHandle {
    key: [u8; 32],
    pending: Arc<PendingBuild>,
    is_leader: bool,
}

impl SingleFlightHandle {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

impl ResponseCacheEntry {
    pub fn new(
        content: String,
        tokens: u32,
        cost_usd: f64,
        query_embedding: Vec<f32>,
        context_signature: String,
    ) -> Self {
        Self {
            content,
            tokens,
            cost_usd,
            query_embedding,
            context_signature,
            created_at: Instant::now(),
        }
    }
}

/// Per-text embedding cache (TTL ~1h), deduplicating repeated inputs before
/// they reach the embedding provider (§4.6).
pub struct EmbeddingCache {
    entries: DashMap<[u8; 32], (Vec<f32>, Instant)>,
    order: Mutex<VecDeque<[u8; 32]>>,
    max_entries: usize,
    ttl: Duration,
}

impl EmbeddingCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries,
            ttl,
        }
    }

    fn key_for(text: &str) -> [u8; 32] {
        Sha256::digest(text.as_bytes()).into()
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::key_for(text);
        self.entries.get(&key).and_then(|entry| {
            if entry.1.elapsed() > self.ttl {
                None
            } else {
                Some(entry.0.clone())
            }
        })
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let key = Self::key_for(text);
        self.entries.insert(key, (vector, Instant::now()));
        let mut order = self.order.lock();
        order.push_back(key);
        while order.len() > self.max_entries {
            if let Some(evicted) = order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(query: &str) -> Fingerprint {
        Fingerprint {
            user_id: "u1".into(),
            book_id: uuid::Uuid::nil(),
            intent: "ask".into(),
            normalized_query: query.into(),
            model_tier: ModelTier::Primary,
            context_signature: "ctx-a".into(),
        }
    }

    #[test]
    fn exact_hit_after_insert() {
        let cache = ResponseCache::new(10, Duration::from_secs(60), 0.95, 0.6);
        let f = fp("what happens next");
        cache.insert(
            f.key(),
            ResponseCacheEntry::new("answer".into(), 10, 0.001, vec![1.0, 0.0], "ctx-a".into()),
        );
        match cache.lookup(&f, &[1.0, 0.0]) {
            Lookup::Hit { source, .. } => assert_eq!(source, CacheSource::Exact),
            Lookup::Miss => panic!("expected a hit"),
        }
    }

    #[test]
    fn semantic_hit_requires_matching_context_signature() {
        let cache = ResponseCache::new(10, Duration::from_secs(60), 0.95, 0.6);
        let stored = fp("what happens next");
        cache.insert(
            stored.key(),
            ResponseCacheEntry::new("answer".into(), 10, 0.001, vec![1.0, 0.0], "ctx-a".into()),
        );
        let mut different_context = fp("what happens next chapter two");
        different_context.context_signature = "ctx-b".into();
        assert!(matches!(
            cache.lookup(&different_context, &[1.0, 0.0]),
            Lookup::Miss
        ));
    }

    #[test]
    fn eviction_respects_max_entries() {
        let cache = ResponseCache::new(2, Duration::from_secs(60), 0.95, 0.6);
        for i in 0..3 {
            let f = fp(&format!("query-{i}"));
            cache.insert(
                f.key(),
                ResponseCacheEntry::new(format!("a{i}"), 1, 0.0, vec![i as f32], "ctx-a".into()),
            );
        }
        assert_eq!(cache.entries.len(), 2);
    }
}
