//! Embedding Service (C6).

use std::sync::Arc;

use crate::cache::EmbeddingCache;
use crate::error::AppResult;
use crate::llm::EmbeddingClient;

/// Approximate token count. Production-grade tokenization would use the
/// provider's actual tokenizer; this crate only needs a stable, cheap
/// approximation for windowing and budget enforcement (1 token ≈ 4 chars).
pub fn approx_token_count(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Shared by the response cache's semantic lookup and the retrieval engine's
/// passage dedup; both compare raw embedding vectors the same way.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkWindow {
    pub tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkWindow {
    fn default() -> Self {
        Self {
            tokens: 400,
            overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub ordinal: i32,
    pub content: String,
    pub span_start: i32,
    pub span_end: i32,
}

/// Splits chapter content into bounded-token windows with overlap (§4.7
/// step 6, §9 "bounded-token windows"), approximating tokens by character
/// count so the windowing is cheap and deterministic.
pub fn chunk_text(content: &str, window: ChunkWindow) -> Vec<TextChunk> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let window_chars = window.tokens * 4;
    let overlap_chars = window.overlap_tokens * 4;
    let stride = window_chars.saturating_sub(overlap_chars).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0i32;
    while start < chars.len() {
        let end = (start + window_chars).min(chars.len());
        let slice: String = chars[start..end].iter().collect();
        chunks.push(TextChunk {
            ordinal,
            content: slice,
            span_start: start as i32,
            span_end: end as i32,
        });
        ordinal += 1;
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

pub struct CostAccountingSink {
    inner: Arc<dyn Fn(u32, f64) + Send + Sync>,
}

impl CostAccountingSink {
    pub fn new(f: impl Fn(u32, f64) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn record(&self, tokens: u32, cost: f64) {
        (self.inner)(tokens, cost);
    }

    pub fn noop() -> Self {
        Self::new(|_tokens, _cost| {})
    }
}

/// Batches chunk text, deduplicates against the embedding cache, and calls
/// the external embedding endpoint for the remainder.
pub struct EmbeddingService {
    client: Arc<dyn EmbeddingClient>,
    cache: EmbeddingCache,
    cost_sink: CostAccountingSink,
    max_batch_texts: usize,
}

impl EmbeddingService {
    pub fn new(client: Arc<dyn EmbeddingClient>, cache: EmbeddingCache, cost_sink: CostAccountingSink) -> Self {
        Self {
            client,
            cache,
            cost_sink,
            max_batch_texts: 64,
        }
    }

    /// Embed a single piece of text (e.g. a dialog query), consulting the
    /// cache first.
    pub async fn embed_one(&self, text: &str) -> AppResult<Vec<f32>> {
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached);
        }
        let vectors = self.client.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        let vector = vectors.into_iter().next().unwrap_or_default();
        self.cache.put(text, vector.clone());
        self.cost_sink.record(approx_token_count(text) as u32, 0.0);
        Ok(vector)
    }

    /// Embed many chunks, only calling the provider for cache misses, in
    /// batches bounded by `max_batch_texts`.
    pub async fn embed_many(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        let mut miss_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(cached) = self.cache.get(text) {
                results[i] = Some(cached);
            } else {
                miss_indices.push(i);
                miss_texts.push(text.clone());
            }
        }

        for batch_start in (0..miss_texts.len()).step_by(self.max_batch_texts) {
            let batch_end = (batch_start + self.max_batch_texts).min(miss_texts.len());
            let batch = &miss_texts[batch_start..batch_end];
            let vectors = self.client.embed_batch(batch).await?;
            let mut total_tokens = 0u32;
            for (offset, vector) in vectors.into_iter().enumerate() {
                let text = &batch[offset];
                total_tokens += approx_token_count(text) as u32;
                self.cache.put(text, vector.clone());
                results[miss_indices[batch_start + offset]] = Some(vector);
            }
            self.cost_sink.record(total_tokens, 0.0);
        }

        Ok(results.into_iter().map(|r| r.unwrap_or_default()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_produces_overlapping_dense_windows() {
        let content = "word ".repeat(1000);
        let chunks = chunk_text(&content, ChunkWindow::default());
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].span_start, 0);
        assert!(chunks[1].span_start < chunks[0].span_end);
    }

    #[test]
    fn empty_content_yields_no_chunks() {
        assert!(chunk_text("", ChunkWindow::default()).is_empty());
    }
}
