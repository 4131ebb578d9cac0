//! Retrieval Engine (C8).

use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embedding::{approx_token_count, cosine_similarity};
use crate::error::AppResult;
use crate::storage::{DynStorage, EmbeddingMatch};

#[derive(Debug, Clone)]
pub struct Citation {
    pub chapter_id: Uuid,
    pub chunk_ordinal: i32,
    pub span_start: i32,
    pub span_end: i32,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub passages_text: Vec<String>,
    pub tokens_used: usize,
    pub citations: Vec<Citation>,
}

pub struct RetrievalEngine {
    storage: DynStorage,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(storage: DynStorage, config: RetrievalConfig) -> Self {
        Self { storage, config }
    }

    /// `assembleContext(bookId, query_embedding, budget) -> {passages, tokensUsed, citations}`
    /// (§4.8). The caller supplies `query_embedding` (produced via the
    /// embedding cache) rather than raw query text, since embedding is a
    /// separate, cacheable concern (C6).
    pub async fn assemble_context(
        &self,
        book_id: Uuid,
        query_embedding: &[f32],
    ) -> AppResult<AssembledContext> {
        let over_retrieved = self
            .storage
            .nearest_chapter_embeddings(book_id, query_embedding, self.config.top_k_initial)
            .await?;

        let above_floor: Vec<EmbeddingMatch> = over_retrieved
            .into_iter()
            .filter(|m| m.similarity >= self.config.similarity_floor)
            .collect();

        let deduped = semantic_dedup(above_floor, self.config.dedup_threshold);

        let top_score = deduped.iter().map(|m| m.similarity).fold(f32::MIN, f32::max);
        let relevance_floor = top_score - self.config.relevance_delta;
        let mut relevant: Vec<EmbeddingMatch> = deduped
            .into_iter()
            .filter(|m| m.similarity >= relevance_floor)
            .collect();

        // Deterministic output for identical queries: higher score first,
        // earlier chapter index as the tie-break.
        relevant.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap()
                .then(a.chapter_id.cmp(&b.chapter_id))
                .then(a.chunk_ordinal.cmp(&b.chunk_ordinal))
        });

        let chapters = self.storage.list_chapters(book_id).await?;
        let mut context = AssembledContext::default();
        for candidate in relevant.into_iter().take(self.config.top_k_final * 4) {
            if context.citations.len() >= self.config.top_k_final {
                break;
            }
            let Some(chapter) = chapters.iter().find(|c| c.chapter_id == candidate.chapter_id) else {
                continue;
            };
            let start = (candidate.span_start as usize).min(chapter.content.chars().count());
            let end = (candidate.span_end as usize).min(chapter.content.chars().count());
            let text: String = chapter.content.chars().skip(start).take(end.saturating_sub(start)).collect();
            let tokens = approx_token_count(&text);
            if context.tokens_used + tokens > self.config.context_token_budget
                && !context.citations.is_empty()
            {
                continue;
            }
            context.tokens_used += tokens;
            context.passages_text.push(text);
            context.citations.push(Citation {
                chapter_id: candidate.chapter_id,
                chunk_ordinal: candidate.chunk_ordinal,
                span_start: candidate.span_start,
                span_end: candidate.span_end,
            });
        }

        Ok(context)
    }
}

/// Greedily keeps passages whose pairwise cosine similarity with every
/// retained passage is below `threshold`, processing highest query-score
/// first so the kept set favors the best match among each near-duplicate
/// cluster.
fn semantic_dedup(mut candidates: Vec<EmbeddingMatch>, threshold: f32) -> Vec<EmbeddingMatch> {
    candidates.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
    let mut kept: Vec<EmbeddingMatch> = Vec::new();
    for candidate in candidates {
        let redundant = kept
            .iter()
            .any(|k| cosine_similarity(&k.vector, &candidate.vector) >= threshold);
        if !redundant {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(chapter: u8, ordinal: i32, similarity: f32, vector: Vec<f32>) -> EmbeddingMatch {
        EmbeddingMatch {
            chapter_id: Uuid::from_bytes([chapter; 16]),
            chunk_ordinal: ordinal,
            span_start: 0,
            span_end: 100,
            similarity,
            vector,
        }
    }

    #[test]
    fn dedup_drops_near_duplicate_vectors() {
        // Chapters 1 and 2 carry near-identical vectors (a near-duplicate
        // passage) despite different query scores; chapter 3 points in an
        // unrelated direction and must survive even though its score sits
        // between the other two.
        let candidates = vec![
            emb(1, 0, 0.95, vec![1.0, 0.0, 0.0]),
            emb(2, 0, 0.94, vec![0.99, 0.01, 0.0]),
            emb(3, 0, 0.80, vec![0.0, 1.0, 0.0]),
        ];
        let kept = semantic_dedup(candidates, 0.9);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|m| m.chapter_id == Uuid::from_bytes([1; 16])));
        assert!(kept.iter().any(|m| m.chapter_id == Uuid::from_bytes([3; 16])));
    }

    #[test]
    fn dedup_keeps_close_scores_with_dissimilar_vectors() {
        // Coincidentally close query scores but orthogonal vectors — both
        // must be kept; the old score-gap heuristic would have dropped one.
        let candidates = vec![
            emb(1, 0, 0.91, vec![1.0, 0.0, 0.0]),
            emb(2, 0, 0.90, vec![0.0, 1.0, 0.0]),
        ];
        let kept = semantic_dedup(candidates, 0.9);
        assert_eq!(kept.len(), 2);
    }
}
