//! Notes Discovery Service (C13) — a thin orchestration layer over
//! `Storage::search_notes` that adds pagination bookkeeping and query timing
//! (§4.13).

use std::time::Instant;

use crate::domain::Note;
use crate::error::AppResult;
use crate::storage::{DynStorage, NoteFilters, Page, SortKey};

#[derive(Debug, Clone, Default)]
pub struct SearchMetrics {
    pub query_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub items: Vec<Note>,
    pub total: u64,
    pub has_more: bool,
    pub metrics: SearchMetrics,
}

pub struct NotesSearchService {
    storage: DynStorage,
}

impl NotesSearchService {
    pub fn new(storage: DynStorage) -> Self {
        Self { storage }
    }

    /// `search(userId, filters, query?, sort, page) -> {items, total, hasMore,
    /// metrics}`. Relevance sort is only meaningful with a non-empty `query`;
    /// the storage layer is expected to fall back to recency ordering
    /// otherwise.
    pub async fn search(
        &self,
        owner_user_id: &str,
        filters: &NoteFilters,
        query: Option<&str>,
        sort: SortKey,
        descending: bool,
        page: Page,
    ) -> AppResult<SearchResponse> {
        let started = Instant::now();
        let result = self
            .storage
            .search_notes(owner_user_id, filters, query, sort, descending, page)
            .await?;
        let has_more = (page.offset as u64 + result.items.len() as u64) < result.total;
        Ok(SearchResponse {
            items: result.items,
            total: result.total,
            has_more,
            metrics: SearchMetrics {
                query_ms: started.elapsed().as_millis() as u64,
            },
        })
    }
}
