//! Storage — the trait all persistence flows go through.
//!
//! Two flavors implement it: [`postgres::PostgresStorage`] for production,
//! backed by a row-secured Postgres database with a `vector` column for
//! embeddings, and [`memory::InMemoryStorage`] for tests, backed by
//! concurrent maps. Callers program against the trait; nothing above this
//! module knows which flavor is active.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Book, BookStatus, Chapter, ChapterEmbedding, DialogMessage, Note, ReadPosition, SecurityEvent,
    Task, TaskState,
};
use crate::error::AppResult;

/// Filters accepted by [`Storage::search_notes`]; mirrors the notes-discovery
/// contract one-to-one so the handler can build this directly from query
/// params.
#[derive(Debug, Clone, Default)]
pub struct NoteFilters {
    pub book_id: Option<Uuid>,
    pub chapter_id: Option<Uuid>,
    pub source: Option<crate::domain::NoteSource>,
    pub intent: Option<crate::domain::Intent>,
    pub tags: Vec<String>,
    pub min_confidence: Option<f32>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    Confidence,
    ContentLength,
    Relevance,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

pub struct NoteSearchResult {
    pub items: Vec<Note>,
    pub total: u64,
}

/// Nearest-neighbor hit against `chapter_embeddings`, restricted to one book.
#[derive(Debug, Clone)]
pub struct EmbeddingMatch {
    pub chapter_id: Uuid,
    pub chunk_ordinal: i32,
    pub span_start: i32,
    pub span_end: i32,
    pub similarity: f32,
    pub vector: Vec<f32>,
}

/// Outcome of a conditional rate-counter upsert (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct RateCheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // ── Users ───────────────────────────────────────────────────────
    async fn upsert_user_seen(&self, user_id: &str) -> AppResult<()>;

    // ── Books ───────────────────────────────────────────────────────
    async fn find_book_by_upload_key(
        &self,
        owner_user_id: &str,
        upload_key: &str,
    ) -> AppResult<Option<Book>>;
    /// Inserts a `processing` book for `(owner_user_id, upload_key)` unless
    /// one already exists, in which case the existing row is returned
    /// instead. Implementations must make the insert-or-fetch atomic (e.g. an
    /// `ON CONFLICT DO NOTHING RETURNING` with a fallback `SELECT`) so two
    /// concurrent calls for the same upload never both win the insert. The
    /// `bool` is `true` only when this call created the row.
    async fn insert_book_processing(
        &self,
        owner_user_id: &str,
        title: &str,
        upload_key: &str,
    ) -> AppResult<(Book, bool)>;
    async fn set_book_status(
        &self,
        book_id: Uuid,
        status: BookStatus,
        chapter_count: Option<i32>,
    ) -> AppResult<()>;
    async fn get_book(&self, owner_user_id: &str, book_id: Uuid) -> AppResult<Option<Book>>;
    async fn list_books(&self, owner_user_id: &str, page: Page) -> AppResult<(Vec<Book>, u64)>;
    async fn delete_book_cascade(&self, owner_user_id: &str, book_id: Uuid) -> AppResult<bool>;

    // ── Chapters ────────────────────────────────────────────────────
    async fn insert_chapter(&self, chapter: Chapter) -> AppResult<()>;
    async fn list_chapters(&self, book_id: Uuid) -> AppResult<Vec<Chapter>>;
    async fn get_chapter(
        &self,
        owner_user_id: &str,
        chapter_id: Uuid,
    ) -> AppResult<Option<Chapter>>;
    /// Chapters of `book_id` lacking any embedding row, in `idx` order —
    /// drives resumable ingestion (spec §4.7 "Ordering & crash semantics").
    async fn chapters_missing_embeddings(&self, book_id: Uuid) -> AppResult<Vec<Chapter>>;

    // ── Chapter embeddings ──────────────────────────────────────────
    async fn insert_chapter_embeddings(
        &self,
        embeddings: Vec<ChapterEmbedding>,
    ) -> AppResult<()>;
    async fn nearest_chapter_embeddings(
        &self,
        book_id: Uuid,
        query_vector: &[f32],
        top_k: usize,
    ) -> AppResult<Vec<EmbeddingMatch>>;

    // ── Tasks ───────────────────────────────────────────────────────
    async fn insert_task(&self, book_id: Uuid, kind: &str) -> AppResult<Task>;
    async fn set_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        progress: Option<f32>,
        error: Option<String>,
    ) -> AppResult<()>;
    async fn get_task(&self, task_id: Uuid) -> AppResult<Option<Task>>;

    // ── Dialog messages ─────────────────────────────────────────────
    async fn insert_dialog_message(&self, message: DialogMessage) -> AppResult<()>;
    async fn recent_dialog_messages(
        &self,
        owner_user_id: &str,
        book_id: Uuid,
        limit: u32,
    ) -> AppResult<Vec<DialogMessage>>;

    // ── Notes ───────────────────────────────────────────────────────
    async fn insert_note(&self, note: Note) -> AppResult<()>;
    async fn get_note(&self, owner_user_id: &str, note_id: Uuid) -> AppResult<Option<Note>>;
    async fn search_notes(
        &self,
        owner_user_id: &str,
        filters: &NoteFilters,
        query: Option<&str>,
        sort: SortKey,
        descending: bool,
        page: Page,
    ) -> AppResult<NoteSearchResult>;

    // ── Read position ───────────────────────────────────────────────
    async fn upsert_read_position(&self, position: ReadPosition) -> AppResult<()>;

    // ── Rate limiting (§4.2, conditional upserts) ────────────────────
    async fn check_and_increment_rate_counter(
        &self,
        user_id: &str,
        endpoint_class: &str,
        window: std::time::Duration,
        cap: u32,
    ) -> AppResult<RateCheckResult>;
    async fn reset_rate_counter(&self, user_id: &str, endpoint_class: &str) -> AppResult<()>;

    // ── Security events ─────────────────────────────────────────────
    async fn record_security_event(&self, event: SecurityEvent) -> AppResult<()>;
}

pub type DynStorage = std::sync::Arc<dyn Storage>;
