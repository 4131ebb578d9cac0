//! Postgres-backed `Storage`, with row-level isolation as the authoritative
//! guarantee (the handler-level `owner_user_id` predicate in every query
//! below is defense-in-depth, not a substitute — see the design notes on
//! belt-and-braces row isolation).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

use crate::domain::{
    Book, BookStatus, Chapter, ChapterEmbedding, DialogMessage, DialogRole, GenerationMethod,
    Intent, Note, NoteMeta, NoteSource, ReadPosition, Selection, SecurityEvent, SecurityEventKind,
    Task, TaskState,
};
use crate::error::{AppError, AppResult};

use super::{EmbeddingMatch, NoteFilters, NoteSearchResult, Page, RateCheckResult, SortKey, Storage};

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;
        Ok(())
    }
}

#[derive(FromRow)]
struct BookRow {
    book_id: Uuid,
    owner_user_id: String,
    title: String,
    author: Option<String>,
    upload_key: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    chapter_count: i32,
}

impl From<BookRow> for Book {
    fn from(r: BookRow) -> Self {
        Book {
            book_id: r.book_id,
            owner_user_id: r.owner_user_id,
            title: r.title,
            author: r.author,
            upload_key: r.upload_key,
            status: match r.status.as_str() {
                "ready" => BookStatus::Ready,
                "failed" => BookStatus::Failed,
                _ => BookStatus::Processing,
            },
            created_at: r.created_at,
            updated_at: r.updated_at,
            chapter_count: r.chapter_count,
        }
    }
}

fn book_status_str(status: BookStatus) -> &'static str {
    match status {
        BookStatus::Processing => "processing",
        BookStatus::Ready => "ready",
        BookStatus::Failed => "failed",
    }
}

#[derive(FromRow)]
struct ChapterRow {
    chapter_id: Uuid,
    book_id: Uuid,
    idx: i32,
    title: String,
    content: String,
    word_count: Option<i32>,
}

impl From<ChapterRow> for Chapter {
    fn from(r: ChapterRow) -> Self {
        Chapter {
            chapter_id: r.chapter_id,
            book_id: r.book_id,
            idx: r.idx,
            title: r.title,
            content: r.content,
            word_count: r.word_count,
        }
    }
}

#[derive(FromRow)]
struct TaskRow {
    task_id: Uuid,
    book_id: Uuid,
    kind: String,
    state: String,
    progress: Option<f32>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(r: TaskRow) -> Self {
        Task {
            task_id: r.task_id,
            book_id: r.book_id,
            kind: r.kind,
            state: match r.state.as_str() {
                "running" => TaskState::Running,
                "succeeded" => TaskState::Succeeded,
                "failed" => TaskState::Failed,
                _ => TaskState::Queued,
            },
            progress: r.progress,
            error: r.error,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

fn task_state_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Queued => "queued",
        TaskState::Running => "running",
        TaskState::Succeeded => "succeeded",
        TaskState::Failed => "failed",
    }
}

#[derive(FromRow)]
struct DialogRow {
    message_id: Uuid,
    book_id: Uuid,
    owner_user_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
    intent: Option<String>,
    tokens: Option<i32>,
    cost: Option<f64>,
    latency_ms: Option<i64>,
    completed: bool,
}

impl From<DialogRow> for DialogMessage {
    fn from(r: DialogRow) -> Self {
        DialogMessage {
            message_id: r.message_id,
            book_id: r.book_id,
            owner_user_id: r.owner_user_id,
            role: if r.role == "assistant" {
                DialogRole::Assistant
            } else {
                DialogRole::User
            },
            content: r.content,
            created_at: r.created_at,
            intent: r.intent.as_deref().and_then(intent_from_str),
            metrics: if r.tokens.is_some() || r.cost.is_some() || r.latency_ms.is_some() {
                Some(crate::domain::DialogMetrics {
                    tokens: r.tokens.map(|t| t as u32),
                    cost: r.cost,
                    latency_ms: r.latency_ms.map(|l| l as u64),
                })
            } else {
                None
            },
            completed: r.completed,
        }
    }
}

fn intent_from_str(s: &str) -> Option<Intent> {
    Some(match s {
        "translate" => Intent::Translate,
        "explain" => Intent::Explain,
        "analyze" => Intent::Analyze,
        "ask" => Intent::Ask,
        "enhance" => Intent::Enhance,
        "summarize" => Intent::Summarize,
        "question" => Intent::Question,
        _ => return None,
    })
}

#[derive(FromRow)]
struct NoteRow {
    note_id: Uuid,
    owner_user_id: String,
    book_id: Uuid,
    chapter_id: Option<Uuid>,
    selection_text: Option<String>,
    selection_start: Option<i32>,
    selection_end: Option<i32>,
    content: String,
    source: String,
    tags: Vec<String>,
    intent: Option<String>,
    generation_method: Option<String>,
    confidence: Option<f32>,
    quality_score: Option<f32>,
    processing_info: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<NoteRow> for Note {
    fn from(r: NoteRow) -> Self {
        Note {
            note_id: r.note_id,
            owner_user_id: r.owner_user_id,
            book_id: r.book_id,
            chapter_id: r.chapter_id,
            selection: r.selection_text.map(|text| Selection {
                text,
                start: r.selection_start.unwrap_or(0),
                end: r.selection_end.unwrap_or(0),
            }),
            content: r.content,
            source: if r.source == "auto" {
                NoteSource::Auto
            } else {
                NoteSource::Manual
            },
            tags: r.tags,
            meta: NoteMeta {
                intent: r.intent.as_deref().and_then(intent_from_str),
                generation_method: r.generation_method.as_deref().and_then(|m| {
                    Some(match m {
                        "knowledge_enhancement" => GenerationMethod::KnowledgeEnhancement,
                        "context_analysis" => GenerationMethod::ContextAnalysis,
                        "dialog_summary" => GenerationMethod::DialogSummary,
                        _ => return None,
                    })
                }),
                confidence: r.confidence,
                quality_score: r.quality_score,
                processing_info: r.processing_info,
            },
            created_at: r.created_at,
        }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn upsert_user_seen(&self, user_id: &str) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO users (user_id, created_at) VALUES ($1, now())
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_book_by_upload_key(
        &self,
        owner_user_id: &str,
        upload_key: &str,
    ) -> AppResult<Option<Book>> {
        let row = sqlx::query_as::<_, BookRow>(
            "SELECT book_id, owner_user_id, title, author, upload_key, status,
                    created_at, updated_at, chapter_count
             FROM books WHERE owner_user_id = $1 AND upload_key = $2",
        )
        .bind(owner_user_id)
        .bind(upload_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Book::from))
    }

    async fn insert_book_processing(
        &self,
        owner_user_id: &str,
        title: &str,
        upload_key: &str,
    ) -> AppResult<(Book, bool)> {
        let inserted = sqlx::query_as::<_, BookRow>(
            "INSERT INTO books (book_id, owner_user_id, title, upload_key, status,
                                 created_at, updated_at, chapter_count)
             VALUES (gen_random_uuid(), $1, $2, $3, 'processing', now(), now(), 0)
             ON CONFLICT (owner_user_id, upload_key) DO NOTHING
             RETURNING book_id, owner_user_id, title, author, upload_key, status,
                       created_at, updated_at, chapter_count",
        )
        .bind(owner_user_id)
        .bind(title)
        .bind(upload_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = sqlx::query_as::<_, BookRow>(
            "SELECT book_id, owner_user_id, title, author, upload_key, status,
                    created_at, updated_at, chapter_count
             FROM books WHERE owner_user_id = $1 AND upload_key = $2",
        )
        .bind(owner_user_id)
        .bind(upload_key)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing.into(), false))
    }

    async fn set_book_status(
        &self,
        book_id: Uuid,
        status: BookStatus,
        chapter_count: Option<i32>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE books SET status = $2, updated_at = now(),
                    chapter_count = COALESCE($3, chapter_count)
             WHERE book_id = $1",
        )
        .bind(book_id)
        .bind(book_status_str(status))
        .bind(chapter_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_book(&self, owner_user_id: &str, book_id: Uuid) -> AppResult<Option<Book>> {
        let row = sqlx::query_as::<_, BookRow>(
            "SELECT book_id, owner_user_id, title, author, upload_key, status,
                    created_at, updated_at, chapter_count
             FROM books WHERE book_id = $1 AND owner_user_id = $2",
        )
        .bind(book_id)
        .bind(owner_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Book::from))
    }

    async fn list_books(&self, owner_user_id: &str, page: Page) -> AppResult<(Vec<Book>, u64)> {
        let rows = sqlx::query_as::<_, BookRow>(
            "SELECT book_id, owner_user_id, title, author, upload_key, status,
                    created_at, updated_at, chapter_count
             FROM books WHERE owner_user_id = $1
             ORDER BY created_at ASC LIMIT $2 OFFSET $3",
        )
        .bind(owner_user_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM books WHERE owner_user_id = $1")
            .bind(owner_user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((rows.into_iter().map(Book::from).collect(), total as u64))
    }

    async fn delete_book_cascade(&self, owner_user_id: &str, book_id: Uuid) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM books WHERE book_id = $1 AND owner_user_id = $2",
        )
        .bind(book_id)
        .bind(owner_user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if deleted {
            sqlx::query("DELETE FROM chapter_embeddings WHERE chapter_id IN (SELECT chapter_id FROM chapters WHERE book_id = $1)")
                .bind(book_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chapters WHERE book_id = $1")
                .bind(book_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM dialog_messages WHERE book_id = $1")
                .bind(book_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM notes WHERE book_id = $1")
                .bind(book_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn insert_chapter(&self, chapter: Chapter) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO chapters (chapter_id, book_id, idx, title, content, word_count)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(chapter.chapter_id)
        .bind(chapter.book_id)
        .bind(chapter.idx)
        .bind(chapter.title)
        .bind(chapter.content)
        .bind(chapter.word_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_chapters(&self, book_id: Uuid) -> AppResult<Vec<Chapter>> {
        let rows = sqlx::query_as::<_, ChapterRow>(
            "SELECT chapter_id, book_id, idx, title, content, word_count
             FROM chapters WHERE book_id = $1 ORDER BY idx ASC",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Chapter::from).collect())
    }

    async fn get_chapter(
        &self,
        owner_user_id: &str,
        chapter_id: Uuid,
    ) -> AppResult<Option<Chapter>> {
        let row = sqlx::query_as::<_, ChapterRow>(
            "SELECT c.chapter_id, c.book_id, c.idx, c.title, c.content, c.word_count
             FROM chapters c JOIN books b ON b.book_id = c.book_id
             WHERE c.chapter_id = $1 AND b.owner_user_id = $2",
        )
        .bind(chapter_id)
        .bind(owner_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Chapter::from))
    }

    async fn chapters_missing_embeddings(&self, book_id: Uuid) -> AppResult<Vec<Chapter>> {
        let rows = sqlx::query_as::<_, ChapterRow>(
            "SELECT c.chapter_id, c.book_id, c.idx, c.title, c.content, c.word_count
             FROM chapters c
             WHERE c.book_id = $1
               AND NOT EXISTS (SELECT 1 FROM chapter_embeddings e WHERE e.chapter_id = c.chapter_id)
             ORDER BY c.idx ASC",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Chapter::from).collect())
    }

    async fn insert_chapter_embeddings(&self, embeddings: Vec<ChapterEmbedding>) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for emb in embeddings {
            sqlx::query(
                "INSERT INTO chapter_embeddings
                    (chapter_id, chunk_ordinal, vector, span_start, span_end)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(emb.chapter_id)
            .bind(emb.chunk_ordinal)
            .bind(Vector::from(emb.vector))
            .bind(emb.span_start)
            .bind(emb.span_end)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn nearest_chapter_embeddings(
        &self,
        book_id: Uuid,
        query_vector: &[f32],
        top_k: usize,
    ) -> AppResult<Vec<EmbeddingMatch>> {
        let qv = Vector::from(query_vector.to_vec());
        let rows: Vec<(Uuid, i32, i32, i32, f32, Vector)> = sqlx::query_as(
            "SELECT e.chapter_id, e.chunk_ordinal, e.span_start, e.span_end,
                    1 - (e.vector <=> $2) AS similarity, e.vector
             FROM chapter_embeddings e
             JOIN chapters c ON c.chapter_id = e.chapter_id
             WHERE c.book_id = $1
             ORDER BY e.vector <=> $2
             LIMIT $3",
        )
        .bind(book_id)
        .bind(qv)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(chapter_id, chunk_ordinal, span_start, span_end, similarity, vector)| EmbeddingMatch {
                    chapter_id,
                    chunk_ordinal,
                    span_start,
                    span_end,
                    similarity,
                    vector: vector.to_vec(),
                },
            )
            .collect())
    }

    async fn insert_task(&self, book_id: Uuid, kind: &str) -> AppResult<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            "INSERT INTO tasks (task_id, book_id, kind, state, created_at, updated_at)
             VALUES (gen_random_uuid(), $1, $2, 'queued', now(), now())
             RETURNING task_id, book_id, kind, state, progress, error, created_at, updated_at",
        )
        .bind(book_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn set_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        progress: Option<f32>,
        error: Option<String>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE tasks SET state = $2, progress = COALESCE($3, progress),
                    error = COALESCE($4, error), updated_at = now()
             WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(task_state_str(state))
        .bind(progress)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> AppResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT task_id, book_id, kind, state, progress, error, created_at, updated_at
             FROM tasks WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Task::from))
    }

    async fn insert_dialog_message(&self, message: DialogMessage) -> AppResult<()> {
        let (tokens, cost, latency_ms) = match message.metrics {
            Some(m) => (m.tokens.map(|t| t as i32), m.cost, m.latency_ms.map(|l| l as i64)),
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO dialog_messages
                (message_id, book_id, owner_user_id, role, content, created_at,
                 intent, tokens, cost, latency_ms, completed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(message.message_id)
        .bind(message.book_id)
        .bind(message.owner_user_id)
        .bind(match message.role {
            DialogRole::User => "user",
            DialogRole::Assistant => "assistant",
        })
        .bind(message.content)
        .bind(message.created_at)
        .bind(message.intent.map(|i| i.as_str().to_string()))
        .bind(tokens)
        .bind(cost)
        .bind(latency_ms)
        .bind(message.completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_dialog_messages(
        &self,
        owner_user_id: &str,
        book_id: Uuid,
        limit: u32,
    ) -> AppResult<Vec<DialogMessage>> {
        let rows = sqlx::query_as::<_, DialogRow>(
            "SELECT message_id, book_id, owner_user_id, role, content, created_at,
                    intent, tokens, cost, latency_ms, completed
             FROM dialog_messages
             WHERE book_id = $1 AND owner_user_id = $2
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(book_id)
        .bind(owner_user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<DialogMessage> = rows.into_iter().map(DialogMessage::from).collect();
        messages.reverse();
        Ok(messages)
    }

    async fn insert_note(&self, note: Note) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO notes
                (note_id, owner_user_id, book_id, chapter_id, selection_text,
                 selection_start, selection_end, content, source, tags,
                 intent, generation_method, confidence, quality_score,
                 processing_info, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
        )
        .bind(note.note_id)
        .bind(note.owner_user_id)
        .bind(note.book_id)
        .bind(note.chapter_id)
        .bind(note.selection.as_ref().map(|s| s.text.clone()))
        .bind(note.selection.as_ref().map(|s| s.start))
        .bind(note.selection.as_ref().map(|s| s.end))
        .bind(note.content)
        .bind(match note.source {
            NoteSource::Manual => "manual",
            NoteSource::Auto => "auto",
        })
        .bind(note.tags)
        .bind(note.meta.intent.map(|i| i.as_str().to_string()))
        .bind(note.meta.generation_method.map(|m| m.as_str().to_string()))
        .bind(note.meta.confidence)
        .bind(note.meta.quality_score)
        .bind(note.meta.processing_info)
        .bind(note.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_note(&self, owner_user_id: &str, note_id: Uuid) -> AppResult<Option<Note>> {
        let row = sqlx::query_as::<_, NoteRow>(
            "SELECT note_id, owner_user_id, book_id, chapter_id, selection_text,
                    selection_start, selection_end, content, source, tags,
                    intent, generation_method, confidence, quality_score,
                    processing_info, created_at
             FROM notes WHERE note_id = $1 AND owner_user_id = $2",
        )
        .bind(note_id)
        .bind(owner_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Note::from))
    }

    async fn search_notes(
        &self,
        owner_user_id: &str,
        filters: &NoteFilters,
        query: Option<&str>,
        sort: SortKey,
        descending: bool,
        page: Page,
    ) -> AppResult<NoteSearchResult> {
        // Built with `QueryBuilder` so optional filters compose without a
        // combinatorial explosion of hand-written SQL strings.
        let mut qb = sqlx::QueryBuilder::new(
            "SELECT note_id, owner_user_id, book_id, chapter_id, selection_text,
                    selection_start, selection_end, content, source, tags,
                    intent, generation_method, confidence, quality_score,
                    processing_info, created_at
             FROM notes WHERE owner_user_id = ",
        );
        qb.push_bind(owner_user_id.to_string());

        if let Some(book_id) = filters.book_id {
            qb.push(" AND book_id = ").push_bind(book_id);
        }
        if let Some(chapter_id) = filters.chapter_id {
            qb.push(" AND chapter_id = ").push_bind(chapter_id);
        }
        if let Some(source) = filters.source {
            qb.push(" AND source = ")
                .push_bind(match source {
                    NoteSource::Manual => "manual",
                    NoteSource::Auto => "auto",
                });
        }
        if let Some(intent) = filters.intent {
            qb.push(" AND intent = ").push_bind(intent.as_str().to_string());
        }
        if !filters.tags.is_empty() {
            qb.push(" AND tags @> ").push_bind(filters.tags.clone());
        }
        if let Some(min_conf) = filters.min_confidence {
            qb.push(" AND coalesce(confidence, 0) >= ").push_bind(min_conf);
        }
        if let Some(since) = filters.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filters.until {
            qb.push(" AND created_at <= ").push_bind(until);
        }
        if let Some(q) = query {
            qb.push(" AND (content ILIKE ")
                .push_bind(format!("%{q}%"))
                .push(" OR EXISTS (SELECT 1 FROM unnest(tags) t WHERE t ILIKE ")
                .push_bind(format!("{q}%"))
                .push("))");
        }

        let direction = if descending { "DESC" } else { "ASC" };
        match sort {
            SortKey::CreatedAt => {
                qb.push(format!(" ORDER BY created_at {direction} LIMIT "));
            }
            SortKey::Confidence => {
                qb.push(format!(" ORDER BY confidence {direction} LIMIT "));
            }
            SortKey::ContentLength => {
                qb.push(format!(" ORDER BY length(content) {direction} LIMIT "));
            }
            SortKey::Relevance => match query {
                // `similarity()` is the same pg_trgm function the content
                // index (`notes_content_trgm_idx`) backs for ILIKE-style
                // filtering, so relevance ranking rides on it too.
                Some(q) => {
                    qb.push(" ORDER BY similarity(content, ")
                        .push_bind(q.to_string())
                        .push(format!(") {direction} LIMIT "));
                }
                // Without a query there is nothing to score relevance
                // against; fall back to recency.
                None => {
                    qb.push(format!(" ORDER BY created_at {direction} LIMIT "));
                }
            },
        }
        qb.push_bind(page.limit as i64);
        qb.push(" OFFSET ").push_bind(page.offset as i64);

        let rows: Vec<NoteRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut count_qb = sqlx::QueryBuilder::new("SELECT count(*) FROM notes WHERE owner_user_id = ");
        count_qb.push_bind(owner_user_id.to_string());
        if let Some(book_id) = filters.book_id {
            count_qb.push(" AND book_id = ").push_bind(book_id);
        }
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        Ok(NoteSearchResult {
            items: rows.into_iter().map(Note::from).collect(),
            total: total as u64,
        })
    }

    async fn upsert_read_position(&self, position: ReadPosition) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO read_positions (owner_user_id, book_id, chapter_id, offset_chars, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (owner_user_id, book_id) DO UPDATE
               SET chapter_id = $3, offset_chars = $4, updated_at = $5",
        )
        .bind(position.owner_user_id)
        .bind(position.book_id)
        .bind(position.chapter_id)
        .bind(position.offset)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn check_and_increment_rate_counter(
        &self,
        user_id: &str,
        endpoint_class: &str,
        window: std::time::Duration,
        cap: u32,
    ) -> AppResult<RateCheckResult> {
        // Conditional upsert: start (or roll forward) a fresh window if the
        // existing one has expired, then attempt an increment bounded by the
        // cap in the same statement so concurrent callers cannot race past it.
        let window_secs = window.as_secs() as f64;
        let row: (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO rate_counters (user_id, endpoint_class, window_start, count)
             VALUES ($1, $2, now(), 1)
             ON CONFLICT (user_id, endpoint_class) DO UPDATE
               SET window_start = CASE
                     WHEN now() - rate_counters.window_start > ($3 || ' seconds')::interval
                     THEN now() ELSE rate_counters.window_start END,
                   count = CASE
                     WHEN now() - rate_counters.window_start > ($3 || ' seconds')::interval
                     THEN 1
                     WHEN rate_counters.count < $4
                     THEN rate_counters.count + 1
                     ELSE rate_counters.count END
             RETURNING count, window_start",
        )
        .bind(user_id)
        .bind(endpoint_class)
        .bind(window_secs.to_string())
        .bind(cap as i64)
        .fetch_one(&self.pool)
        .await?;

        let (count, window_start) = row;
        let reset_at = window_start + chrono::Duration::from_std(window).unwrap_or_default();
        if count > cap as i64 {
            Ok(RateCheckResult {
                allowed: false,
                remaining: 0,
                reset_at,
            })
        } else {
            Ok(RateCheckResult {
                allowed: true,
                remaining: (cap as i64 - count).max(0) as u32,
                reset_at,
            })
        }
    }

    async fn reset_rate_counter(&self, user_id: &str, endpoint_class: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM rate_counters WHERE user_id = $1 AND endpoint_class = $2")
            .bind(user_id)
            .bind(endpoint_class)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_security_event(&self, event: SecurityEvent) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO security_events (event_id, user_id, kind, detail, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.event_id)
        .bind(event.user_id)
        .bind(match event.kind {
            SecurityEventKind::AuthFailure => "auth_failure",
            SecurityEventKind::LimiterDegraded => "limiter_degraded",
            SecurityEventKind::OwnershipViolation => "ownership_violation",
        })
        .bind(event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
