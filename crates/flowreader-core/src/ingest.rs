//! Ingestion Pipeline (C7).

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{BookStatus, Chapter, ChapterEmbedding, TaskState};
use crate::embedding::{chunk_text, ChunkWindow, EmbeddingService};
use crate::epub_parser::{self, ParseLimits};
use crate::error::{AppError, AppResult};
use crate::objectstore::ObjectStore;
use crate::storage::DynStorage;

pub struct IngestionPipeline {
    storage: DynStorage,
    object_store: Arc<dyn ObjectStore>,
    embedding_service: Arc<EmbeddingService>,
    parse_limits: ParseLimits,
    chunk_window: ChunkWindow,
    max_download_bytes: u64,
}

impl IngestionPipeline {
    pub fn new(
        storage: DynStorage,
        object_store: Arc<dyn ObjectStore>,
        embedding_service: Arc<EmbeddingService>,
        max_download_bytes: u64,
    ) -> Self {
        Self {
            storage,
            object_store,
            embedding_service,
            parse_limits: ParseLimits::default(),
            chunk_window: ChunkWindow::default(),
            max_download_bytes,
        }
    }

    /// `ingest(userId, uploadKey, originalFileName) -> bookId`. Idempotent by
    /// `(ownerUserId, uploadKey)`: the insert-or-fetch happens in one atomic
    /// storage call, so two concurrent calls for the same upload can never
    /// both win the insert and race each other into the unique constraint. A
    /// `ready` or `processing` book from an earlier call is returned as-is,
    /// without starting a second pipeline run.
    pub async fn ingest(
        &self,
        user_id: &str,
        upload_key: &str,
        original_file_name: &str,
    ) -> AppResult<Uuid> {
        let title = original_file_name
            .trim_end_matches(".epub")
            .trim_end_matches(".EPUB")
            .to_string();
        let (book, created) = self
            .storage
            .insert_book_processing(user_id, &title, upload_key)
            .await?;

        if !created {
            return Ok(book.book_id);
        }

        let pipeline_storage = self.storage.clone();
        let object_store = self.object_store.clone();
        let embedding_service = self.embedding_service.clone();
        let parse_limits = self.parse_limits;
        let chunk_window = self.chunk_window;
        let max_download_bytes = self.max_download_bytes;
        let book_id = book.book_id;
        let upload_key = upload_key.to_string();

        // Parsing and embedding are CPU/network-bound and must not hold the
        // request-handling task; the triggering request only waits for the
        // `processing` row to exist.
        tokio::spawn(async move {
            let outcome = run_pipeline(
                pipeline_storage.clone(),
                object_store,
                embedding_service,
                parse_limits,
                chunk_window,
                max_download_bytes,
                book_id,
                &upload_key,
            )
            .await;
            if let Err(err) = outcome {
                let _ = pipeline_storage
                    .set_book_status(book_id, BookStatus::Failed, None)
                    .await;
                tracing::warn!(%book_id, error = %err, "ingestion pipeline failed");
            }
        });

        Ok(book_id)
    }

    /// Resumes a book whose chapters exist but whose embeddings do not,
    /// completing them without re-parsing (§4.7 "Ordering & crash
    /// semantics").
    pub async fn resume_embeddings(&self, book_id: Uuid) -> AppResult<()> {
        embed_missing_chapters(
            self.storage.clone(),
            self.embedding_service.clone(),
            self.chunk_window,
            book_id,
        )
        .await
    }
}

async fn run_pipeline(
    storage: DynStorage,
    object_store: Arc<dyn ObjectStore>,
    embedding_service: Arc<EmbeddingService>,
    parse_limits: ParseLimits,
    chunk_window: ChunkWindow,
    max_download_bytes: u64,
    book_id: Uuid,
    upload_key: &str,
) -> AppResult<()> {
    let bytes = object_store.download(upload_key).await?;
    if bytes.len() as u64 > max_download_bytes {
        storage
            .set_book_status(book_id, BookStatus::Failed, None)
            .await?;
        return Err(AppError::validation("fileSize", "exceeds configured maximum"));
    }

    let parsed = match tokio::task::spawn_blocking(move || epub_parser::parse(&bytes, parse_limits))
        .await
        .map_err(|e| AppError::Internal(e.into()))?
    {
        Ok(chapters) => chapters,
        Err(parse_err) => {
            storage
                .set_book_status(book_id, BookStatus::Failed, None)
                .await?;
            return Err(AppError::UnprocessableEntity(parse_err.to_string()));
        }
    };

    for parsed_chapter in &parsed {
        storage
            .insert_chapter(Chapter {
                chapter_id: Uuid::new_v4(),
                book_id,
                idx: parsed_chapter.idx as i32,
                title: parsed_chapter.title.clone(),
                content: parsed_chapter.content.clone(),
                word_count: Some(parsed_chapter.content.split_whitespace().count() as i32),
            })
            .await?;
    }

    embed_missing_chapters(storage.clone(), embedding_service, chunk_window, book_id).await?;

    storage
        .set_book_status(book_id, BookStatus::Ready, Some(parsed.len() as i32))
        .await?;
    Ok(())
}

async fn embed_missing_chapters(
    storage: DynStorage,
    embedding_service: Arc<EmbeddingService>,
    chunk_window: ChunkWindow,
    book_id: Uuid,
) -> AppResult<()> {
    let pending = storage.chapters_missing_embeddings(book_id).await?;
    for chapter in pending {
        let chunks = chunk_text(&chapter.content, chunk_window);
        if chunks.is_empty() {
            continue;
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = embedding_service.embed_many(&texts).await?;
        let embeddings: Vec<ChapterEmbedding> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChapterEmbedding {
                chapter_id: chapter.chapter_id,
                chunk_ordinal: chunk.ordinal,
                vector,
                span_start: chunk.span_start,
                span_end: chunk.span_end,
            })
            .collect();
        storage.insert_chapter_embeddings(embeddings).await?;
    }
    Ok(())
}

/// Maps a `Task` row's lifecycle onto an ingest run for the status endpoint.
pub async fn track_task(
    storage: &DynStorage,
    book_id: Uuid,
    kind: &str,
) -> AppResult<crate::domain::Task> {
    let task = storage.insert_task(book_id, kind).await?;
    storage
        .set_task_state(task.task_id, TaskState::Running, Some(0.0), None)
        .await?;
    Ok(task)
}
