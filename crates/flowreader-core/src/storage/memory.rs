//! In-memory `Storage` flavor — the test double.
//!
//! Generalizes the concurrent-map + secondary-index shape used by the
//! process-local caches elsewhere in this crate: a `DashMap` keyed by id,
//! plus `DashMap`s from foreign key to a `Vec` of ids, guarded where ordering
//! matters by a `parking_lot::Mutex` rather than re-sorting on every read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::{
    Book, BookStatus, Chapter, ChapterEmbedding, DialogMessage, Note, ReadPosition, SecurityEvent,
    Task, TaskState,
};
use crate::embedding::cosine_similarity;
use crate::error::{AppError, AppResult};

use super::{EmbeddingMatch, NoteFilters, NoteSearchResult, Page, RateCheckResult, SortKey, Storage};

struct CounterState {
    window_start: chrono::DateTime<Utc>,
    count: u32,
}

#[derive(Default)]
pub struct InMemoryStorage {
    users: DashMap<String, ()>,
    books: DashMap<Uuid, Book>,
    upload_keys: DashMap<(String, String), Uuid>,
    chapters: DashMap<Uuid, Chapter>,
    chapter_order: DashMap<Uuid, Mutex<Vec<Uuid>>>,
    embeddings: DashMap<Uuid, Vec<ChapterEmbedding>>,
    tasks: DashMap<Uuid, Task>,
    dialog: DashMap<(Uuid, String), Mutex<Vec<DialogMessage>>>,
    notes: DashMap<Uuid, Note>,
    read_positions: DashMap<(String, Uuid), ReadPosition>,
    rate_counters: DashMap<(String, String), Mutex<CounterState>>,
    security_events: Mutex<Vec<SecurityEvent>>,
    epoch: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn upsert_user_seen(&self, user_id: &str) -> AppResult<()> {
        self.users.insert(user_id.to_string(), ());
        Ok(())
    }

    async fn find_book_by_upload_key(
        &self,
        owner_user_id: &str,
        upload_key: &str,
    ) -> AppResult<Option<Book>> {
        Ok(self
            .books
            .iter()
            .map(|e| e.value().clone())
            .find(|b| b.owner_user_id == owner_user_id && b.upload_key == upload_key))
    }

    async fn insert_book_processing(
        &self,
        owner_user_id: &str,
        title: &str,
        upload_key: &str,
    ) -> AppResult<(Book, bool)> {
        // `DashMap::entry` locks only the shard for this key, so two
        // concurrent callers racing the same (owner, uploadKey) never both
        // observe a vacant entry.
        match self
            .upload_keys
            .entry((owner_user_id.to_string(), upload_key.to_string()))
        {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let book_id = *existing.get();
                let book = self
                    .books
                    .get(&book_id)
                    .map(|b| b.value().clone())
                    .ok_or(AppError::NotFound)?;
                Ok((book, false))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let now = Utc::now();
                let book = Book {
                    book_id: Uuid::new_v4(),
                    owner_user_id: owner_user_id.to_string(),
                    title: title.to_string(),
                    author: None,
                    upload_key: upload_key.to_string(),
                    status: BookStatus::Processing,
                    created_at: now,
                    updated_at: now,
                    chapter_count: 0,
                };
                slot.insert(book.book_id);
                self.books.insert(book.book_id, book.clone());
                self.chapter_order
                    .insert(book.book_id, Mutex::new(Vec::new()));
                Ok((book, true))
            }
        }
    }

    async fn set_book_status(
        &self,
        book_id: Uuid,
        status: BookStatus,
        chapter_count: Option<i32>,
    ) -> AppResult<()> {
        let mut entry = self.books.get_mut(&book_id).ok_or(AppError::NotFound)?;
        entry.status = status;
        entry.updated_at = Utc::now();
        if let Some(count) = chapter_count {
            entry.chapter_count = count;
        }
        Ok(())
    }

    async fn get_book(&self, owner_user_id: &str, book_id: Uuid) -> AppResult<Option<Book>> {
        Ok(self
            .books
            .get(&book_id)
            .map(|e| e.value().clone())
            .filter(|b| b.owner_user_id == owner_user_id))
    }

    async fn list_books(&self, owner_user_id: &str, page: Page) -> AppResult<(Vec<Book>, u64)> {
        let mut mine: Vec<Book> = self
            .books
            .iter()
            .map(|e| e.value().clone())
            .filter(|b| b.owner_user_id == owner_user_id)
            .collect();
        mine.sort_by_key(|b| b.created_at);
        let total = mine.len() as u64;
        let start = page.offset as usize;
        let end = (start + page.limit as usize).min(mine.len());
        let items = if start < mine.len() {
            mine[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok((items, total))
    }

    async fn delete_book_cascade(&self, owner_user_id: &str, book_id: Uuid) -> AppResult<bool> {
        let owned = self
            .books
            .get(&book_id)
            .map(|b| b.owner_user_id == owner_user_id)
            .unwrap_or(false);
        if !owned {
            return Ok(false);
        }
        self.books.remove(&book_id);
        if let Some((_, order)) = self.chapter_order.remove(&book_id) {
            for chapter_id in order.into_inner() {
                self.chapters.remove(&chapter_id);
                self.embeddings.remove(&chapter_id);
            }
        }
        self.notes.retain(|_, n| n.book_id != book_id);
        self.dialog.retain(|(bid, _), _| *bid != book_id);
        Ok(true)
    }

    async fn insert_chapter(&self, chapter: Chapter) -> AppResult<()> {
        let book_id = chapter.book_id;
        let chapter_id = chapter.chapter_id;
        self.chapters.insert(chapter_id, chapter);
        if let Some(order) = self.chapter_order.get(&book_id) {
            order.lock().push(chapter_id);
        } else {
            self.chapter_order
                .insert(book_id, Mutex::new(vec![chapter_id]));
        }
        Ok(())
    }

    async fn list_chapters(&self, book_id: Uuid) -> AppResult<Vec<Chapter>> {
        let Some(order) = self.chapter_order.get(&book_id) else {
            return Ok(Vec::new());
        };
        let ids = order.lock().clone();
        let mut chapters: Vec<Chapter> = ids
            .into_iter()
            .filter_map(|id| self.chapters.get(&id).map(|e| e.value().clone()))
            .collect();
        chapters.sort_by_key(|c| c.idx);
        Ok(chapters)
    }

    async fn get_chapter(
        &self,
        owner_user_id: &str,
        chapter_id: Uuid,
    ) -> AppResult<Option<Chapter>> {
        let Some(chapter) = self.chapters.get(&chapter_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let owned = self
            .books
            .get(&chapter.book_id)
            .map(|b| b.owner_user_id == owner_user_id)
            .unwrap_or(false);
        Ok(if owned { Some(chapter) } else { None })
    }

    async fn chapters_missing_embeddings(&self, book_id: Uuid) -> AppResult<Vec<Chapter>> {
        let all = self.list_chapters(book_id).await?;
        Ok(all
            .into_iter()
            .filter(|c| !self.embeddings.contains_key(&c.chapter_id))
            .collect())
    }

    async fn insert_chapter_embeddings(&self, embeddings: Vec<ChapterEmbedding>) -> AppResult<()> {
        for emb in embeddings {
            self.embeddings.entry(emb.chapter_id).or_default().push(emb);
        }
        Ok(())
    }

    async fn nearest_chapter_embeddings(
        &self,
        book_id: Uuid,
        query_vector: &[f32],
        top_k: usize,
    ) -> AppResult<Vec<EmbeddingMatch>> {
        let chapter_ids: Vec<Uuid> = self
            .chapter_order
            .get(&book_id)
            .map(|o| o.lock().clone())
            .unwrap_or_default();

        let mut scored: Vec<EmbeddingMatch> = Vec::new();
        for chapter_id in chapter_ids {
            if let Some(vecs) = self.embeddings.get(&chapter_id) {
                for emb in vecs.value() {
                    let sim = cosine_similarity(query_vector, &emb.vector);
                    scored.push(EmbeddingMatch {
                        chapter_id,
                        chunk_ordinal: emb.chunk_ordinal,
                        span_start: emb.span_start,
                        span_end: emb.span_end,
                        similarity: sim,
                        vector: emb.vector.clone(),
                    });
                }
            }
        }
        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn insert_task(&self, book_id: Uuid, kind: &str) -> AppResult<Task> {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            book_id,
            kind: kind.to_string(),
            state: TaskState::Queued,
            progress: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn set_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        progress: Option<f32>,
        error: Option<String>,
    ) -> AppResult<()> {
        let mut task = self.tasks.get_mut(&task_id).ok_or(AppError::NotFound)?;
        task.state = state;
        if progress.is_some() {
            task.progress = progress;
        }
        if error.is_some() {
            task.error = error;
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> AppResult<Option<Task>> {
        Ok(self.tasks.get(&task_id).map(|e| e.value().clone()))
    }

    async fn insert_dialog_message(&self, message: DialogMessage) -> AppResult<()> {
        let key = (message.book_id, message.owner_user_id.clone());
        self.dialog
            .entry(key)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(message);
        Ok(())
    }

    async fn recent_dialog_messages(
        &self,
        owner_user_id: &str,
        book_id: Uuid,
        limit: u32,
    ) -> AppResult<Vec<DialogMessage>> {
        let key = (book_id, owner_user_id.to_string());
        let Some(list) = self.dialog.get(&key) else {
            return Ok(Vec::new());
        };
        let guard = list.lock();
        let len = guard.len();
        let start = len.saturating_sub(limit as usize);
        Ok(guard[start..].to_vec())
    }

    async fn insert_note(&self, note: Note) -> AppResult<()> {
        self.notes.insert(note.note_id, note);
        Ok(())
    }

    async fn get_note(&self, owner_user_id: &str, note_id: Uuid) -> AppResult<Option<Note>> {
        Ok(self
            .notes
            .get(&note_id)
            .map(|e| e.value().clone())
            .filter(|n| n.owner_user_id == owner_user_id))
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
        let needle = query.map(|q| q.to_lowercase());
        let mut matches: Vec<Note> = self
            .notes
            .iter()
            .map(|e| e.value().clone())
            .filter(|n| n.owner_user_id == owner_user_id)
            .filter(|n| filters.book_id.map_or(true, |b| n.book_id == b))
            .filter(|n| filters.chapter_id.map_or(true, |c| n.chapter_id == Some(c)))
            .filter(|n| filters.source.map_or(true, |s| n.source == s))
            .filter(|n| filters.intent.map_or(true, |i| n.meta.intent == Some(i)))
            .filter(|n| {
                filters
                    .tags
                    .iter()
                    .all(|t| n.tags.iter().any(|nt| nt == t))
            })
            .filter(|n| {
                filters
                    .min_confidence
                    .map_or(true, |min| n.meta.confidence.unwrap_or(0.0) >= min)
            })
            .filter(|n| filters.since.map_or(true, |since| n.created_at >= since))
            .filter(|n| filters.until.map_or(true, |until| n.created_at <= until))
            .filter(|n| {
                needle.as_ref().map_or(true, |q| {
                    n.content.to_lowercase().contains(q.as_str())
                        || n.tags.iter().any(|t| t.to_lowercase().starts_with(q.as_str()))
                })
            })
            .collect();

        match sort {
            SortKey::CreatedAt => matches.sort_by_key(|n| n.created_at),
            SortKey::Confidence => matches.sort_by(|a, b| {
                a.meta
                    .confidence
                    .unwrap_or(0.0)
                    .partial_cmp(&b.meta.confidence.unwrap_or(0.0))
                    .unwrap()
            }),
            SortKey::ContentLength => matches.sort_by_key(|n| n.content.len()),
            SortKey::Relevance => match &needle {
                // Mirrors the production backend's pg_trgm-scored ordering
                // with a trigram Jaccard index instead of a database function.
                Some(q) => {
                    matches.sort_by(|a, b| {
                        trigram_similarity(&a.content, q)
                            .partial_cmp(&trigram_similarity(&b.content, q))
                            .unwrap()
                    });
                }
                // Without a query there is nothing to score relevance
                // against; fall back to recency.
                None => matches.sort_by_key(|n| n.created_at),
            },
        }
        if descending {
            matches.reverse();
        }

        let total = matches.len() as u64;
        let start = page.offset as usize;
        let end = (start + page.limit as usize).min(matches.len());
        let items = if start < matches.len() {
            matches[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(NoteSearchResult { items, total })
    }

    async fn upsert_read_position(&self, position: ReadPosition) -> AppResult<()> {
        let key = (position.owner_user_id.clone(), position.book_id);
        self.read_positions.insert(key, position);
        Ok(())
    }

    async fn check_and_increment_rate_counter(
        &self,
        user_id: &str,
        endpoint_class: &str,
        window: Duration,
        cap: u32,
    ) -> AppResult<RateCheckResult> {
        let key = (user_id.to_string(), endpoint_class.to_string());
        let entry = self
            .rate_counters
            .entry(key)
            .or_insert_with(|| {
                Mutex::new(CounterState {
                    window_start: Utc::now(),
                    count: 0,
                })
            });
        let mut state = entry.lock();
        let now = Utc::now();
        let elapsed = now.signed_duration_since(state.window_start);
        if elapsed
            > chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
        {
            state.window_start = now;
            state.count = 0;
        }
        let reset_at = state.window_start
            + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        if state.count >= cap {
            return Ok(RateCheckResult {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }
        state.count += 1;
        Ok(RateCheckResult {
            allowed: true,
            remaining: cap - state.count,
            reset_at,
        })
    }

    async fn reset_rate_counter(&self, user_id: &str, endpoint_class: &str) -> AppResult<()> {
        self.rate_counters
            .remove(&(user_id.to_string(), endpoint_class.to_string()));
        Ok(())
    }

    async fn record_security_event(&self, event: SecurityEvent) -> AppResult<()> {
        self.security_events.lock().push(event);
        let _ = self.next_epoch();
        Ok(())
    }
}

/// Jaccard similarity over character trigrams, approximating pg_trgm's
/// `similarity()` without a database.
fn trigram_similarity(text: &str, query: &str) -> f32 {
    fn trigrams(s: &str) -> std::collections::HashSet<[char; 3]> {
        let padded: Vec<char> = format!("  {} ", s.to_lowercase()).chars().collect();
        padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
    }
    let a = trigrams(text);
    let b = trigrams(query);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count() as f32;
    let union = a.union(&b).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingest_idempotency_key_lookup() {
        let store = InMemoryStorage::new();
        let (book, created) = store
            .insert_book_processing("u1", "Alice's Adventures", "users/u1/uploads/a/alice.epub")
            .await
            .unwrap();
        assert!(created);
        let found = store
            .find_book_by_upload_key("u1", "users/u1/uploads/a/alice.epub")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.book_id, book.book_id);
    }

    #[tokio::test]
    async fn insert_book_processing_is_idempotent_on_conflict() {
        let store = InMemoryStorage::new();
        let (first, first_created) = store
            .insert_book_processing("u1", "Title", "key-1")
            .await
            .unwrap();
        let (second, second_created) = store
            .insert_book_processing("u1", "Title", "key-1")
            .await
            .unwrap();
        assert!(first_created);
        assert!(!second_created);
        assert_eq!(first.book_id, second.book_id);
    }

    #[tokio::test]
    async fn ownership_is_scoped() {
        let store = InMemoryStorage::new();
        let (book, _) = store
            .insert_book_processing("u1", "Title", "key-1")
            .await
            .unwrap();
        assert!(store.get_book("u2", book.book_id).await.unwrap().is_none());
        assert!(store.get_book("u1", book.book_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rate_limit_determinism() {
        let store = InMemoryStorage::new();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            let r = store
                .check_and_increment_rate_counter("u1", "chat", window, 5)
                .await
                .unwrap();
            assert!(r.allowed);
        }
        let sixth = store
            .check_and_increment_rate_counter("u1", "chat", window, 5)
            .await
            .unwrap();
        assert!(!sixth.allowed);
    }

    fn note(owner: &str, book: Uuid, content: &str) -> Note {
        Note {
            note_id: Uuid::new_v4(),
            owner_user_id: owner.to_string(),
            book_id: book,
            chapter_id: None,
            selection: None,
            content: content.to_string(),
            source: crate::domain::NoteSource::Manual,
            tags: Vec::new(),
            meta: crate::domain::NoteMeta::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn relevance_sort_ranks_by_text_similarity_not_recency() {
        let store = InMemoryStorage::new();
        let book = Uuid::new_v4();
        // Both contain the query substring so the pre-filter passes for
        // either; only the trigram overlap ratio should separate them —
        // `close`'s short body overlaps the query almost entirely, `far`'s
        // long body dilutes the same match across many unrelated trigrams.
        let close = note("u1", book, "the dragon");
        let far = note(
            "u1",
            book,
            "quarterly revenue projections for the east region, with a passing \
             footnote about a dragon mentioned once in an old folklore appendix \
             that otherwise has nothing to do with the rest of this note",
        );
        store.insert_note(far.clone()).await.unwrap();
        store.insert_note(close.clone()).await.unwrap();

        let result = store
            .search_notes(
                "u1",
                &NoteFilters::default(),
                Some("dragon"),
                SortKey::Relevance,
                true,
                Page { limit: 10, offset: 0 },
            )
            .await
            .unwrap();

        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0].note_id, close.note_id);
    }

    #[tokio::test]
    async fn relevance_sort_without_query_falls_back_to_recency() {
        let store = InMemoryStorage::new();
        let book = Uuid::new_v4();
        let older = note("u1", book, "first note");
        store.insert_note(older.clone()).await.unwrap();
        let newer = note("u1", book, "second note");
        store.insert_note(newer.clone()).await.unwrap();

        let result = store
            .search_notes(
                "u1",
                &NoteFilters::default(),
                None,
                SortKey::Relevance,
                true,
                Page { limit: 10, offset: 0 },
            )
            .await
            .unwrap();

        assert_eq!(result.items[0].note_id, newer.note_id);
    }
}
