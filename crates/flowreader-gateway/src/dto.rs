//! Wire-format request/response bodies. Kept separate from the core domain
//! types so the JSON shape (camelCase, flattened selections) can evolve
//! independently of storage representation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowreader_core::domain::{
    Book, Chapter, DialogMessage, GenerationMethod, Intent, Note, Selection,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlRequest {
    pub file_name: String,
    pub file_size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    pub signed_url: String,
    pub upload_key: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUploadRequest {
    pub upload_key: String,
    pub file_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUploadResponse {
    pub book_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub state: String,
    pub progress: Option<f32>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PaginationParams {
    pub fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default)
    }

    pub fn offset_or(&self, default: u32) -> u32 {
        self.offset.unwrap_or(default)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDto {
    pub book_id: Uuid,
    pub title: String,
    pub author: Option<String>,
    pub status: &'static str,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub chapter_count: i32,
}

impl From<&Book> for BookDto {
    fn from(book: &Book) -> Self {
        Self {
            book_id: book.book_id,
            title: book.title.clone(),
            author: book.author.clone(),
            status: match book.status {
                flowreader_core::domain::BookStatus::Processing => "processing",
                flowreader_core::domain::BookStatus::Ready => "ready",
                flowreader_core::domain::BookStatus::Failed => "failed",
            },
            created_at: book.created_at,
            updated_at: book.updated_at,
            chapter_count: book.chapter_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookListResponse {
    pub items: Vec<BookDto>,
    pub total: u64,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSummaryDto {
    pub idx: i32,
    pub title: String,
    pub chapter_id: Uuid,
}

impl From<&Chapter> for ChapterSummaryDto {
    fn from(chapter: &Chapter) -> Self {
        Self {
            idx: chapter.idx,
            title: chapter.title.clone(),
            chapter_id: chapter.chapter_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterDto {
    pub chapter_id: Uuid,
    pub book_id: Uuid,
    pub idx: i32,
    pub title: String,
    pub content: String,
    pub word_count: Option<i32>,
}

impl From<&Chapter> for ChapterDto {
    fn from(chapter: &Chapter) -> Self {
        Self {
            chapter_id: chapter.chapter_id,
            book_id: chapter.book_id,
            idx: chapter.idx,
            title: chapter.title.clone(),
            content: chapter.content.clone(),
            word_count: chapter.word_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRequest {
    pub book_id: Uuid,
    pub chapter_id: Uuid,
    pub offset: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionDto {
    pub text: String,
    pub start: i32,
    pub end: i32,
}

impl From<SelectionDto> for Selection {
    fn from(dto: SelectionDto) -> Self {
        Selection {
            text: dto.text,
            start: dto.start,
            end: dto.end,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionOutDto {
    pub text: String,
    pub start: i32,
    pub end: i32,
}

impl From<&Selection> for SelectionOutDto {
    fn from(selection: &Selection) -> Self {
        Self {
            text: selection.text.clone(),
            start: selection.start,
            end: selection.end,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub book_id: Uuid,
    pub query: String,
    pub intent: Option<String>,
    pub selection: Option<SelectionDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteRequest {
    pub book_id: Uuid,
    pub chapter_id: Option<Uuid>,
    pub selection: Option<SelectionDto>,
    pub content: String,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoNoteOptionsDto {
    pub chapter_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoNoteRequest {
    pub book_id: Uuid,
    pub intent: Option<String>,
    pub context_scope: Option<String>,
    pub selection: Option<SelectionDto>,
    pub options: Option<AutoNoteOptionsDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDto {
    pub note_id: Uuid,
    pub book_id: Uuid,
    pub chapter_id: Option<Uuid>,
    pub selection: Option<SelectionOutDto>,
    pub content: String,
    pub source: &'static str,
    pub tags: Vec<String>,
    pub intent: Option<&'static str>,
    pub generation_method: Option<&'static str>,
    pub confidence: Option<f32>,
    pub quality_score: Option<f32>,
    pub processing_info: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Note> for NoteDto {
    fn from(note: &Note) -> Self {
        Self {
            note_id: note.note_id,
            book_id: note.book_id,
            chapter_id: note.chapter_id,
            selection: note.selection.as_ref().map(SelectionOutDto::from),
            content: note.content.clone(),
            source: match note.source {
                flowreader_core::domain::NoteSource::Manual => "manual",
                flowreader_core::domain::NoteSource::Auto => "auto",
            },
            tags: note.tags.clone(),
            intent: note.meta.intent.map(Intent::as_str),
            generation_method: note.meta.generation_method.map(GenerationMethod::as_str),
            confidence: note.meta.confidence,
            quality_score: note.meta.quality_score,
            processing_info: note.meta.processing_info.clone(),
            created_at: note.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSearchResponse {
    pub items: Vec<NoteDto>,
    pub total: u64,
    pub has_more: bool,
    pub metrics: NoteSearchMetricsDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSearchMetricsDto {
    pub query_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSearchParams {
    pub book_id: Option<Uuid>,
    pub chapter_id: Option<Uuid>,
    pub source: Option<String>,
    pub intent: Option<String>,
    pub tags: Option<String>,
    pub min_confidence: Option<f32>,
    pub query: Option<String>,
    pub sort: Option<String>,
    pub descending: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogMessageDto {
    pub message_id: Uuid,
    pub role: &'static str,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub intent: Option<&'static str>,
}

impl From<&DialogMessage> for DialogMessageDto {
    fn from(message: &DialogMessage) -> Self {
        Self {
            message_id: message.message_id,
            role: match message.role {
                flowreader_core::domain::DialogRole::User => "user",
                flowreader_core::domain::DialogRole::Assistant => "assistant",
            },
            content: message.content.clone(),
            created_at: message.created_at,
            intent: message.intent.map(Intent::as_str),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogHistoryResponse {
    pub messages: Vec<DialogMessageDto>,
    pub pagination: DialogHistoryPaginationDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogHistoryPaginationDto {
    pub limit: u32,
    pub returned: usize,
}

