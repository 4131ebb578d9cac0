//! Entity types and the tagged variants that replace stringly-typed fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Translate,
    Explain,
    Analyze,
    Ask,
    Enhance,
    Summarize,
    Question,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Translate => "translate",
            Intent::Explain => "explain",
            Intent::Analyze => "analyze",
            Intent::Ask => "ask",
            Intent::Enhance => "enhance",
            Intent::Summarize => "summarize",
            Intent::Question => "question",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Selection,
    RecentDialog,
    Chapter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSource {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    KnowledgeEnhancement,
    ContextAnalysis,
    DialogSummary,
}

impl GenerationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMethod::KnowledgeEnhancement => "knowledge_enhancement",
            GenerationMethod::ContextAnalysis => "context_analysis",
            GenerationMethod::DialogSummary => "dialog_summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub book_id: Uuid,
    pub owner_user_id: String,
    pub title: String,
    pub author: Option<String>,
    pub upload_key: String,
    pub status: BookStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chapter_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub chapter_id: Uuid,
    pub book_id: Uuid,
    pub idx: i32,
    pub title: String,
    pub content: String,
    pub word_count: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterEmbedding {
    pub chapter_id: Uuid,
    pub chunk_ordinal: i32,
    pub vector: Vec<f32>,
    pub span_start: i32,
    pub span_end: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DialogMetrics {
    pub tokens: Option<u32>,
    pub cost: Option<f64>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogMessage {
    pub message_id: Uuid,
    pub book_id: Uuid,
    pub owner_user_id: String,
    pub role: DialogRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub intent: Option<Intent>,
    pub metrics: Option<DialogMetrics>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub text: String,
    pub start: i32,
    pub end: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NoteMeta {
    pub intent: Option<Intent>,
    pub generation_method: Option<GenerationMethod>,
    pub confidence: Option<f32>,
    pub quality_score: Option<f32>,
    pub processing_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub note_id: Uuid,
    pub owner_user_id: String,
    pub book_id: Uuid,
    pub chapter_id: Option<Uuid>,
    pub selection: Option<Selection>,
    pub content: String,
    pub source: NoteSource,
    pub tags: Vec<String>,
    pub meta: NoteMeta,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub book_id: Uuid,
    pub kind: String,
    pub state: TaskState,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadPosition {
    pub owner_user_id: String,
    pub book_id: Uuid,
    pub chapter_id: Uuid,
    pub offset: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCounter {
    pub user_id: String,
    pub endpoint_class: String,
    pub window_start: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    AuthFailure,
    LimiterDegraded,
    OwnershipViolation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub user_id: Option<String>,
    pub kind: SecurityEventKind,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}
