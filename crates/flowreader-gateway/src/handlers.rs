//! HTTP handlers for the FlowReader request surface. Each handler follows the
//! same skeleton: authenticate (via the `AuthedUser` extractor) → rate-limit
//! → validate → authorize resource → execute → map errors (via `ApiError`).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use uuid::Uuid;

use flowreader_core::cache::CacheSource;
use flowreader_core::config::RateLimitRule;
use flowreader_core::dialog::DialogEvent;
use flowreader_core::domain::{
    Intent, Note, NoteMeta, NoteSource, ReadPosition,
};
use flowreader_core::error::{AppError, AppResult};
use flowreader_core::identity::{assert_book_ownership, assert_note_ownership};
use flowreader_core::ratelimit::{EndpointClass, RateCheck};
use flowreader_core::retrieval::Citation;
use flowreader_core::storage::{NoteFilters, Page, SortKey};
use flowreader_core::validate::{
    parse_context_scope, parse_intent, parse_uuid, sanitize_text, validate_file_name,
    validate_pagination, validate_string_len, validate_upload_size, NOTE_CONTENT_MAX,
    SELECTION_TEXT_MAX,
};

use crate::auth::AuthedUser;
use crate::dto::{
    AutoNoteRequest, BookDto, BookListResponse, ChapterDto, ChapterSummaryDto, ChatStreamRequest,
    CreateNoteRequest, DialogHistoryPaginationDto, DialogHistoryResponse, DialogMessageDto,
    HealthResponse, NoteDto, NoteSearchMetricsDto, NoteSearchParams, NoteSearchResponse,
    PaginationParams, PositionRequest, ProcessUploadRequest, ProcessUploadResponse,
    SignedUrlRequest, SignedUrlResponse, TaskStatusResponse,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ── Rate limiting ────────────────────────────────────────────────────────

fn class_rule(state: &AppState, class: EndpointClass) -> RateLimitRule {
    let limits = &state.config.rate_limits;
    match class {
        EndpointClass::Auth => limits.auth,
        EndpointClass::Upload => limits.upload,
        EndpointClass::Chat => limits.chat,
        EndpointClass::AutoNote => limits.auto_note,
        EndpointClass::Api => limits.api,
    }
}

/// Checks the caller's quota for `class`, returning the headers to attach on
/// success or a mapped `RateLimited` error (with `Retry-After`) otherwise.
async fn enforce_rate_limit(
    state: &AppState,
    user_id: &str,
    class: EndpointClass,
) -> Result<HeaderMap, ApiError> {
    let check: RateCheck = state.rate_limiter.check(user_id, class).await;
    if !check.allowed {
        return Err(ApiError(AppError::RateLimited {
            retry_after_seconds: check.retry_after_seconds,
        }));
    }
    Ok(rate_limit_headers(&check, class_rule(state, class).cap))
}

fn rate_limit_headers(check: &RateCheck, cap: u32) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(cap));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(check.remaining));
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(check.reset_at.timestamp().max(0) as u64),
    );
    headers
}

fn with_headers(mut response: Response, headers: HeaderMap) -> Response {
    response.headers_mut().extend(headers);
    response
}

// ── Health ───────────────────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

// ── Upload ───────────────────────────────────────────────────────────────

pub async fn signed_url(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Json(body): Json<SignedUrlRequest>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Upload).await?;
    validate_file_name("fileName", &body.file_name)?;
    validate_upload_size("fileSize", body.file_size, state.config.max_upload_bytes)?;

    let signed = state
        .object_store
        .issue_signed_upload(&identity.user_id, &body.file_name, state.config.signed_url_ttl)
        .await?;

    let response = Json(SignedUrlResponse {
        signed_url: signed.signed_url,
        upload_key: signed.upload_key,
        expires_at: signed.expires_at,
    })
    .into_response();
    Ok(with_headers(response, headers))
}

pub async fn process_upload(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Json(body): Json<ProcessUploadRequest>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Upload).await?;
    validate_file_name("fileName", &body.file_name)?;

    let book_id = state
        .ingestion
        .ingest(&identity.user_id, &body.upload_key, &body.file_name)
        .await?;

    let response = (
        StatusCode::ACCEPTED,
        Json(ProcessUploadResponse {
            book_id,
            status: "processing",
        }),
    )
        .into_response();
    Ok(with_headers(response, headers))
}

pub async fn task_status(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let task_id = parse_uuid("taskId", &task_id)?;

    let task = state
        .storage
        .get_task(task_id)
        .await?
        .ok_or(AppError::NotFound)?;
    // Tasks aren't directly owner-tagged; scope through the book they belong
    // to so a task id never leaks another tenant's progress.
    assert_book_ownership(state.storage.as_ref(), &identity.user_id, task.book_id).await?;

    let response = Json(TaskStatusResponse {
        state: task_state_str(task.state).to_string(),
        progress: task.progress,
        error: task.error,
    })
    .into_response();
    Ok(with_headers(response, headers))
}

fn task_state_str(state: flowreader_core::domain::TaskState) -> &'static str {
    use flowreader_core::domain::TaskState::*;
    match state {
        Queued => "queued",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

// ── Books & chapters ────────────────────────────────────────────────────

pub async fn list_books(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Query(pagination): Query<PaginationParams>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let limit = pagination.limit_or(20);
    let offset = pagination.offset_or(0);
    validate_pagination(limit, offset)?;

    let (books, total) = state
        .storage
        .list_books(&identity.user_id, Page { limit, offset })
        .await?;
    let items: Vec<BookDto> = books.iter().map(BookDto::from).collect();
    let has_more = (offset as u64 + items.len() as u64) < total;

    let response = Json(BookListResponse {
        items,
        total,
        has_more,
    })
    .into_response();
    Ok(with_headers(response, headers))
}

pub async fn get_book(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Path(book_id): Path<String>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let book_id = parse_uuid("bookId", &book_id)?;
    let book = assert_book_ownership(state.storage.as_ref(), &identity.user_id, book_id).await?;
    Ok(with_headers(Json(BookDto::from(&book)).into_response(), headers))
}

pub async fn list_chapters(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Path(book_id): Path<String>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let book_id = parse_uuid("bookId", &book_id)?;
    assert_book_ownership(state.storage.as_ref(), &identity.user_id, book_id).await?;

    let chapters = state.storage.list_chapters(book_id).await?;
    let items: Vec<ChapterSummaryDto> = chapters.iter().map(ChapterSummaryDto::from).collect();
    Ok(with_headers(Json(items).into_response(), headers))
}

pub async fn get_chapter(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Path(chapter_id): Path<String>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let chapter_id = parse_uuid("chapterId", &chapter_id)?;
    let chapter = state
        .storage
        .get_chapter(&identity.user_id, chapter_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(with_headers(Json(ChapterDto::from(&chapter)).into_response(), headers))
}

// ── Read position ────────────────────────────────────────────────────────

pub async fn update_position(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Json(body): Json<PositionRequest>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    assert_book_ownership(state.storage.as_ref(), &identity.user_id, body.book_id).await?;
    let chapter = state
        .storage
        .get_chapter(&identity.user_id, body.chapter_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if chapter.book_id != body.book_id {
        return Err(AppError::validation("chapterId", "does not belong to bookId").into());
    }

    state
        .storage
        .upsert_read_position(ReadPosition {
            owner_user_id: identity.user_id,
            book_id: body.book_id,
            chapter_id: body.chapter_id,
            offset: body.offset,
            updated_at: Utc::now(),
        })
        .await?;

    Ok(with_headers(StatusCode::NO_CONTENT.into_response(), headers))
}

// ── Dialog ───────────────────────────────────────────────────────────────

pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Json(body): Json<ChatStreamRequest>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Chat).await?;
    validate_string_len("query", &body.query, 4000)?;
    let query = sanitize_text(&body.query);

    let book = assert_book_ownership(state.storage.as_ref(), &identity.user_id, body.book_id).await?;
    // Unspecified intent defaults to general Q&A rather than rejecting the
    // request; every other field on the request is explicit.
    let intent = match body.intent {
        Some(raw) => parse_intent("intent", &raw)?,
        None => Intent::Ask,
    };
    let selection = match body.selection {
        Some(dto) => {
            validate_string_len("selection.text", &dto.text, SELECTION_TEXT_MAX)?;
            Some(flowreader_core::domain::Selection {
                text: sanitize_text(&dto.text),
                start: dto.start,
                end: dto.end,
            })
        }
        None => None,
    };

    let stream = state
        .dialog
        .clone()
        .stream_chat(identity.user_id, book, intent, selection, query)
        .await?;

    let sse_stream = stream.map(|event| Ok::<Event, Infallible>(dialog_event_to_sse(event)));
    let response = Sse::new(sse_stream).into_response();
    Ok(with_headers(response, headers))
}

fn sse_event(name: &'static str, payload: serde_json::Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

fn dialog_event_to_sse(event: DialogEvent) -> Event {
    match event {
        DialogEvent::Session { message_id } => {
            sse_event("session", json!({ "messageId": message_id }))
        }
        DialogEvent::Sources { citations } => sse_event(
            "sources",
            json!({ "citations": citations.iter().map(citation_json).collect::<Vec<_>>() }),
        ),
        DialogEvent::Token { text } => sse_event("token", json!({ "text": text })),
        DialogEvent::Usage {
            tokens,
            cost_usd,
            latency_ms,
            cache_source,
        } => sse_event(
            "usage",
            json!({
                "tokens": tokens,
                "costUsd": cost_usd,
                "latencyMs": latency_ms,
                "cacheSource": cache_source.map(cache_source_str),
            }),
        ),
        DialogEvent::Done => Event::default().event("done"),
        DialogEvent::Error { code, message } => {
            sse_event("error", json!({ "code": code, "message": message }))
        }
    }
}

fn citation_json(citation: &Citation) -> serde_json::Value {
    json!({
        "chapterId": citation.chapter_id,
        "chunkOrdinal": citation.chunk_ordinal,
        "spanStart": citation.span_start,
        "spanEnd": citation.span_end,
    })
}

fn cache_source_str(source: CacheSource) -> &'static str {
    match source {
        CacheSource::Exact => "exact",
        CacheSource::Semantic => "semantic",
    }
}

pub async fn dialog_history(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Query(params): Query<DialogHistoryParams>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let limit = params.limit.unwrap_or(state.config.recent_dialog_window as u32);
    validate_pagination(limit, 0)?;
    assert_book_ownership(state.storage.as_ref(), &identity.user_id, params.book_id).await?;

    let messages = state
        .storage
        .recent_dialog_messages(&identity.user_id, params.book_id, limit)
        .await?;
    let dto = DialogHistoryResponse {
        pagination: DialogHistoryPaginationDto {
            limit,
            returned: messages.len(),
        },
        messages: messages.iter().map(DialogMessageDto::from).collect(),
    };
    Ok(with_headers(Json(dto).into_response(), headers))
}

#[derive(Debug, serde::Deserialize)]
pub struct DialogHistoryParams {
    pub book_id: Uuid,
    pub limit: Option<u32>,
}

// ── Notes ────────────────────────────────────────────────────────────────

pub async fn create_note(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Json(body): Json<CreateNoteRequest>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    validate_string_len("content", &body.content, NOTE_CONTENT_MAX)?;
    assert_book_ownership(state.storage.as_ref(), &identity.user_id, body.book_id).await?;

    if let Some(chapter_id) = body.chapter_id {
        let chapter = state
            .storage
            .get_chapter(&identity.user_id, chapter_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if chapter.book_id != body.book_id {
            return Err(AppError::validation("chapterId", "does not belong to bookId").into());
        }
    }

    let selection = match body.selection {
        Some(dto) => {
            validate_string_len("selection.text", &dto.text, SELECTION_TEXT_MAX)?;
            Some(flowreader_core::domain::Selection {
                text: sanitize_text(&dto.text),
                start: dto.start,
                end: dto.end,
            })
        }
        None => None,
    };

    let note = Note {
        note_id: Uuid::new_v4(),
        owner_user_id: identity.user_id,
        book_id: body.book_id,
        chapter_id: body.chapter_id,
        selection,
        content: sanitize_text(&body.content),
        source: NoteSource::Manual,
        tags: body.tags.unwrap_or_default(),
        meta: NoteMeta::default(),
        created_at: Utc::now(),
    };
    state.storage.insert_note(note.clone()).await?;

    let response = (StatusCode::CREATED, Json(NoteDto::from(&note))).into_response();
    Ok(with_headers(response, headers))
}

pub async fn create_auto_note(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Json(body): Json<AutoNoteRequest>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::AutoNote).await?;
    let book = assert_book_ownership(state.storage.as_ref(), &identity.user_id, body.book_id).await?;

    let intent = body.intent.as_deref().map(|v| parse_intent("intent", v)).transpose()?;
    let context_scope = body
        .context_scope
        .as_deref()
        .map(|v| parse_context_scope("contextScope", v))
        .transpose()?;
    let selection = match body.selection {
        Some(dto) => {
            validate_string_len("selection.text", &dto.text, SELECTION_TEXT_MAX)?;
            Some(flowreader_core::domain::Selection {
                text: sanitize_text(&dto.text),
                start: dto.start,
                end: dto.end,
            })
        }
        None => None,
    };
    let options = flowreader_core::autonote::AutoNoteOptions {
        chapter_id: body.options.and_then(|o| o.chapter_id),
    };

    let note = state
        .autonote
        .generate(&identity.user_id, &book, intent, context_scope, selection, options)
        .await?;

    let response = (StatusCode::CREATED, Json(NoteDto::from(&note))).into_response();
    Ok(with_headers(response, headers))
}

pub async fn search_notes(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Query(params): Query<NoteSearchParams>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let limit = params.limit.unwrap_or(20);
    let offset = params.offset.unwrap_or(0);
    validate_pagination(limit, offset)?;

    let filters = NoteFilters {
        book_id: params.book_id,
        chapter_id: params.chapter_id,
        source: params
            .source
            .as_deref()
            .map(parse_note_source)
            .transpose()?,
        intent: params.intent.as_deref().map(|v| parse_intent("intent", v)).transpose()?,
        tags: params
            .tags
            .as_deref()
            .map(|s| s.split(',').filter(|t| !t.is_empty()).map(str::to_string).collect())
            .unwrap_or_default(),
        min_confidence: params.min_confidence,
        since: None,
        until: None,
    };
    let sort = params.sort.as_deref().map(parse_sort_key).transpose()?.unwrap_or(SortKey::CreatedAt);
    let descending = params.descending.unwrap_or(true);

    let result = state
        .search
        .search(
            &identity.user_id,
            &filters,
            params.query.as_deref(),
            sort,
            descending,
            Page { limit, offset },
        )
        .await?;

    let dto = NoteSearchResponse {
        items: result.items.iter().map(NoteDto::from).collect(),
        total: result.total,
        has_more: result.has_more,
        metrics: NoteSearchMetricsDto {
            query_ms: result.metrics.query_ms,
        },
    };
    Ok(with_headers(Json(dto).into_response(), headers))
}

fn parse_note_source(value: &str) -> AppResult<NoteSource> {
    match value {
        "manual" => Ok(NoteSource::Manual),
        "auto" => Ok(NoteSource::Auto),
        other => Err(AppError::validation("source", format!("`{other}` is not a recognized note source"))),
    }
}

fn parse_sort_key(value: &str) -> AppResult<SortKey> {
    match value {
        "created_at" => Ok(SortKey::CreatedAt),
        "confidence" => Ok(SortKey::Confidence),
        "content_length" => Ok(SortKey::ContentLength),
        "relevance" => Ok(SortKey::Relevance),
        other => Err(AppError::validation("sort", format!("`{other}` is not a recognized sort key"))),
    }
}

pub async fn get_note(
    State(state): State<Arc<AppState>>,
    AuthedUser(identity): AuthedUser,
    Path(note_id): Path<String>,
) -> ApiResult<Response> {
    let headers = enforce_rate_limit(&state, &identity.user_id, EndpointClass::Api).await?;
    let note_id = parse_uuid("noteId", &note_id)?;
    let note = assert_note_ownership(state.storage.as_ref(), &identity.user_id, note_id).await?;
    Ok(with_headers(Json(NoteDto::from(&note)).into_response(), headers))
}
