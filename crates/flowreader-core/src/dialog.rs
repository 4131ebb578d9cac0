//! Streaming Dialog Engine (C11) — orchestrates C8 (retrieval), C9 (response
//! cache), C10 (policy) and the LLM client, emitting a strictly ordered
//! sequence of events per turn.
//!
//! Produces a typed, in-process event stream that the gateway re-frames as
//! actual SSE wire bytes.

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use crate::cache::{CacheSource, Fingerprint, ResponseCacheEntry};
use crate::config::Config;
use crate::domain::{Book, BookStatus, DialogMessage, DialogMetrics, DialogRole, Intent, Selection};
use crate::embedding::EmbeddingService;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatChunk, ChatClient, ChatRequest, ChatTurn, ChatUsage};
use crate::policy::policy_for;
use crate::retrieval::{Citation, RetrievalEngine};
use crate::storage::DynStorage;

#[derive(Debug, Clone)]
pub enum DialogEvent {
    Session { message_id: Uuid },
    Sources { citations: Vec<Citation> },
    Token { text: String },
    Usage {
        tokens: u32,
        cost_usd: f64,
        latency_ms: u64,
        cache_source: Option<CacheSource>,
    },
    Done,
    Error { code: &'static str, message: String },
}

pub struct DialogEngine {
    storage: DynStorage,
    retrieval: Arc<RetrievalEngine>,
    embeddings: Arc<EmbeddingService>,
    chat_client: Arc<dyn ChatClient>,
    cache: Arc<crate::cache::ResponseCache>,
    retry_attempts: u32,
}

impl DialogEngine {
    pub fn new(
        storage: DynStorage,
        retrieval: Arc<RetrievalEngine>,
        embeddings: Arc<EmbeddingService>,
        chat_client: Arc<dyn ChatClient>,
        cache: Arc<crate::cache::ResponseCache>,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            retrieval,
            embeddings,
            chat_client,
            cache,
            retry_attempts: config.llm_retry_attempts,
        }
    }

    /// `streamChat(userId, book, intent, selection?, query) -> SSE event
    /// stream`. `book` must already be ownership-checked by the caller (C1);
    /// this only enforces the `ready` precondition (§4.11 step 2).
    pub async fn stream_chat(
        self: Arc<Self>,
        user_id: String,
        book: Book,
        intent: Intent,
        selection: Option<Selection>,
        query: String,
    ) -> AppResult<BoxStream<'static, DialogEvent>> {
        if book.status != BookStatus::Ready {
            return Err(AppError::NotReady);
        }

        let engine = self;
        let stream = stream! {
            let started = Instant::now();
            let message_id = Uuid::new_v4();
            yield DialogEvent::Session { message_id };

            let user_turn = DialogMessage {
                message_id,
                book_id: book.book_id,
                owner_user_id: user_id.clone(),
                role: DialogRole::User,
                content: query.clone(),
                created_at: chrono::Utc::now(),
                intent: Some(intent),
                metrics: None,
                completed: true,
            };
            if let Err(err) = engine.storage.insert_dialog_message(user_turn).await {
                yield DialogEvent::Error { code: err.code(), message: err.to_string() };
                return;
            }

            let query_embedding = match engine.embeddings.embed_one(&query).await {
                Ok(v) => v,
                Err(err) => {
                    yield DialogEvent::Error { code: err.code(), message: err.to_string() };
                    return;
                }
            };

            let context = match engine.retrieval.assemble_context(book.book_id, &query_embedding).await {
                Ok(c) => c,
                Err(err) => {
                    yield DialogEvent::Error { code: err.code(), message: err.to_string() };
                    return;
                }
            };
            yield DialogEvent::Sources { citations: context.citations.clone() };

            let policy = policy_for(intent, false);
            let context_signature = context
                .citations
                .iter()
                .map(|c| format!("{}:{}", c.chapter_id, c.chunk_ordinal))
                .collect::<Vec<_>>()
                .join(",");
            let fingerprint = Fingerprint {
                user_id: user_id.clone(),
                book_id: book.book_id,
                intent: intent.as_str().to_string(),
                normalized_query: query.trim().to_lowercase(),
                model_tier: policy.model_tier,
                context_signature: context_signature.clone(),
            };

            match engine.cache.lookup(&fingerprint, &query_embedding) {
                crate::cache::Lookup::Hit { entry, source } => {
                    yield DialogEvent::Token { text: entry.content.clone() };
                    yield DialogEvent::Usage {
                        tokens: entry.tokens,
                        cost_usd: entry.cost_usd,
                        latency_ms: started.elapsed().as_millis() as u64,
                        cache_source: Some(source),
                    };
                    engine.persist_assistant_turn(&book, &user_id, &entry.content, intent, Some(&entry), started, true).await;
                    yield DialogEvent::Done;
                    return;
                }
                crate::cache::Lookup::Miss => {}
            }

            let handle = engine.cache.begin_single_flight(&fingerprint);
            if !handle.is_leader() {
                if let Some(entry) = engine.cache.await_in_flight(&handle).await {
                    yield DialogEvent::Token { text: entry.content.clone() };
                    yield DialogEvent::Usage {
                        tokens: entry.tokens,
                        cost_usd: entry.cost_usd,
                        latency_ms: started.elapsed().as_millis() as u64,
                        cache_source: Some(CacheSource::Exact),
                    };
                    engine.persist_assistant_turn(&book, &user_id, &entry.content, intent, Some(&entry), started, true).await;
                    yield DialogEvent::Done;
                    return;
                }
                yield DialogEvent::Error { code: "UPSTREAM", message: "in-flight completion failed".into() };
                return;
            }

            let request = build_chat_request(&policy, &context.passages_text, &selection, &query);
            let chunk_stream = crate::retry::with_backoff(engine.retry_attempts, || {
                let client = engine.chat_client.clone();
                let request = request.clone();
                async move { client.stream_chat(request).await }
            }).await;

            let mut chunk_stream = match chunk_stream {
                Ok(s) => s,
                Err(err) => {
                    engine.cache.complete_single_flight(handle, None);
                    engine.persist_assistant_turn(&book, &user_id, "", intent, None, started, false).await;
                    yield DialogEvent::Error { code: err.code(), message: err.to_string() };
                    return;
                }
            };

            let mut content = String::new();
            let mut usage: Option<ChatUsage> = None;
            let mut stream_err: Option<AppError> = None;
            while let Some(chunk) = chunk_stream.next().await {
                match chunk {
                    Ok(ChatChunk::Token(text)) => {
                        content.push_str(&text);
                        yield DialogEvent::Token { text };
                    }
                    Ok(ChatChunk::Done(final_usage)) => {
                        usage = Some(final_usage);
                        break;
                    }
                    Err(err) => {
                        stream_err = Some(err);
                        break;
                    }
                }
            }

            match (usage, stream_err) {
                (Some(usage), _) => {
                    yield DialogEvent::Usage {
                        tokens: usage.output_tokens,
                        cost_usd: usage.cost_usd,
                        latency_ms: started.elapsed().as_millis() as u64,
                        cache_source: None,
                    };
                    let entry = ResponseCacheEntry::new(
                        content.clone(),
                        usage.output_tokens,
                        usage.cost_usd,
                        query_embedding,
                        context_signature,
                    );
                    let quality = response_quality_score(&content);
                    engine.cache.complete_single_flight(handle, Some((entry.clone(), quality)));
                    engine.persist_assistant_turn(&book, &user_id, &content, intent, Some(&entry), started, true).await;
                    yield DialogEvent::Done;
                }
                (None, Some(err)) => {
                    engine.cache.complete_single_flight(handle, None);
                    engine.persist_assistant_turn(&book, &user_id, &content, intent, None, started, false).await;
                    yield DialogEvent::Error { code: err.code(), message: err.to_string() };
                }
                (None, None) => {
                    // Stream ended without a terminal `Done` chunk; treat as an
                    // upstream protocol violation rather than silently succeeding.
                    engine.cache.complete_single_flight(handle, None);
                    engine.persist_assistant_turn(&book, &user_id, &content, intent, None, started, false).await;
                    yield DialogEvent::Error {
                        code: "UPSTREAM",
                        message: "chat stream ended without a terminal usage event".into(),
                    };
                }
            }
        };

        Ok(stream.boxed())
    }
}

impl DialogEngine {
    async fn persist_assistant_turn(
        &self,
        book: &Book,
        user_id: &str,
        content: &str,
        intent: Intent,
        entry: Option<&ResponseCacheEntry>,
        started: Instant,
        completed: bool,
    ) {
        let metrics = entry.map(|e| DialogMetrics {
            tokens: Some(e.tokens),
            cost: Some(e.cost_usd),
            latency_ms: Some(started.elapsed().as_millis() as u64),
        });
        let message = DialogMessage {
            message_id: Uuid::new_v4(),
            book_id: book.book_id,
            owner_user_id: user_id.to_string(),
            role: DialogRole::Assistant,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
            intent: Some(intent),
            metrics,
            completed,
        };
        if let Err(err) = self.storage.insert_dialog_message(message).await {
            tracing::warn!(error = %err, "failed to persist assistant dialog turn");
        }
    }
}

fn build_chat_request(
    policy: &crate::policy::PolicyEntry,
    passages: &[String],
    selection: &Option<Selection>,
    query: &str,
) -> ChatRequest {
    let mut messages = Vec::new();
    if !passages.is_empty() {
        messages.push(ChatTurn {
            role: "system",
            content: format!("Retrieved context:\n{}", passages.join("\n---\n")),
        });
    }
    if let Some(selection) = selection {
        messages.push(ChatTurn {
            role: "system",
            content: format!("Selected text: {}", selection.text),
        });
    }
    messages.push(ChatTurn {
        role: "user",
        content: query.to_string(),
    });

    ChatRequest {
        system_prompt: policy.system_prompt.to_string(),
        messages,
        model_tier: policy.model_tier,
        max_output_tokens: policy.max_output_tokens,
    }
}

/// Length/coverage heuristic shared with the auto-note generator's
/// confidence gate (§4.12); a real deployment would weigh the provider's
/// self-reported confidence when available.
fn response_quality_score(content: &str) -> f32 {
    let words = content.split_whitespace().count();
    (words as f32 / 120.0).min(1.0)
}
