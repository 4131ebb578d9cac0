//! Auto-Note Generator (C12) — routes a generation request to one of three
//! methods, applies a confidence gate with a one-shot fallback, and persists
//! the result as a `Note` (§4.12).

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use uuid::Uuid;

use crate::config::Config;
use crate::dialog::{DialogEngine, DialogEvent};
use crate::domain::{Book, ContextScope, GenerationMethod, Intent, Note, NoteMeta, NoteSource, Selection};
use crate::embedding::EmbeddingService;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatClient, ChatRequest, ChatTurn};
use crate::policy::policy_for;
use crate::retrieval::RetrievalEngine;
use crate::storage::DynStorage;

pub struct AutoNoteOptions {
    pub chapter_id: Option<Uuid>,
}

pub struct AutoNoteGenerator {
    storage: DynStorage,
    retrieval: Arc<RetrievalEngine>,
    embeddings: Arc<EmbeddingService>,
    chat_client: Arc<dyn ChatClient>,
    dialog: Arc<DialogEngine>,
    confidence_gate: f32,
    recent_dialog_window: u32,
}

struct GenerationOutcome {
    content: String,
    confidence: f32,
    quality_score: f32,
    processing_info: String,
}

impl AutoNoteGenerator {
    pub fn new(
        storage: DynStorage,
        retrieval: Arc<RetrievalEngine>,
        embeddings: Arc<EmbeddingService>,
        chat_client: Arc<dyn ChatClient>,
        dialog: Arc<DialogEngine>,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            retrieval,
            embeddings,
            chat_client,
            dialog,
            confidence_gate: config.confidence_gate,
            recent_dialog_window: config.recent_dialog_window as u32,
        }
    }

    pub async fn generate(
        &self,
        user_id: &str,
        book: &Book,
        intent: Option<Intent>,
        context_scope: Option<ContextScope>,
        selection: Option<Selection>,
        options: AutoNoteOptions,
    ) -> AppResult<Note> {
        let started = Instant::now();
        let mut method = route(intent, context_scope, &selection);
        let mut outcome = self
            .run_method(method, user_id, book, intent, &selection, &options, started)
            .await?;

        if outcome.confidence < self.confidence_gate {
            if let Some(simpler) = fallback_method(method) {
                outcome = self
                    .run_method(simpler, user_id, book, intent, &selection, &options, started)
                    .await?;
                method = simpler;
            }
        }
        let fallback = outcome.confidence < self.confidence_gate;

        let mut tags = vec!["auto_generated".to_string(), format!("method:{}", method.as_str())];
        if let Some(intent) = intent {
            tags.push(format!("intent:{}", intent.as_str()));
        }
        if fallback {
            tags.push("fallback".to_string());
        }

        let mut meta = NoteMeta {
            intent,
            generation_method: Some(method),
            confidence: Some(outcome.confidence),
            quality_score: Some(outcome.quality_score),
            processing_info: Some(outcome.processing_info),
        };
        if fallback {
            meta.processing_info = Some(format!(
                "{}; warning: confidence below gate after fallback",
                meta.processing_info.unwrap_or_default()
            ));
        }

        let note = Note {
            note_id: Uuid::new_v4(),
            owner_user_id: user_id.to_string(),
            book_id: book.book_id,
            chapter_id: options.chapter_id,
            selection,
            content: outcome.content,
            source: NoteSource::Auto,
            tags,
            meta,
            created_at: chrono::Utc::now(),
        };

        self.storage.insert_note(note.clone()).await?;
        Ok(note)
    }

    async fn run_method(
        &self,
        method: GenerationMethod,
        user_id: &str,
        book: &Book,
        intent: Option<Intent>,
        selection: &Option<Selection>,
        options: &AutoNoteOptions,
        started: Instant,
    ) -> AppResult<GenerationOutcome> {
        match method {
            GenerationMethod::KnowledgeEnhancement => {
                let selection = selection
                    .as_ref()
                    .ok_or_else(|| AppError::validation("selection", "required for knowledge_enhancement"))?;
                self.knowledge_enhancement(book, user_id, selection, started).await
            }
            GenerationMethod::ContextAnalysis => {
                if let Some(selection) = selection {
                    self.context_analysis_selection(book, selection, started).await
                } else {
                    self.context_analysis_chapter(book, options.chapter_id, started).await
                }
            }
            GenerationMethod::DialogSummary => self.dialog_summary(user_id, book, intent, started).await,
        }
    }

    /// Composes the streaming dialog engine (with `intent=enhance`) rather
    /// than calling retrieval and the chat client directly, so knowledge
    /// enhancement benefits from the same response cache and single-flight
    /// dedup every other dialog turn gets.
    async fn knowledge_enhancement(
        &self,
        book: &Book,
        user_id: &str,
        selection: &Selection,
        started: Instant,
    ) -> AppResult<GenerationOutcome> {
        let mut events = self
            .dialog
            .clone()
            .stream_chat(
                user_id.to_string(),
                book.clone(),
                Intent::Enhance,
                Some(selection.clone()),
                selection.text.clone(),
            )
            .await?;

        let mut content = String::new();
        let mut citation_count = 0usize;
        while let Some(event) = events.next().await {
            match event {
                DialogEvent::Sources { citations } => citation_count = citations.len(),
                DialogEvent::Token { text } => content.push_str(&text),
                DialogEvent::Error { message, .. } => return Err(AppError::Upstream(message)),
                DialogEvent::Done => break,
                DialogEvent::Session { .. } | DialogEvent::Usage { .. } => {}
            }
        }

        let confidence = confidence_score(&content, citation_count);
        let quality = quality_score(&content, started, citation_count);
        Ok(GenerationOutcome {
            content,
            confidence,
            quality_score: quality,
            processing_info: "knowledge_enhancement composed over the streaming dialog engine".to_string(),
        })
    }

    async fn context_analysis_selection(
        &self,
        book: &Book,
        selection: &Selection,
        started: Instant,
    ) -> AppResult<GenerationOutcome> {
        let query_embedding = self.embeddings.embed_one(&selection.text).await?;
        let context = self.retrieval.assemble_context(book.book_id, &query_embedding).await?;
        let policy = policy_for(Intent::Analyze, false);
        let request = ChatRequest {
            system_prompt: policy.system_prompt.to_string(),
            messages: vec![
                ChatTurn {
                    role: "system",
                    content: format!("Chapter context:\n{}", context.passages_text.join("\n---\n")),
                },
                ChatTurn {
                    role: "user",
                    content: selection.text.clone(),
                },
            ],
            model_tier: policy.model_tier,
            max_output_tokens: policy.max_output_tokens,
        };
        let (content, _usage) = self.chat_client.complete(request).await?;
        let confidence = confidence_score(&content, context.citations.len());
        let quality = quality_score(&content, started, context.citations.len());
        Ok(GenerationOutcome {
            content,
            confidence,
            quality_score: quality,
            processing_info: "context_analysis over selection".to_string(),
        })
    }

    async fn context_analysis_chapter(
        &self,
        book: &Book,
        chapter_id: Option<Uuid>,
        started: Instant,
    ) -> AppResult<GenerationOutcome> {
        let chapters = self.storage.list_chapters(book.book_id).await?;
        let chapter = match chapter_id {
            Some(id) => chapters.into_iter().find(|c| c.chapter_id == id),
            None => chapters.into_iter().next(),
        }
        .ok_or(AppError::NotFound)?;

        let policy = policy_for(Intent::Analyze, false);
        let request = ChatRequest {
            system_prompt: policy.system_prompt.to_string(),
            messages: vec![ChatTurn {
                role: "user",
                content: chapter.content.chars().take(6000).collect(),
            }],
            model_tier: policy.model_tier,
            max_output_tokens: policy.max_output_tokens,
        };
        let (content, _usage) = self.chat_client.complete(request).await?;
        let confidence = confidence_score(&content, 1);
        let quality = quality_score(&content, started, 1);
        Ok(GenerationOutcome {
            content,
            confidence,
            quality_score: quality,
            processing_info: format!("context_analysis over chapter {}", chapter.idx),
        })
    }

    async fn dialog_summary(
        &self,
        user_id: &str,
        book: &Book,
        intent: Option<Intent>,
        started: Instant,
    ) -> AppResult<GenerationOutcome> {
        let messages = self
            .storage
            .recent_dialog_messages(user_id, book.book_id, self.recent_dialog_window)
            .await?;
        let transcript = messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let policy = policy_for(intent.unwrap_or(Intent::Summarize), false);
        let request = ChatRequest {
            system_prompt: policy.system_prompt.to_string(),
            messages: vec![ChatTurn {
                role: "user",
                content: transcript,
            }],
            model_tier: policy.model_tier,
            max_output_tokens: policy.max_output_tokens,
        };
        let (content, _usage) = self.chat_client.complete(request).await?;
        let confidence = confidence_score(&content, messages.len());
        let quality = quality_score(&content, started, messages.len());
        Ok(GenerationOutcome {
            content,
            confidence,
            quality_score: quality,
            processing_info: format!("dialog_summary over last {} messages", messages.len()),
        })
    }
}

fn route(intent: Option<Intent>, context_scope: Option<ContextScope>, selection: &Option<Selection>) -> GenerationMethod {
    if matches!(intent, Some(Intent::Enhance)) && selection.is_some() {
        return GenerationMethod::KnowledgeEnhancement;
    }
    if matches!(context_scope, Some(ContextScope::RecentDialog)) || selection.is_none() {
        return GenerationMethod::DialogSummary;
    }
    GenerationMethod::ContextAnalysis
}

fn fallback_method(method: GenerationMethod) -> Option<GenerationMethod> {
    match method {
        GenerationMethod::KnowledgeEnhancement => Some(GenerationMethod::ContextAnalysis),
        GenerationMethod::ContextAnalysis => Some(GenerationMethod::DialogSummary),
        GenerationMethod::DialogSummary => None,
    }
}

fn confidence_score(content: &str, source_coverage: usize) -> f32 {
    let length_component = (content.split_whitespace().count() as f32 / 80.0).min(1.0);
    let coverage_component = (source_coverage as f32 / 3.0).min(1.0);
    (length_component * 0.6 + coverage_component * 0.4).clamp(0.0, 1.0)
}

fn quality_score(content: &str, started: Instant, source_coverage: usize) -> f32 {
    let length_component = (content.len() as f32 / 2000.0).min(1.0);
    let coverage_component = (source_coverage as f32 / 3.0).min(1.0);
    let latency_penalty = (started.elapsed().as_millis() as f32 / 10_000.0).min(0.3);
    (length_component * 0.5 + coverage_component * 0.4 - latency_penalty + 0.1).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_enhancement_when_intent_enhance_and_selection_present() {
        let selection = Some(Selection { text: "x".into(), start: 0, end: 1 });
        assert_eq!(
            route(Some(Intent::Enhance), None, &selection),
            GenerationMethod::KnowledgeEnhancement
        );
    }

    #[test]
    fn routes_dialog_summary_when_no_selection() {
        assert_eq!(route(Some(Intent::Ask), None, &None), GenerationMethod::DialogSummary);
    }

    #[test]
    fn routes_context_analysis_for_selection_without_enhance() {
        let selection = Some(Selection { text: "x".into(), start: 0, end: 1 });
        assert_eq!(
            route(Some(Intent::Ask), None, &selection),
            GenerationMethod::ContextAnalysis
        );
    }

    #[test]
    fn fallback_chain_goes_enhancement_to_analysis_to_summary() {
        assert_eq!(
            fallback_method(GenerationMethod::KnowledgeEnhancement),
            Some(GenerationMethod::ContextAnalysis)
        );
        assert_eq!(
            fallback_method(GenerationMethod::ContextAnalysis),
            Some(GenerationMethod::DialogSummary)
        );
        assert_eq!(fallback_method(GenerationMethod::DialogSummary), None);
    }
}
