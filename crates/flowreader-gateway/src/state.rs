//! Shared application state, built once at boot and cloned (as an `Arc`)
//! into every request.

use std::sync::Arc;
use std::time::Instant;

use flowreader_core::autonote::AutoNoteGenerator;
use flowreader_core::cache::{EmbeddingCache, ResponseCache};
use flowreader_core::config::Config;
use flowreader_core::dialog::DialogEngine;
use flowreader_core::embedding::{CostAccountingSink, EmbeddingService};
use flowreader_core::identity::IdentityGate;
use flowreader_core::ingest::IngestionPipeline;
use flowreader_core::llm::{ChatClient, EmbeddingClient, HttpChatClient, HttpEmbeddingClient};
use flowreader_core::objectstore::{LocalObjectStore, ObjectStore};
use flowreader_core::ratelimit::RateLimiter;
use flowreader_core::retrieval::RetrievalEngine;
use flowreader_core::search::NotesSearchService;
use flowreader_core::storage::postgres::PostgresStorage;
use flowreader_core::storage::DynStorage;

pub struct AppState {
    pub config: Config,
    pub storage: DynStorage,
    pub object_store: Arc<dyn ObjectStore>,
    pub identity: IdentityGate,
    pub rate_limiter: RateLimiter,
    pub ingestion: IngestionPipeline,
    pub dialog: Arc<DialogEngine>,
    pub autonote: AutoNoteGenerator,
    pub search: NotesSearchService,
    pub started_at: Instant,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let storage: DynStorage = {
            let pg = PostgresStorage::connect(&config.database_url).await?;
            pg.migrate().await?;
            Arc::new(pg)
        };

        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            std::env::temp_dir().join(&config.object_store_bucket),
        ));

        let chat_client: Arc<dyn ChatClient> = Arc::new(HttpChatClient::new(
            config.llm_endpoint.clone(),
            config.llm_api_key.clone(),
            config.llm_retry_attempts,
        ));
        let embedding_client: Arc<dyn EmbeddingClient> = Arc::new(HttpEmbeddingClient::new(
            config.embedding_endpoint.clone(),
            config.embedding_api_key.clone(),
            config.embedding_dimensions,
            config.llm_retry_attempts,
        ));

        let embedding_cache = EmbeddingCache::new(
            config.cache.embedding_cache_max_entries,
            config.cache.embedding_cache_ttl,
        );
        let embedding_service = Arc::new(EmbeddingService::new(
            embedding_client,
            embedding_cache,
            CostAccountingSink::noop(),
        ));

        let response_cache = Arc::new(ResponseCache::new(
            config.cache.response_cache_max_entries,
            config.cache.response_cache_ttl,
            config.cache.semantic_similarity_threshold,
            config.cache.min_quality_to_cache,
        ));

        let retrieval = Arc::new(RetrievalEngine::new(
            storage.clone(),
            config.retrieval.clone(),
        ));

        let identity = IdentityGate::new(&config.jwt_verifying_key, config.jwt_issuer.as_deref());
        let rate_limiter = RateLimiter::new(storage.clone(), config.rate_limits.clone());
        let ingestion = IngestionPipeline::new(
            storage.clone(),
            object_store.clone(),
            embedding_service.clone(),
            config.max_upload_bytes,
        );
        let dialog = Arc::new(DialogEngine::new(
            storage.clone(),
            retrieval.clone(),
            embedding_service.clone(),
            chat_client.clone(),
            response_cache,
            &config,
        ));
        let autonote = AutoNoteGenerator::new(
            storage.clone(),
            retrieval,
            embedding_service,
            chat_client,
            dialog.clone(),
            &config,
        );
        let search = NotesSearchService::new(storage.clone());

        Ok(Self {
            config,
            storage,
            object_store,
            identity,
            rate_limiter,
            ingestion,
            dialog,
            autonote,
            search,
            started_at: Instant::now(),
        })
    }
}
