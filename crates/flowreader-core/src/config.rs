//! Process configuration, resolved once from the environment.

use std::time::Duration;

/// Rate-limiter window/cap pair for one endpoint class.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub window: Duration,
    pub cap: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub auth: RateLimitRule,
    pub upload: RateLimitRule,
    pub chat: RateLimitRule,
    pub auto_note: RateLimitRule,
    pub api: RateLimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth: RateLimitRule {
                window: Duration::from_secs(15 * 60),
                cap: 5,
            },
            upload: RateLimitRule {
                window: Duration::from_secs(3600),
                cap: 10,
            },
            chat: RateLimitRule {
                window: Duration::from_secs(3600),
                cap: 50,
            },
            auto_note: RateLimitRule {
                window: Duration::from_secs(3600),
                cap: 20,
            },
            api: RateLimitRule {
                window: Duration::from_secs(15 * 60),
                cap: 100,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k_initial: usize,
    pub similarity_floor: f32,
    pub dedup_threshold: f32,
    pub relevance_delta: f32,
    pub top_k_final: usize,
    pub context_token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_initial: 8,
            similarity_floor: 0.75,
            dedup_threshold: 0.9,
            relevance_delta: 0.15,
            top_k_final: 3,
            context_token_budget: 1500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub response_cache_max_entries: usize,
    pub response_cache_ttl: Duration,
    pub embedding_cache_max_entries: usize,
    pub embedding_cache_ttl: Duration,
    pub semantic_similarity_threshold: f32,
    pub min_quality_to_cache: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_cache_max_entries: 10_000,
            response_cache_ttl: Duration::from_secs(15 * 60),
            embedding_cache_max_entries: 50_000,
            embedding_cache_ttl: Duration::from_secs(3600),
            semantic_similarity_threshold: 0.95,
            min_quality_to_cache: 0.6,
        }
    }
}

/// Top-level process configuration, resolved entirely from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_verifying_key: String,
    pub jwt_issuer: Option<String>,
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub embedding_endpoint: String,
    pub embedding_api_key: String,
    pub embedding_dimensions: usize,
    pub object_store_bucket: String,
    pub max_upload_bytes: u64,
    pub signed_url_ttl: Duration,
    pub llm_max_concurrent: usize,
    pub llm_retry_attempts: u32,
    pub rate_limits: RateLimitConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub confidence_gate: f32,
    pub recent_dialog_window: usize,
    pub bind_addr: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, applying the defaults named
    /// throughout the component design (TopK, thresholds, TTLs, rate caps).
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("FLOWREADER_DATABASE_URL", "postgres://localhost/flowreader"),
            jwt_verifying_key: env_or("FLOWREADER_JWT_VERIFYING_KEY", ""),
            jwt_issuer: std::env::var("FLOWREADER_JWT_ISSUER").ok(),
            llm_endpoint: env_or("FLOWREADER_LLM_ENDPOINT", "https://api.anthropic.com/v1/messages"),
            llm_api_key: env_or("FLOWREADER_LLM_API_KEY", ""),
            embedding_endpoint: env_or(
                "FLOWREADER_EMBEDDING_ENDPOINT",
                "https://api.openai.com/v1/embeddings",
            ),
            embedding_api_key: env_or("FLOWREADER_EMBEDDING_API_KEY", ""),
            embedding_dimensions: env_parse("FLOWREADER_EMBEDDING_DIMENSIONS", 1536),
            object_store_bucket: env_or("FLOWREADER_OBJECT_STORE_BUCKET", "flowreader-uploads"),
            max_upload_bytes: env_parse("FLOWREADER_MAX_UPLOAD_BYTES", 100 * 1024 * 1024),
            signed_url_ttl: Duration::from_secs(env_parse("FLOWREADER_SIGNED_URL_TTL_SECONDS", 900)),
            llm_max_concurrent: env_parse("FLOWREADER_LLM_MAX_CONCURRENT", 16),
            llm_retry_attempts: env_parse("FLOWREADER_LLM_RETRY_ATTEMPTS", 2),
            rate_limits: RateLimitConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            confidence_gate: env_parse("FLOWREADER_CONFIDENCE_GATE", 0.6),
            recent_dialog_window: env_parse("FLOWREADER_RECENT_DIALOG_WINDOW", 10),
            bind_addr: env_or("FLOWREADER_BIND_ADDR", "0.0.0.0:8080"),
        }
    }
}
