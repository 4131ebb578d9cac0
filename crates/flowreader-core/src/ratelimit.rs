//! Rate Limiter (C2).

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::domain::{SecurityEvent, SecurityEventKind};
use crate::storage::DynStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Auth,
    Upload,
    Chat,
    AutoNote,
    Api,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Auth => "auth",
            EndpointClass::Upload => "upload",
            EndpointClass::Chat => "chat",
            EndpointClass::AutoNote => "auto-note",
            EndpointClass::Api => "api",
        }
    }

    fn rule(&self, config: &RateLimitConfig) -> (Duration, u32) {
        let rule = match self {
            EndpointClass::Auth => config.auth,
            EndpointClass::Upload => config.upload,
            EndpointClass::Chat => config.chat,
            EndpointClass::AutoNote => config.auto_note,
            EndpointClass::Api => config.api,
        };
        (rule.window, rule.cap)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateCheck {
    pub allowed: bool,
    pub retry_after_seconds: u64,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    storage: DynStorage,
    config: RateLimitConfig,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(storage: DynStorage, config: RateLimitConfig) -> Self {
        Self {
            storage,
            config,
            store_timeout: Duration::from_millis(100),
        }
    }

    /// `check(identityId, endpointClass)`. On counter-store unreachability or
    /// timeout the limiter fails open and records a `limiter_degraded`
    /// security event, per §4.2.
    pub async fn check(&self, user_id: &str, class: EndpointClass) -> RateCheck {
        let (window, cap) = class.rule(&self.config);
        let result = tokio::time::timeout(
            self.store_timeout,
            self.storage
                .check_and_increment_rate_counter(user_id, class.as_str(), window, cap),
        )
        .await;

        match result {
            Ok(Ok(r)) => RateCheck {
                allowed: r.allowed,
                retry_after_seconds: if r.allowed {
                    0
                } else {
                    (r.reset_at - Utc::now()).num_seconds().max(1) as u64
                },
                remaining: r.remaining,
                reset_at: r.reset_at,
            },
            Ok(Err(_)) | Err(_) => {
                let _ = self
                    .storage
                    .record_security_event(SecurityEvent {
                        event_id: Uuid::new_v4(),
                        user_id: Some(user_id.to_string()),
                        kind: SecurityEventKind::LimiterDegraded,
                        detail: format!("counter store unreachable for class {}", class.as_str()),
                        created_at: Utc::now(),
                    })
                    .await;
                RateCheck {
                    allowed: true,
                    retry_after_seconds: 0,
                    remaining: cap,
                    reset_at: Utc::now() + chrono::Duration::from_std(window).unwrap_or_default(),
                }
            }
        }
    }

    /// Successful auth resets the `auth` class counter (§4.2: "Tracked on
    /// failures only; successful auth resets").
    pub async fn reset_auth_failures(&self, user_id: &str) {
        let _ = self
            .storage
            .reset_rate_counter(user_id, EndpointClass::Auth.as_str())
            .await;
    }

    pub async fn record_auth_failure(&self, user_id: &str) -> RateCheck {
        self.check(user_id, EndpointClass::Auth).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn cap_plus_one_is_rejected_with_positive_retry_after() {
        let storage: DynStorage = Arc::new(InMemoryStorage::new());
        let mut config = RateLimitConfig::default();
        config.chat.cap = 3;
        let limiter = RateLimiter::new(storage, config);
        for _ in 0..3 {
            assert!(limiter.check("u1", EndpointClass::Chat).await.allowed);
        }
        let fourth = limiter.check("u1", EndpointClass::Chat).await;
        assert!(!fourth.allowed);
        assert!(fourth.retry_after_seconds > 0);
    }
}
