//! Authentication extractor — performs C1 identity verification at the edge
//! of every protected handler, before any handler body runs.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use flowreader_core::identity::Identity;

use crate::error::ApiError;
use crate::state::AppState;

pub struct AuthedUser(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let identity = state.identity.authenticate(header)?;
        state.rate_limiter.reset_auth_failures(&identity.user_id).await;
        Ok(AuthedUser(identity))
    }
}
