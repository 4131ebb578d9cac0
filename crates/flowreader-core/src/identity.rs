//! Identity & Ownership Gate (C1).

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
    iss: Option<String>,
}

pub struct IdentityGate {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityGate {
    pub fn new(verifying_key_pem_or_secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(verifying_key_pem_or_secret.as_bytes()),
            validation,
        }
    }

    /// Extracts and validates the bearer token from a raw `Authorization`
    /// header value. Rejects a missing `Bearer ` prefix the same as a
    /// missing header (§8 boundary behavior).
    pub fn authenticate(&self, authorization_header: Option<&str>) -> AppResult<Identity> {
        let header = authorization_header.ok_or(AppError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized)?;
        if token.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AppError::Unauthorized)?;

        let issued_at = Utc
            .timestamp_opt(data.claims.iat, 0)
            .single()
            .ok_or(AppError::Unauthorized)?;
        let expires_at = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or(AppError::Unauthorized)?;
        if expires_at <= Utc::now() {
            return Err(AppError::Unauthorized);
        }

        Ok(Identity {
            user_id: data.claims.sub,
            issued_at,
            expires_at,
        })
    }
}

/// `assertOwnership` — resolves `book_id` under the caller's scope. Returns
/// `NotFound` (never `Forbidden`) when the book exists under a different
/// owner, so existence is never leaked across tenants.
pub async fn assert_book_ownership(
    storage: &dyn Storage,
    caller_user_id: &str,
    book_id: uuid::Uuid,
) -> AppResult<crate::domain::Book> {
    storage
        .get_book(caller_user_id, book_id)
        .await?
        .ok_or(AppError::NotFound)
}

pub async fn assert_note_ownership(
    storage: &dyn Storage,
    caller_user_id: &str,
    note_id: uuid::Uuid,
) -> AppResult<crate::domain::Note> {
    storage
        .get_note(caller_user_id, note_id)
        .await?
        .ok_or(AppError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn make_token(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": sub,
            "iat": now,
            "exp": now + exp_offset_secs,
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn missing_bearer_prefix_is_unauthorized() {
        let gate = IdentityGate::new("secret", None);
        let err = gate.authenticate(Some("opaquetoken")).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let gate = IdentityGate::new("secret", None);
        assert!(matches!(gate.authenticate(None).unwrap_err(), AppError::Unauthorized));
    }

    #[test]
    fn valid_token_resolves_identity() {
        let gate = IdentityGate::new("secret", None);
        let token = make_token("secret", "user-1", 3600);
        let identity = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .unwrap();
        assert_eq!(identity.user_id, "user-1");
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let gate = IdentityGate::new("secret", None);
        let token = make_token("secret", "user-1", -10);
        assert!(matches!(
            gate.authenticate(Some(&format!("Bearer {token}"))).unwrap_err(),
            AppError::Unauthorized
        ));
    }
}
