use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::error::GridError;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: i64,
}

pub struct AuthKeys {
    key: DecodingKey,
    validation: Validation,
}

impl AuthKeys {
    pub fn hs256(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, bearer: Option<&str>) -> Result<Claims, AuthError> {
        let token = bearer
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        Ok(decode::<Claims>(token, &self.key, &self.validation)?.claims)
    }
}

/// Rejects requests without a valid bearer when auth is configured.
pub async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(keys) = state.auth.as_ref() else {
        return next.run(req).await;
    };
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match keys.verify(bearer) {
        Ok(claims) => {
            debug!(sub = ?claims.sub, "bearer accepted");
            next.run(req).await
        }
        Err(err) => GridError::Unauthorized(err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(secret: &str, exp: i64) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "ci", "exp": exp}),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test_timeout::timeout]
    fn accepts_valid_and_rejects_bad_tokens() {
        let keys = AuthKeys::hs256("s3cret");
        let exp = chrono::Utc::now().timestamp() + 600;

        let good = format!("Bearer {}", token("s3cret", exp));
        assert_eq!(keys.verify(Some(&good)).unwrap().sub.as_deref(), Some("ci"));

        let forged = format!("Bearer {}", token("other", exp));
        assert!(matches!(keys.verify(Some(&forged)), Err(AuthError::Jwt(_))));

        let expired = format!("Bearer {}", token("s3cret", exp - 7_200));
        assert!(keys.verify(Some(&expired)).is_err());

        assert!(matches!(keys.verify(None), Err(AuthError::MissingToken)));
        assert!(matches!(keys.verify(Some("Basic abc")), Err(AuthError::MissingToken)));
    }
}
