//! Identity for remote channel and session stream requests.
//!
//! The hub only needs one thing from a caller's identity: which practitioner
//! owns the connection. Token validation is pluggable via [`PrincipalResolver`].

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use nutri_core::PractitionerId;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("authentication token missing")]
    TokenMissing,

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Authenticated caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub claims: HashMap<String, String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.claims.insert(key.into(), value.into());
        self
    }

    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }

    /// The owning practitioner, if the named claim is present and non-blank.
    pub fn practitioner_id(&self, claim: &str) -> Option<PractitionerId> {
        self.claim(claim)
            .map(PractitionerId::from_raw)
            .filter(|id| !id.is_blank())
    }
}

/// Turns a bearer token into a [`Principal`].
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Validates HS256-signed JWTs and exposes their claims.
pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn hs256(secret: &SecretString) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl PrincipalResolver for JwtResolver {
    async fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        )?;

        let mut principal = Principal::new(data.claims.sub);
        for (key, value) in data.claims.extra {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            let _ = principal.claims.insert(key, value);
        }
        Ok(principal)
    }
}

/// Fixed token table, for development and tests.
#[derive(Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        let _ = self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl PrincipalResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

/// Query parameters accepted in place of an `Authorization` header (browsers
/// cannot set headers on WebSocket or EventSource requests).
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub access_token: Option<String>,
}

/// Pull the bearer token from the `Authorization` header, falling back to the
/// `access_token` query parameter.
pub fn extract_token(headers: &HeaderMap, query: &TokenQuery) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty());
    from_header.or_else(|| query.access_token.clone().filter(|s| !s.is_empty()))
}

/// Extract and resolve the caller's token.
pub async fn authenticate(
    resolver: &dyn PrincipalResolver,
    headers: &HeaderMap,
    query: &TokenQuery,
) -> Result<Principal, AuthError> {
    let token = extract_token(headers, query).ok_or(AuthError::TokenMissing)?;
    resolver.resolve(&token).await
}
