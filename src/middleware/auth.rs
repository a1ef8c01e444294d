use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use crate::api::AppState;
use crate::error::AppError;

/// Operator bearer token. With no token configured every admin call is refused.
#[derive(Clone, Default)]
pub struct AdminToken(Option<Arc<[u8; 32]>>);

impl AdminToken {
    pub fn new(token: Option<&str>) -> Self {
        Self(token.map(|token| Arc::new(digest(token))))
    }

    pub fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    pub fn authorizes(&self, presented: Option<&str>) -> bool {
        match (&self.0, presented) {
            // SECURITY: compare digests so the comparison time says nothing about the token
            (Some(expected), Some(presented)) => **expected == digest(presented),
            _ => false,
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Extractor that only succeeds for requests carrying the admin token
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.admin_token.authorizes(bearer_token(&parts.headers)) {
            return Ok(AdminAuth);
        }

        warn!(
            "⚠️ Rejected admin request to {} ({})",
            parts.uri.path(),
            if state.admin_token.is_configured() {
                "bad or missing token"
            } else {
                "no admin token configured"
            }
        );
        Err(AppError::Unauthorized)
    }
}
