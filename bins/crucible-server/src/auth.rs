// API-key authentication for the HTTP surface

use crate::handlers::ApiError;
use crate::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The authenticated tenant token, resolved from the `X-API-Key` header.
/// The key itself is the opaque owner token jobs are tagged with.
pub struct Tenant(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ApiError::Unauthorized("missing X-API-Key header".to_string()))?;

        if !state.store.key_exists(&key).await.map_err(ApiError::from)? {
            return Err(ApiError::Unauthorized("invalid API key".to_string()));
        }

        Ok(Tenant(key))
    }
}
