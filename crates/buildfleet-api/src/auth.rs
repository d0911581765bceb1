//! Worker credential extraction.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::ApiError;

/// The connect credential a worker presents as `Authorization: Bearer <credential>`.
///
/// Extraction only checks the header shape; the credential is verified
/// against the job it is used for.
pub struct WorkerCredential(pub String);

impl<S> FromRequestParts<S> for WorkerCredential
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing worker credential".to_string()))?;
        let credential = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("expected a bearer credential".to_string()))?;
        Ok(Self(credential.to_string()))
    }
}
