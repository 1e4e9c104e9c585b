use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use utoipa::IntoParams;

use crate::errors::ServiceError;

pub const SESSION_HEADER: &str = "x-session-id";
const MAX_SESSION_ID_LEN: usize = 128;

/// Anonymous cart session taken from the `x-session-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionId
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ServiceError::BadRequest(format!("Missing {} header", SESSION_HEADER))
            })?;

        if value.len() > MAX_SESSION_ID_LEN {
            return Err(ServiceError::BadRequest(format!(
                "{} header is too long",
                SESSION_HEADER
            )));
        }
        Ok(SessionId(value.to_string()))
    }
}

/// Pagination parameters for list operations
#[derive(Debug, Deserialize, Serialize, IntoParams)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PaginationParams {
    pub fn limit(&self) -> u64 {
        self.limit.clamp(1, 100)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(self.limit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<SessionId, ServiceError> {
        let mut builder = Request::builder().uri("/cart");
        if let Some(value) = header {
            builder = builder.header(SESSION_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        SessionId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn session_header_is_required() {
        assert!(extract(None).await.is_err());
        assert!(extract(Some("   ")).await.is_err());
        assert_eq!(extract(Some("sess-1")).await.unwrap().as_str(), "sess-1");
    }

    #[test]
    fn pagination_limits() {
        let params = PaginationParams { page: 1, limit: 500 };
        assert_eq!(params.limit(), 100);
        assert_eq!(params.total_pages(250), 3);
    }
}
