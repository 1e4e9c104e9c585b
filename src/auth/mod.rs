use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::ServiceError;

pub const ROLE_ADMIN: &str = "admin";

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,               // Subject (customer or operator id)
    pub email: String,             // Orders are owned by this address
    pub name: Option<String>,      // Display name
    pub roles: Vec<String>,        // Role names, `admin` unlocks fulfilment routes
    pub iat: i64,                  // Issued at time
    pub exp: i64,                  // Expiration time
    pub iss: String,               // Issuer
    pub aud: String,               // Audience
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenCreation(msg) => ServiceError::InternalError(msg),
            other => ServiceError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    pub expiration_secs: u64,
}

impl From<&AppConfig> for AuthConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            jwt_secret: config.jwt_secret.clone(),
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            expiration_secs: config.jwt_expiration,
        }
    }
}

/// Issues and validates HS256 bearer tokens. Accounts live elsewhere; this
/// only vouches for the identity carried in the token.
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn issue_token(
        &self,
        subject: &str,
        email: &str,
        name: Option<&str>,
        roles: &[&str],
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now + ChronoDuration::seconds(self.config.expiration_secs as i64);
        let claims = Claims {
            sub: subject.to_string(),
            email: email.trim().to_lowercase(),
            name: name.map(str::to_string),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })
    }
}

/// Authenticated caller extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
            roles: claims.roles,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_service = Arc::<AuthService>::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let claims = auth_service.validate_token(token).map_err(|e| {
            debug!(error = %e, "rejected bearer token");
            e
        })?;
        Ok(claims.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn service(secret: &str) -> AuthService {
        AuthService::new(AuthConfig {
            jwt_secret: secret.to_string(),
            issuer: "storefront-auth".into(),
            audience: "storefront-api".into(),
            expiration_secs: 3600,
        })
    }

    #[test]
    fn issued_token_validates() {
        let auth = service("a-very-long-secret-used-only-in-unit-tests");
        let token = auth
            .issue_token("cust-1", "Ana@Example.com", Some("Ana"), &["customer"])
            .unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "cust-1");
        assert_eq!(claims.email, "ana@example.com");
        assert_eq!(claims.roles, vec!["customer".to_string()]);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let token = service("first-secret-first-secret-first-secret")
            .issue_token("cust-1", "ana@example.com", None, &[])
            .unwrap();
        assert_matches!(
            service("second-secret-second-secret-second-secret").validate_token(&token),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn admin_role_check() {
        let user = AuthUser {
            user_id: "op-1".into(),
            email: "ops@example.com".into(),
            name: None,
            roles: vec!["Admin".into()],
        };
        assert!(user.is_admin());
    }
}
