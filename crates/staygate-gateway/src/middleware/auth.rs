//! Bearer-token extraction and JWT validation.
//!
//! The proxy engine calls [`extract_bearer`] and [`validate_token`] for
//! routes with the `validate` strategy; [`AuthLayer`] guards the aggregate
//! endpoints with the same verification.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{header, Request};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::error::GatewayError;

/// Claims issued by the platform's auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: u64,
}

/// Splits an `Authorization` header into its bearer token.
///
/// The header must split on a single space into exactly two parts with a
/// case-insensitive `bearer` scheme; anything else yields `None`.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let mut parts = header.split(' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    (!token.is_empty()).then_some(token)
}

/// Verifies an HS256 token against the shared secret, including expiry.
pub fn validate_token(
    token: &str,
    secret: &str,
) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &key, &validation)
}

/// Tower layer rejecting requests without a valid bearer token.
#[derive(Clone)]
pub struct AuthLayer {
    secret: Arc<str>,
}

impl AuthLayer {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            secret: self.secret.clone(),
        }
    }
}

/// The service wrapper that performs JWT authentication.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    secret: Arc<str>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let secret = self.secret.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let header = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("");

            let Some(token) = extract_bearer(header) else {
                return Ok(unauthorized("missing token"));
            };

            if secret.is_empty() {
                return Ok(unauthorized("jwt secret not configured"));
            }

            match validate_token(token, &secret) {
                Ok(data) => {
                    tracing::debug!(user_id = %data.claims.user_id, "token validated");
                    inner.call(req).await
                }
                Err(err) => {
                    tracing::debug!(error = %err, "token validation failed");
                    Ok(unauthorized("invalid token"))
                }
            }
        })
    }
}

fn unauthorized(message: &str) -> Response {
    GatewayError::Unauthorized(message.to_owned()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn token_with(secret: &str, exp: u64) -> String {
        let claims = Claims {
            user_id: "u-1".into(),
            role: "guest".into(),
            sub: Some("u-1".into()),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as u64
    }

    async fn ok_service(_req: Request<Body>) -> Result<Response, std::convert::Infallible> {
        Ok(StatusCode::OK.into_response())
    }

    #[test]
    fn extract_bearer_cases() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("BEARER abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Bearer a b"), None);
        assert_eq!(extract_bearer(""), None);
    }

    #[test]
    fn validates_good_token() {
        let token = token_with(SECRET, far_future());
        let data = validate_token(&token, SECRET).unwrap();
        assert_eq!(data.claims.user_id, "u-1");
        assert_eq!(data.claims.role, "guest");
    }

    #[test]
    fn rejects_tampered_signature() {
        let token = token_with("other-secret", far_future());
        assert!(validate_token(&token, SECRET).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let exp = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as u64;
        let token = token_with(SECRET, exp);
        assert!(validate_token(&token, SECRET).is_err());
    }

    #[tokio::test]
    async fn layer_rejects_missing_header() {
        let service = AuthLayer::new(SECRET).layer(tower::service_fn(ok_service));
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn layer_rejects_invalid_token() {
        let service = AuthLayer::new(SECRET).layer(tower::service_fn(ok_service));
        let req = Request::builder()
            .uri("/x")
            .header(header::AUTHORIZATION, "Bearer garbage")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn layer_rejects_when_secret_unset() {
        let token = token_with(SECRET, far_future());
        let service = AuthLayer::new("").layer(tower::service_fn(ok_service));
        let req = Request::builder()
            .uri("/x")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn layer_passes_valid_token() {
        let token = token_with(SECRET, far_future());
        let service = AuthLayer::new(SECRET).layer(tower::service_fn(ok_service));
        let req = Request::builder()
            .uri("/x")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
