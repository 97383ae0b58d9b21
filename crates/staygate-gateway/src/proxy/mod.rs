//! Dynamic catch-all proxy: route matching, auth gating, and forwarding.

pub mod forward;

pub use forward::ForwardClient;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use http::{header, Method};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{GatewayConfig, GatewayMode};
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::middleware::auth::{extract_bearer, validate_token};
use crate::routes::{normalize_prefix, AuthStrategy, RouteDefinition};
use crate::upstream::{CircuitPolicy, HealthChecker, Upstream, UpstreamRegistry};

/// One runtime route: a normalized prefix bound to a shared upstream.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub prefix: String,
    pub strip_prefix: bool,
    pub rewrite: Option<String>,
    pub require_auth: bool,
    pub auth_strategy: AuthStrategy,
    pub methods: Option<HashSet<Method>>,
    pub upstream: Arc<Upstream>,
}

impl Route {
    fn from_definition(def: &RouteDefinition, upstream: Arc<Upstream>) -> Self {
        let prefix = normalize_prefix(&def.prefix);
        let name = if def.name.is_empty() {
            prefix.clone()
        } else {
            def.name.clone()
        };
        let methods = if def.methods.is_empty() {
            None
        } else {
            Some(
                def.methods
                    .iter()
                    .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
                    .collect(),
            )
        };

        Self {
            name,
            prefix,
            strip_prefix: def.strip_prefix,
            rewrite: (!def.rewrite.is_empty()).then(|| def.rewrite.clone()),
            require_auth: def.require_auth,
            auth_strategy: AuthStrategy::parse(&def.auth_strategy),
            methods,
            upstream,
        }
    }

    /// Path-segment prefix match: `/api` matches `/api` and `/api/x`, never
    /// `/apix`. The root prefix matches everything.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Upstream path for an inbound path that matched this route.
    pub fn rewrite_path(&self, path: &str) -> String {
        if self.prefix == "/" {
            return path.to_owned();
        }

        let suffix = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);

        if let Some(rewrite) = &self.rewrite {
            return clean_path(&format!("{rewrite}{suffix}"));
        }

        if self.strip_prefix {
            if suffix.is_empty() {
                return "/".to_owned();
            }
            return if suffix.starts_with('/') {
                suffix.to_owned()
            } else {
                format!("/{suffix}")
            };
        }

        path.to_owned()
    }
}

/// Collapses repeated slashes and guarantees a leading one.
fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    out
}

/// The dynamic reverse proxy behind the catch-all.
#[derive(Debug)]
pub struct ProxyEngine {
    mode: GatewayMode,
    routes: Vec<Route>,
    client: ForwardClient,
    timeout: Duration,
    jwt_secret: String,
    circuit: CircuitPolicy,
    metrics: Arc<GatewayMetrics>,
    checker: Arc<HealthChecker>,
}

impl ProxyEngine {
    /// Builds the route table and upstream registry from parsed
    /// definitions. Entries without an upstream or prefix are dropped;
    /// routes sort by descending prefix length, ties keeping input order.
    pub fn new(
        config: &GatewayConfig,
        definitions: Vec<RouteDefinition>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<(Self, Arc<UpstreamRegistry>), GatewayError> {
        let mut registry = UpstreamRegistry::new();
        let mut routes = Vec::new();
        for def in &definitions {
            if def.upstream.is_empty() || def.prefix.is_empty() {
                continue;
            }
            let upstream = registry.intern(&def.upstream, &def.health_path)?;
            routes.push(Route::from_definition(def, upstream));
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        let registry = Arc::new(registry);
        let checker = HealthChecker::new(registry.clone(), config.health_interval)?;
        let client = ForwardClient::new(config.upstream_timeout, config.upstream_retries)?;

        let engine = Self {
            mode: config.gateway_mode,
            routes,
            client,
            timeout: config.upstream_timeout,
            jwt_secret: config.jwt_secret.clone(),
            circuit: CircuitPolicy {
                window: config.circuit_breaker_window,
                threshold: config.circuit_breaker_threshold,
                cooldown: config.circuit_breaker_cooldown,
            },
            metrics,
            checker,
        };
        Ok((engine, registry))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Catch-all entry point, steps in strict order: mode gate, route
    /// match, method filter, availability, auth, forward.
    pub async fn handle(&self, req: Request) -> Response {
        if self.mode != GatewayMode::ProxyAll {
            return GatewayError::NotFound("proxy mode disabled (whitelist)".to_owned())
                .into_response();
        }

        let path = req.uri().path().to_owned();
        let Some(route) = self.match_route(&path) else {
            return GatewayError::NotFound("no upstream mapping".to_owned()).into_response();
        };

        if let Some(methods) = &route.methods {
            if !methods.contains(req.method()) {
                return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
            }
        }

        if let Some(reason) = route.upstream.unavailable_reason(Utc::now()) {
            self.metrics
                .observe(&route.name, StatusCode::SERVICE_UNAVAILABLE, Duration::ZERO);
            return GatewayError::ServiceUnavailable(format!("upstream unavailable: {reason}"))
                .into_response();
        }

        if let Err(err) = self.ensure_auth(&req, route) {
            self.metrics
                .observe(&route.name, err.status_code(), Duration::ZERO);
            return err.into_response();
        }

        self.forward(route, req).await
    }

    fn ensure_auth(&self, req: &Request, route: &Route) -> Result<(), GatewayError> {
        if !route.require_auth {
            return Ok(());
        }

        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if header.is_empty() {
            return Err(GatewayError::Unauthorized(
                "missing Authorization header".to_owned(),
            ));
        }

        if route.auth_strategy != AuthStrategy::Validate {
            return Ok(());
        }

        let Some(token) = extract_bearer(header) else {
            return Err(GatewayError::Unauthorized("missing bearer token".to_owned()));
        };
        if self.jwt_secret.is_empty() {
            return Err(GatewayError::Unauthorized(
                "jwt secret not configured".to_owned(),
            ));
        }
        validate_token(token, &self.jwt_secret)
            .map_err(|_| GatewayError::Unauthorized("invalid token".to_owned()))?;
        Ok(())
    }

    async fn forward(&self, route: &Route, req: Request) -> Response {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        let mut target = route.upstream.url().clone();
        target.set_path(&route.rewrite_path(&path));
        target.set_query(req.uri().query());

        let upstream_req = match self.client.prepare(target, req).await {
            Ok(request) => request,
            Err(err) => {
                self.metrics
                    .observe(&route.name, err.status_code(), Duration::ZERO);
                return err.into_response();
            }
        };

        let result: Result<Response, String> =
            match tokio::time::timeout(self.timeout, self.client.execute(upstream_req)).await {
                Ok(Ok(upstream_resp)) => forward::into_gateway_response(upstream_resp)
                    .await
                    .map_err(|err| err.to_string()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("upstream request timed out".to_owned()),
            };

        match result {
            Ok(response) => {
                let elapsed = start.elapsed();
                let status = response.status();
                self.metrics.observe(&route.name, status, elapsed);
                if route
                    .upstream
                    .record_result(status.as_u16() < 500, Utc::now(), &self.circuit)
                {
                    self.checker.spawn_probe(route.upstream.clone());
                }
                tracing::info!(
                    method = %method,
                    path = %path,
                    route = %route.prefix,
                    upstream = %route.upstream.name(),
                    status = status.as_u16(),
                    latency_ms = elapsed.as_millis() as u64,
                    "proxy request"
                );
                response
            }
            Err(error) => {
                self.metrics
                    .observe(&route.name, StatusCode::BAD_GATEWAY, Duration::ZERO);
                if route
                    .upstream
                    .record_result(false, Utc::now(), &self.circuit)
                {
                    self.checker.spawn_probe(route.upstream.clone());
                }
                tracing::warn!(
                    method = %method,
                    path = %path,
                    route = %route.prefix,
                    upstream = %route.upstream.name(),
                    error = %error,
                    "proxy upstream error"
                );
                GatewayError::BadGateway(error).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn def(prefix: &str, upstream: &str) -> RouteDefinition {
        RouteDefinition {
            prefix: prefix.into(),
            upstream: upstream.into(),
            ..RouteDefinition::default()
        }
    }

    fn engine_with(
        defs: Vec<RouteDefinition>,
        mode: GatewayMode,
    ) -> (ProxyEngine, Arc<UpstreamRegistry>) {
        let config = GatewayConfig {
            gateway_mode: mode,
            jwt_secret: "test-secret".into(),
            ..GatewayConfig::default()
        };
        ProxyEngine::new(&config, defs, Arc::new(GatewayMetrics::new())).unwrap()
    }

    fn get(path: &str) -> Request {
        http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let (engine, _) = engine_with(
            vec![
                def("/api", "http://a:8080"),
                def("/api/bookings", "http://b:8080"),
            ],
            GatewayMode::ProxyAll,
        );

        let route = engine.match_route("/api/bookings/42").unwrap();
        assert_eq!(route.prefix, "/api/bookings");

        let route = engine.match_route("/api/hotels").unwrap();
        assert_eq!(route.prefix, "/api");
    }

    #[test]
    fn prefix_match_respects_segment_boundaries() {
        let (engine, _) = engine_with(
            vec![def("/api/bookings", "http://b:8080")],
            GatewayMode::ProxyAll,
        );

        assert!(engine.match_route("/api/bookings").is_some());
        assert!(engine.match_route("/api/bookings/42").is_some());
        assert!(engine.match_route("/api/bookings-v2").is_none());
    }

    #[test]
    fn equal_length_prefixes_keep_input_order() {
        let mut first = def("/api/a", "http://one:8080");
        first.name = "first".into();
        let mut second = def("/api/b", "http://two:8080");
        second.name = "second".into();
        // Same prefix registered twice: the earlier definition wins.
        let mut shadow = def("/api/a", "http://two:8080");
        shadow.name = "shadow".into();

        let (engine, _) = engine_with(vec![first, second, shadow], GatewayMode::ProxyAll);
        assert_eq!(engine.match_route("/api/a/x").unwrap().name, "first");
    }

    #[test]
    fn root_prefix_matches_everything() {
        let (engine, _) = engine_with(vec![def("/", "http://a:8080")], GatewayMode::ProxyAll);
        assert!(engine.match_route("/anything/at/all").is_some());
        assert!(engine.match_route("/").is_some());
    }

    #[test]
    fn empty_definitions_are_dropped() {
        let (engine, registry) = engine_with(
            vec![
                def("", "http://a:8080"),
                def("/api", ""),
                def("/api/bookings", "http://b:8080"),
            ],
            GatewayMode::ProxyAll,
        );
        assert_eq!(engine.routes().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn routes_sharing_an_upstream_share_status() {
        let (engine, registry) = engine_with(
            vec![
                def("/api/bookings", "http://b:8080"),
                def("/api/reviews", "http://b:8080"),
            ],
            GatewayMode::ProxyAll,
        );
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(
            &engine.routes()[0].upstream,
            &engine.routes()[1].upstream
        ));
    }

    #[test]
    fn rewrite_path_cases() {
        let (engine, _) = engine_with(vec![def("/", "http://a:8080")], GatewayMode::ProxyAll);
        assert_eq!(engine.routes()[0].rewrite_path("/x"), "/x");

        let mut stripped = def("/api/bookings", "http://b:8080");
        stripped.strip_prefix = true;
        let (engine, _) = engine_with(vec![stripped], GatewayMode::ProxyAll);
        assert_eq!(engine.routes()[0].rewrite_path("/api/bookings/42"), "/42");
        assert_eq!(engine.routes()[0].rewrite_path("/api/bookings"), "/");

        let mut rewritten = def("/api/bookings", "http://b:8080");
        rewritten.rewrite = "/v2/bookings".into();
        let (engine, _) = engine_with(vec![rewritten], GatewayMode::ProxyAll);
        assert_eq!(
            engine.routes()[0].rewrite_path("/api/bookings/42"),
            "/v2/bookings/42"
        );

        let mut doubled = def("/api/bookings", "http://b:8080");
        doubled.rewrite = "/v2/bookings/".into();
        let (engine, _) = engine_with(vec![doubled], GatewayMode::ProxyAll);
        assert_eq!(
            engine.routes()[0].rewrite_path("/api/bookings/42"),
            "/v2/bookings/42"
        );
    }

    #[test]
    fn unmodified_path_without_strip_or_rewrite() {
        let (engine, _) = engine_with(
            vec![def("/api/bookings", "http://b:8080")],
            GatewayMode::ProxyAll,
        );
        assert_eq!(
            engine.routes()[0].rewrite_path("/api/bookings/42"),
            "/api/bookings/42"
        );
    }

    #[test]
    fn clean_path_collapses_slashes() {
        assert_eq!(clean_path("/v2//bookings///42"), "/v2/bookings/42");
        assert_eq!(clean_path("v2/bookings"), "/v2/bookings");
        assert_eq!(clean_path(""), "/");
    }

    #[tokio::test]
    async fn whitelist_mode_rejects_catch_all() {
        let (engine, _) = engine_with(
            vec![def("/api/bookings", "http://b:8080")],
            GatewayMode::Whitelist,
        );
        let response = engine.handle(get("/api/bookings/42")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let (engine, _) = engine_with(
            vec![def("/api/bookings", "http://b:8080")],
            GatewayMode::ProxyAll,
        );
        let response = engine.handle(get("/other")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn method_filter_rejects_before_upstream() {
        let mut webhook = def("/api/payments", "http://pay:8080");
        webhook.methods = vec!["POST".into()];
        let (engine, _) = engine_with(vec![webhook], GatewayMode::ProxyAll);

        let response = engine.handle(get("/api/payments/webhook")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn method_filter_is_case_insensitive_in_config() {
        let mut webhook = def("/api/payments", "http://pay:8080");
        webhook.methods = vec!["post".into()];
        let (engine, _) = engine_with(vec![webhook], GatewayMode::ProxyAll);

        let methods = engine.routes()[0].methods.as_ref().unwrap();
        assert!(methods.contains(&Method::POST));
    }

    #[tokio::test]
    async fn unavailable_upstream_returns_503() {
        let (engine, registry) = engine_with(
            vec![def("/api/bookings", "http://b:8080")],
            GatewayMode::ProxyAll,
        );
        registry.all()[0].mark_unhealthy(Utc::now(), "connection refused");

        let response = engine.handle(get("/api/bookings/42")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    fn signed_token(secret: &str) -> String {
        let claims = crate::middleware::auth::Claims {
            user_id: "u-1".into(),
            role: "guest".into(),
            sub: None,
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn auth_gate_forward_requires_header_only() {
        let mut protected = def("/api/bookings", "http://b:8080");
        protected.require_auth = true;
        let (engine, _) = engine_with(vec![protected], GatewayMode::ProxyAll);
        let route = engine.match_route("/api/bookings").unwrap();

        let missing = get("/api/bookings");
        assert!(engine.ensure_auth(&missing, route).is_err());

        let present = http::Request::builder()
            .uri("/api/bookings")
            .header(header::AUTHORIZATION, "Bearer anything-goes")
            .body(Body::empty())
            .unwrap();
        assert!(engine.ensure_auth(&present, route).is_ok());
    }

    #[tokio::test]
    async fn auth_gate_validate_checks_signature() {
        let mut protected = def("/api/bookings", "http://b:8080");
        protected.require_auth = true;
        protected.auth_strategy = "validate".into();
        let (engine, _) = engine_with(vec![protected], GatewayMode::ProxyAll);
        let route = engine.match_route("/api/bookings").unwrap();

        let valid = http::Request::builder()
            .uri("/api/bookings")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", signed_token("test-secret")),
            )
            .body(Body::empty())
            .unwrap();
        assert!(engine.ensure_auth(&valid, route).is_ok());

        let tampered = http::Request::builder()
            .uri("/api/bookings")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", signed_token("wrong-secret")),
            )
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            engine.ensure_auth(&tampered, route),
            Err(GatewayError::Unauthorized(_))
        ));

        let not_bearer = http::Request::builder()
            .uri("/api/bookings")
            .header(header::AUTHORIZATION, "Token abc def")
            .body(Body::empty())
            .unwrap();
        assert!(engine.ensure_auth(&not_bearer, route).is_err());
    }
}
