//! Listener composition: operational endpoints, auth passthrough,
//! aggregate endpoints, and the dynamic catch-all proxy.

use axum::extract::{Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::aggregate::Aggregator;
use crate::config::{GatewayConfig, GatewayMode};
use crate::error::GatewayError;
use crate::metrics::{GatewayMetrics, METRICS_CONTENT_TYPE};
use crate::middleware::AuthLayer;
use crate::proxy::{forward, ForwardClient, ProxyEngine};
use crate::routes::{load_route_definitions, RouteDefinition};
use crate::upstream::{UpstreamRegistry, UpstreamStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(300);

/// Shared gateway state.
pub struct GatewayState {
    pub engine: ProxyEngine,
    pub registry: Arc<UpstreamRegistry>,
    pub metrics: Arc<GatewayMetrics>,
    pub aggregator: Aggregator,
    passthrough: ForwardClient,
    auth_url: Url,
}

/// Run the gateway server until the token is cancelled.
pub async fn run(config: GatewayConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    let loaded = load_route_definitions(&config.gateway_routes_file).and_then(|definitions| {
        if definitions.is_empty() {
            Err(GatewayError::Config("routes file defines no routes".to_owned()))
        } else {
            Ok(definitions)
        }
    });
    let definitions = match loaded {
        Ok(definitions) => definitions,
        Err(err) => {
            if config.gateway_mode == GatewayMode::ProxyAll {
                return Err(GatewayError::Config(format!(
                    "proxy mode requires routes configuration: {err}"
                )));
            }
            tracing::warn!(error = %err, "unable to load routes file, proxy_all disabled");
            Vec::new()
        }
    };

    let (app, state) = build(&config, definitions)?;

    state.engine.health_checker().start(cancel.child_token());
    state.engine.health_checker().wait_until_ready().await;

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    tracing::info!(
        address = %addr,
        routes = state.engine.routes().len(),
        upstreams = state.registry.len(),
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(GatewayError::Io)?;

    Ok(())
}

/// Assembles the router and state from parsed route definitions.
pub fn build(
    config: &GatewayConfig,
    definitions: Vec<RouteDefinition>,
) -> Result<(Router, Arc<GatewayState>), GatewayError> {
    let metrics = Arc::new(GatewayMetrics::new());
    let (engine, registry) = ProxyEngine::new(config, definitions, metrics.clone())?;
    let aggregator = Aggregator::new(
        &config.booking_service_url,
        &config.payment_service_url,
        config.rate_limit_per_minute,
    )?;
    let passthrough = ForwardClient::new(config.upstream_timeout, config.upstream_retries)?;
    let auth_url = Url::parse(config.auth_service_url.trim_end_matches('/'))
        .map_err(|err| GatewayError::Config(format!("invalid auth service url: {err}")))?;

    let state = Arc::new(GatewayState {
        engine,
        registry,
        metrics,
        aggregator,
        passthrough,
        auth_url,
    });

    let app = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/debug/routes", get(debug_routes))
        .route("/healthz", get(healthz))
        .route("/gateway/auth", any(auth_passthrough))
        .route("/gateway/auth/{*rest}", any(auth_passthrough))
        .route(
            "/gateway/aggregate/bookings/{id}",
            get(aggregate_booking).layer(AuthLayer::new(&config.jwt_secret)),
        )
        .fallback(catch_all)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state.clone());

    Ok((app, state))
}

/// Allow-all CORS with credentials: origins and headers mirror the request
/// because the wildcard forms are invalid alongside credentials.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([header::LINK])
        .max_age(PREFLIGHT_MAX_AGE)
}

async fn metrics_endpoint(State(state): State<Arc<GatewayState>>) -> Response {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response()
}

#[derive(Serialize)]
struct DebugRoute {
    name: String,
    prefix: String,
    upstream: String,
    require_auth: bool,
    auth_strategy: &'static str,
    status: UpstreamStatus,
}

async fn debug_routes(State(state): State<Arc<GatewayState>>) -> Json<Vec<DebugRoute>> {
    let payload = state
        .engine
        .routes()
        .iter()
        .map(|route| DebugRoute {
            name: route.name.clone(),
            prefix: route.prefix.clone(),
            upstream: route.upstream.url().to_string(),
            require_auth: route.require_auth,
            auth_strategy: route.auth_strategy.as_str(),
            status: route.upstream.snapshot(),
        })
        .collect();
    Json(payload)
}

#[derive(Serialize)]
struct UpstreamHealth {
    upstream: String,
    status: UpstreamStatus,
}

async fn healthz(State(state): State<Arc<GatewayState>>) -> Response {
    let mut healthy = true;
    let mut payload = Vec::with_capacity(state.registry.len());
    for upstream in state.registry.all() {
        let status = upstream.snapshot();
        if !status.healthy {
            healthy = false;
        }
        payload.push(UpstreamHealth {
            upstream: upstream.url().to_string(),
            status,
        });
    }

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(payload)).into_response()
}

async fn aggregate_booking(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    state.aggregator.booking_summary(&id).await.map(Json)
}

/// Streams `/gateway/auth/**` to the auth service with the prefix stripped.
/// The auth service issues tokens itself, so no JWT validation happens here.
async fn auth_passthrough(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let rest = req
        .uri()
        .path()
        .strip_prefix("/gateway/auth")
        .filter(|rest| !rest.is_empty())
        .unwrap_or("/");

    let mut target = state.auth_url.clone();
    target.set_path(rest);
    target.set_query(req.uri().query());

    let upstream_req = match state.passthrough.prepare(target, req).await {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    match state.passthrough.execute(upstream_req).await {
        Ok(response) => forward::into_gateway_response(response)
            .await
            .unwrap_or_else(|err| GatewayError::BadGateway(err.to_string()).into_response()),
        Err(err) => GatewayError::BadGateway(err.to_string()).into_response(),
    }
}

async fn catch_all(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    state.engine.handle(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;

    fn test_app(mode: GatewayMode, definitions: Vec<RouteDefinition>) -> Router {
        let config = GatewayConfig {
            gateway_mode: mode,
            ..GatewayConfig::default()
        };
        let (app, _state) = build(&config, definitions).unwrap();
        app
    }

    #[tokio::test]
    async fn metrics_endpoint_sets_content_type() {
        let app = test_app(GatewayMode::Whitelist, Vec::new());
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            METRICS_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn healthz_with_no_upstreams_is_ok() {
        let app = test_app(GatewayMode::Whitelist, Vec::new());
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn debug_routes_lists_route_metadata() {
        let definitions = vec![RouteDefinition {
            name: "bookings".into(),
            prefix: "/api/bookings".into(),
            upstream: "http://bk:8080".into(),
            require_auth: true,
            auth_strategy: "validate".into(),
            ..RouteDefinition::default()
        }];
        let app = test_app(GatewayMode::ProxyAll, definitions);

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/debug/routes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed[0]["name"], "bookings");
        assert_eq!(parsed[0]["prefix"], "/api/bookings");
        assert_eq!(parsed[0]["require_auth"], true);
        assert_eq!(parsed[0]["auth_strategy"], "validate");
        assert_eq!(parsed[0]["status"]["healthy"], true);
    }

    #[tokio::test]
    async fn whitelist_mode_catch_all_is_not_found() {
        let app = test_app(GatewayMode::Whitelist, Vec::new());
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/api/bookings/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], "not_found");
    }

    #[tokio::test]
    async fn aggregate_requires_token() {
        let app = test_app(GatewayMode::Whitelist, Vec::new());
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/gateway/aggregate/bookings/abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
