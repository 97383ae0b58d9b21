//! Route-document loading and normalization.
//!
//! The route table lives in a YAML document with a `routes` list and an
//! optional `fallback` block that expands into one route per mapping key.
//! Both sections are optional; unknown keys are ignored.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::GatewayError;

/// How the gateway treats the bearer token on an authenticated route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Pass the `Authorization` header through untouched.
    #[default]
    Forward,
    /// Verify the token signature locally before forwarding.
    Validate,
}

impl AuthStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Validate => "validate",
        }
    }

    /// Case-insensitive normalization; anything not `validate` forwards.
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("validate") {
            Self::Validate
        } else {
            Self::Forward
        }
    }
}

/// One parsed route entry, before upstream interning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub rewrite: String,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub auth_strategy: String,
    #[serde(default)]
    pub health_path: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RouteFile {
    #[serde(default)]
    routes: Vec<RouteDefinition>,
    #[serde(default)]
    fallback: Option<FallbackDefinition>,
}

/// Shorthand block expanding to one route per mapping key under `base_path`.
#[derive(Debug, Deserialize)]
struct FallbackDefinition {
    #[serde(default)]
    base_path: String,
    #[serde(default)]
    strip_base: bool,
    #[serde(default)]
    health_path: String,
    #[serde(default)]
    mapping: BTreeMap<String, FallbackRoute>,
}

#[derive(Debug, Deserialize)]
struct FallbackRoute {
    #[serde(default)]
    upstream: String,
    #[serde(default)]
    strip_prefix: bool,
    #[serde(default)]
    require_auth: bool,
    #[serde(default)]
    auth_strategy: String,
    #[serde(default)]
    health_path: String,
}

/// Reads the route document at `path` and returns the flat definition list.
pub fn load_route_definitions(path: &Path) -> Result<Vec<RouteDefinition>, GatewayError> {
    let data = std::fs::read_to_string(path)
        .map_err(|err| GatewayError::Config(format!("read {}: {err}", path.display())))?;
    parse_route_definitions(&data)
}

/// Parses a YAML route document, expanding fallback entries in place.
pub fn parse_route_definitions(data: &str) -> Result<Vec<RouteDefinition>, GatewayError> {
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: RouteFile = serde_yaml::from_str(data)
        .map_err(|err| GatewayError::Config(format!("parse routes file: {err}")))?;

    let mut definitions = file.routes;

    if let Some(fallback) = file.fallback {
        if !fallback.base_path.is_empty() && !fallback.mapping.is_empty() {
            let base = {
                let trimmed = fallback.base_path.trim_end_matches('/');
                if trimmed.is_empty() { "/api" } else { trimmed }
            };
            for (key, entry) in &fallback.mapping {
                definitions.push(RouteDefinition {
                    name: format!("fallback-{key}"),
                    prefix: format!("{base}/{key}"),
                    upstream: entry.upstream.clone(),
                    strip_prefix: entry.strip_prefix || fallback.strip_base,
                    rewrite: String::new(),
                    require_auth: entry.require_auth,
                    auth_strategy: entry.auth_strategy.clone(),
                    health_path: first_non_empty(&[
                        &entry.health_path,
                        &fallback.health_path,
                        "/healthz",
                    ]),
                    methods: Vec::new(),
                });
            }
        }
    }

    Ok(definitions)
}

/// Coerces a prefix to start with `/` and drops trailing slashes, keeping
/// `/` itself intact.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return "/".to_owned();
    }
    let mut prefix = if prefix.starts_with('/') {
        prefix.to_owned()
    } else {
        format!("/{prefix}")
    };
    if prefix.len() > 1 {
        while prefix.len() > 1 && prefix.ends_with('/') {
            prefix.pop();
        }
    }
    prefix
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .find(|v| !v.is_empty())
        .map(|v| (*v).to_owned())
        .unwrap_or_default()
}
