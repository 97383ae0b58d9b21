//! Environment-driven gateway configuration.

use figment::{providers::Env, Error as FigmentError, Figment};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variables the gateway reads, lowercased to figment keys.
const ENV_KEYS: &[&str] = &[
    "http_port",
    "gateway_mode",
    "gateway_routes_file",
    "health_interval",
    "upstream_timeout",
    "upstream_retries",
    "circuit_breaker_window",
    "circuit_breaker_threshold",
    "circuit_breaker_cooldown",
    "rate_limit_per_minute",
    "jwt_secret",
    "auth_service_url",
    "aggregate_target_url",
    "booking_service_url",
    "payment_service_url",
];

/// Errors that can occur when loading gateway configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(Box<FigmentError>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Whether the dynamic catch-all proxy is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GatewayMode {
    /// Only explicitly-mounted endpoints are served.
    #[default]
    Whitelist,
    /// Whitelist endpoints plus the route-table-driven catch-all.
    ProxyAll,
}

impl<'de> Deserialize<'de> for GatewayMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_ascii_lowercase().as_str() {
            "proxy_all" => Self::ProxyAll,
            _ => Self::Whitelist,
        })
    }
}

/// Top-level gateway configuration, read from flat environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address, `:8080` form binds all interfaces.
    #[serde(default = "default_http_port")]
    pub http_port: String,

    #[serde(default)]
    pub gateway_mode: GatewayMode,

    /// Route document location.
    #[serde(default = "default_routes_file")]
    pub gateway_routes_file: PathBuf,

    /// Background probe period.
    #[serde(
        default = "default_health_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub health_interval: Duration,

    /// Per-request upstream deadline.
    #[serde(
        default = "default_upstream_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub upstream_timeout: Duration,

    /// Retry attempts for idempotent transport failures.
    #[serde(default = "default_upstream_retries")]
    pub upstream_retries: u32,

    #[serde(
        default = "default_circuit_window",
        deserialize_with = "deserialize_duration"
    )]
    pub circuit_breaker_window: Duration,

    #[serde(default = "default_circuit_threshold")]
    pub circuit_breaker_threshold: f64,

    #[serde(
        default = "default_circuit_cooldown",
        deserialize_with = "deserialize_duration"
    )]
    pub circuit_breaker_cooldown: Duration,

    /// Aggregate-handler pacing, requests per minute.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: i64,

    /// Shared secret for the `validate` auth strategy. Empty means unset.
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default = "default_auth_service_url")]
    pub auth_service_url: String,

    #[serde(default = "default_aggregate_target_url")]
    pub aggregate_target_url: String,

    #[serde(default = "default_booking_service_url")]
    pub booking_service_url: String,

    #[serde(default = "default_payment_service_url")]
    pub payment_service_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            gateway_mode: GatewayMode::default(),
            gateway_routes_file: default_routes_file(),
            health_interval: default_health_interval(),
            upstream_timeout: default_upstream_timeout(),
            upstream_retries: default_upstream_retries(),
            circuit_breaker_window: default_circuit_window(),
            circuit_breaker_threshold: default_circuit_threshold(),
            circuit_breaker_cooldown: default_circuit_cooldown(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            jwt_secret: String::new(),
            auth_service_url: default_auth_service_url(),
            aggregate_target_url: default_aggregate_target_url(),
            booking_service_url: default_booking_service_url(),
            payment_service_url: default_payment_service_url(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Env::raw().only(ENV_KEYS));
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Socket address to bind, coercing the Go-style `:8080` form.
    pub fn listen_addr(&self) -> String {
        if self.http_port.starts_with(':') {
            format!("0.0.0.0{}", self.http_port)
        } else {
            self.http_port.clone()
        }
    }
}

fn default_http_port() -> String {
    ":8080".to_owned()
}

fn default_routes_file() -> PathBuf {
    PathBuf::from("config/routes.yml")
}

const fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_upstream_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_upstream_retries() -> u32 {
    2
}

const fn default_circuit_window() -> Duration {
    Duration::from_secs(30)
}

const fn default_circuit_threshold() -> f64 {
    0.5
}

const fn default_circuit_cooldown() -> Duration {
    Duration::from_secs(15)
}

const fn default_rate_limit_per_minute() -> i64 {
    60
}

fn default_auth_service_url() -> String {
    "http://auth-service:8080".to_owned()
}

fn default_aggregate_target_url() -> String {
    "http://hotel-service:8081".to_owned()
}

fn default_booking_service_url() -> String {
    "http://booking-service:8082".to_owned()
}

fn default_payment_service_url() -> String {
    "http://payment-service:8083".to_owned()
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parses `100ms`, `30s`, `5m`, or a bare number of seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") {
        let ms: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_millis(ms))
    } else if let Some(stripped) = s.strip_suffix('s') {
        let secs: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_secs(secs))
    } else if let Some(stripped) = s.strip_suffix('m') {
        let mins: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        let secs: u64 = s.parse().map_err(|_| format!("invalid duration: {s}"))?;
        Ok(Duration::from_secs(secs))
    }
}
